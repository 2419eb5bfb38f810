//! Concrete alert channels.

use super::{NotificationChannel, NotifyError};

use serde::Serialize;
use std::time::Duration;

/// Posts alerts as JSON to an SMS/push gateway.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipients: &'a [String],
    message: &'a str,
}

impl WebhookChannel {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self, NotifyError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NotifyError::Config(format!("webhook URL must be http(s): {}", url)));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            token,
        })
    }
}

impl NotificationChannel for WebhookChannel {
    async fn send(&self, recipients: &[String], message: &str) -> Result<(), NotifyError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { recipients, message });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogChannel;

impl NotificationChannel for LogChannel {
    async fn send(&self, recipients: &[String], message: &str) -> Result<(), NotifyError> {
        tracing::warn!("ALERT ({} recipient(s)): {}", recipients.len(), message);
        Ok(())
    }
}

/// The channel picked from configuration at startup.
#[derive(Debug, Clone)]
pub enum AlertChannel {
    Webhook(WebhookChannel),
    Log(LogChannel),
}

impl NotificationChannel for AlertChannel {
    async fn send(&self, recipients: &[String], message: &str) -> Result<(), NotifyError> {
        match self {
            Self::Webhook(c) => c.send(recipients, message).await,
            Self::Log(c) => c.send(recipients, message).await,
        }
    }
}
