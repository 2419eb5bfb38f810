//! Outbound alerts on connectivity transitions.
//!
//! The monitor loop hands [`NotificationRequest`]s to a bounded queue; a
//! [`NotificationDispatcher`] running in its own task dedups them, delivers
//! through a [`NotificationChannel`] with bounded retries, and records the
//! outcome. Delivery never feeds back into state or persistence.

mod backoff;
mod channel;

pub use backoff::*;
pub use channel::*;

use crate::db::{NotificationKind, NotificationRecord, Store};
use crate::scheduler::Transition;

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Notification delivery errors.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("alert gateway returned status {0}")]
    Status(u16),
    #[error("channel misconfigured: {0}")]
    Config(String),
}

/// Something that can deliver a text alert to a list of recipients.
pub trait NotificationChannel: Send + Sync {
    fn send(
        &self,
        recipients: &[String],
        message: &str,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Alert to send for one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub event_id: Option<i64>,
    /// Outage length, known once the link is restored.
    pub downtime_seconds: Option<i64>,
}

impl NotificationRequest {
    pub fn from_transition(transition: &Transition, event_id: Option<i64>) -> Self {
        match *transition {
            Transition::DownStarted { at } => Self {
                kind: NotificationKind::Down,
                timestamp: at,
                event_id,
                downtime_seconds: None,
            },
            Transition::UpRestored { at, down_since } => Self {
                kind: NotificationKind::Restored,
                timestamp: at,
                event_id,
                downtime_seconds: Some((at - down_since).num_seconds().max(0)),
            },
        }
    }

    /// Human readable alert text.
    pub fn message(&self, link_name: &str) -> String {
        let when = self
            .timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S");
        match self.kind {
            NotificationKind::Down => format!("{} is down since {}.", link_name, when),
            NotificationKind::Restored => match self.downtime_seconds {
                Some(secs) => format!(
                    "{} is back up at {}. Downtime duration: {}.",
                    link_name,
                    when,
                    format_duration(secs)
                ),
                None => format!("{} is back up at {}.", link_name, when),
            },
        }
    }
}

/// Render seconds as `1h 02m 03s` / `2m 05s` / `45s`.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub recipients: Vec<String>,
    pub link_name: String,
    /// Same-kind alerts closer than this to the last delivered one are dropped.
    pub cooldown: ChronoDuration,
    pub retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            link_name: "Internet".to_string(),
            cooldown: ChronoDuration::minutes(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Suppressed,
    Delivered { attempts: u32 },
    Failed { attempts: u32 },
}

pub struct NotificationDispatcher<C> {
    channel: C,
    store: Arc<Store>,
    settings: DispatchSettings,
    last_sent: HashMap<NotificationKind, DateTime<Utc>>,
}

impl<C: NotificationChannel> NotificationDispatcher<C> {
    /// Create a dispatcher, restoring dedup state from the notification log.
    pub fn new(channel: C, store: Arc<Store>, settings: DispatchSettings) -> Self {
        let last_sent = match store.last_delivered_notifications() {
            Ok(rows) => rows.into_iter().collect(),
            Err(e) => {
                tracing::warn!("Notifier: could not load notification history: {}", e);
                HashMap::new()
            }
        };

        Self {
            channel,
            store,
            settings,
            last_sent,
        }
    }

    /// Drain the queue until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<NotificationRequest>) {
        while let Some(request) = rx.recv().await {
            self.dispatch(&request).await;
        }
        tracing::debug!("Notifier: queue closed, stopping");
    }

    /// Dedup, deliver with retries, and record the outcome.
    pub async fn dispatch(&mut self, request: &NotificationRequest) -> DispatchOutcome {
        if self.is_duplicate(request) {
            tracing::info!(
                "Notifier: suppressing {} alert at {} (within {}s cooldown)",
                request.kind,
                request.timestamp,
                self.settings.cooldown.num_seconds()
            );
            return DispatchOutcome::Suppressed;
        }

        let message = request.message(&self.settings.link_name);
        let outcome = self.deliver(&message).await;

        let (delivered, attempts) = match outcome {
            DispatchOutcome::Delivered { attempts } => {
                self.last_sent.insert(request.kind, request.timestamp);
                tracing::info!("Notifier: sent {} alert after {} attempt(s)", request.kind, attempts);
                (true, attempts)
            }
            DispatchOutcome::Failed { attempts } => {
                tracing::error!(
                    "Notifier: giving up on {} alert after {} attempt(s)",
                    request.kind,
                    attempts
                );
                (false, attempts)
            }
            DispatchOutcome::Suppressed => return outcome,
        };

        let record = NotificationRecord {
            kind: request.kind,
            event_time: request.timestamp,
            event_id: request.event_id,
            delivered,
            attempts,
        };
        if let Err(e) = self.store.record_notification(&record) {
            tracing::error!("Notifier: failed to record notification: {}", e);
        }

        outcome
    }

    fn is_duplicate(&self, request: &NotificationRequest) -> bool {
        self.last_sent
            .get(&request.kind)
            .map_or(false, |last| (request.timestamp - *last).abs() < self.settings.cooldown)
    }

    async fn deliver(&self, message: &str) -> DispatchOutcome {
        let retry = self.settings.retry;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.channel.send(&self.settings.recipients, message).await {
                Ok(()) => return DispatchOutcome::Delivered { attempts },
                Err(e) if attempts > retry.max_retries => {
                    tracing::warn!("Notifier: attempt {} failed: {}", attempts, e);
                    return DispatchOutcome::Failed { attempts };
                }
                Err(e) => {
                    let delay = retry.delay(attempts);
                    tracing::warn!(
                        "Notifier: attempt {} failed: {}, retrying in {:?}",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
