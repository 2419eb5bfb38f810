//! Configuration module for linkwatch.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Values that fail to parse are ignored with a warning.

use crate::notify::{DispatchSettings, RetryPolicy};
use crate::probe::{duration_from_secs, ProbeKind, ReachabilityPolicy, TargetConfig, TargetRole};
use crate::scheduler::Thresholds;

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Longest retention accepted, about a century.
const MAX_RETENTION_DAYS: u32 = 36_500;

const DEFAULT_TARGETS: &str = "gateway:ping:192.168.1.1,anchor:ping:8.8.8.8";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "downtime_logs.db")
    pub db_path: String,
    /// Used when the primary path's directory is missing, e.g. unmounted USB storage
    pub fallback_db_path: Option<String>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub targets: Vec<TargetConfig>,
    pub policy: ReachabilityPolicy,
    /// Network interface to bind probes to
    pub interface: Option<String>,
    pub down_after: u32,
    pub up_after: u32,
    pub link_name: String,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub recipients: Vec<String>,
    pub cooldown: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Unset means intervals are kept forever
    pub retention_days: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let probe_timeout = Duration::from_secs(5);
        Self {
            http_port: 8080,
            db_path: "downtime_logs.db".to_string(),
            fallback_db_path: None,
            probe_interval: Duration::from_secs(30),
            probe_timeout,
            targets: default_targets(probe_timeout),
            policy: ReachabilityPolicy::Any,
            interface: None,
            down_after: 2,
            up_after: 1,
            link_name: "Internet".to_string(),
            webhook_url: None,
            webhook_token: None,
            recipients: Vec::new(),
            cooldown: Duration::from_secs(300),
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(60_000),
            retention_days: None,
        }
    }
}

fn default_targets(timeout: Duration) -> Vec<TargetConfig> {
    vec![
        TargetConfig::new(TargetRole::Gateway, ProbeKind::Ping, "192.168.1.1", timeout),
        TargetConfig::new(TargetRole::Anchor, ProbeKind::Ping, "8.8.8.8", timeout),
    ]
}

impl ServerConfig {
    /// Load configuration from `LINKWATCH_*` environment variables.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        set_parsed(&get, "LINKWATCH_HTTP_PORT", &mut cfg.http_port);
        if let Some(path) = get("LINKWATCH_DB_PATH") {
            cfg.db_path = path;
        }
        cfg.fallback_db_path = get("LINKWATCH_FALLBACK_DB_PATH");

        if let Some(secs) = parse_positive_secs(&get, "LINKWATCH_PROBE_INTERVAL_SECS") {
            cfg.probe_interval = secs;
        }
        if let Some(secs) = parse_positive_secs(&get, "LINKWATCH_PROBE_TIMEOUT_SECS") {
            cfg.probe_timeout = secs;
        }

        cfg.targets = match get("LINKWATCH_TARGETS") {
            Some(list) => parse_targets(&list, cfg.probe_timeout),
            None => default_targets(cfg.probe_timeout),
        };
        if cfg.targets.is_empty() {
            tracing::warn!("No valid probe targets configured, using defaults: {}", DEFAULT_TARGETS);
            cfg.targets = default_targets(cfg.probe_timeout);
        }

        set_parsed(&get, "LINKWATCH_POLICY", &mut cfg.policy);
        cfg.interface = get("LINKWATCH_INTERFACE");
        set_parsed(&get, "LINKWATCH_DOWN_AFTER", &mut cfg.down_after);
        set_parsed(&get, "LINKWATCH_UP_AFTER", &mut cfg.up_after);
        if let Some(name) = get("LINKWATCH_LINK_NAME") {
            cfg.link_name = name;
        }

        cfg.webhook_url = get("LINKWATCH_NOTIFY_WEBHOOK_URL");
        cfg.webhook_token = get("LINKWATCH_NOTIFY_TOKEN");
        if let Some(list) = get("LINKWATCH_NOTIFY_RECIPIENTS") {
            cfg.recipients = list
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
        }

        let mut cooldown_secs = cfg.cooldown.as_secs();
        set_parsed(&get, "LINKWATCH_NOTIFY_COOLDOWN_SECS", &mut cooldown_secs);
        cfg.cooldown = Duration::from_secs(cooldown_secs);
        set_parsed(&get, "LINKWATCH_NOTIFY_MAX_RETRIES", &mut cfg.max_retries);

        let mut base_ms = cfg.backoff_base.as_millis() as u64;
        let mut max_ms = cfg.backoff_max.as_millis() as u64;
        set_parsed(&get, "LINKWATCH_NOTIFY_BACKOFF_BASE_MS", &mut base_ms);
        set_parsed(&get, "LINKWATCH_NOTIFY_BACKOFF_MAX_MS", &mut max_ms);
        cfg.backoff_base = Duration::from_millis(base_ms);
        cfg.backoff_max = Duration::from_millis(max_ms.max(base_ms));

        if let Some(days) = get("LINKWATCH_RETENTION_DAYS") {
            match days.parse::<u32>() {
                Ok(d) if d <= MAX_RETENTION_DAYS => cfg.retention_days = Some(d),
                _ => tracing::warn!("Ignoring invalid LINKWATCH_RETENTION_DAYS={:?}", days),
            }
        }

        cfg
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.down_after, self.up_after)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            recipients: self.recipients.clone(),
            link_name: self.link_name.clone(),
            cooldown: chrono::Duration::from_std(self.cooldown)
                .unwrap_or_else(|_| chrono::Duration::days(MAX_RETENTION_DAYS as i64)),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base: self.backoff_base,
                max: self.backoff_max,
            },
        }
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days.map(|d| chrono::Duration::days(d as i64))
    }

    /// Pick the database path, falling back when the primary directory is absent.
    pub fn resolve_db_path(&self) -> PathBuf {
        let primary = PathBuf::from(&self.db_path);
        let dir_exists = match primary.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.is_dir(),
            _ => true,
        };
        if dir_exists {
            return primary;
        }

        match &self.fallback_db_path {
            Some(fallback) => {
                tracing::warn!(
                    "Database directory for {} is missing, using fallback {}",
                    self.db_path,
                    fallback
                );
                Path::new(fallback).to_path_buf()
            }
            None => primary,
        }
    }
}

fn set_parsed<T, G>(get: &G, key: &str, slot: &mut T)
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", key, raw),
        }
    }
}

fn parse_positive_secs<G>(get: &G, key: &str) -> Option<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key)?;
    match raw.parse::<f64>().ok().and_then(duration_from_secs) {
        Some(duration) => Some(duration),
        None => {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

fn parse_targets(list: &str, default_timeout: Duration) -> Vec<TargetConfig> {
    list.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| match TargetConfig::parse(entry, default_timeout) {
            Ok(target) => Some(target),
            Err(e) => {
                tracing::warn!("Ignoring probe target {:?}: {}", entry, e);
                None
            }
        })
        .collect()
}
