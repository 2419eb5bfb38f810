//! Probe module for reachability checks.
//!
//! Supports Ping, TCP and HTTP probes. A [`Prober`] runs every configured
//! target once per cycle and folds the outcomes into a single [`ProbeResult`].

mod http;
mod ping;
mod tcp;

pub use http::*;
pub use ping::*;
pub use tcp::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Which failure domain a target tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    /// Local-segment device (router, firewall).
    Gateway,
    /// External host beyond the uplink.
    Anchor,
}

impl FromStr for TargetRole {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gateway" | "local" => Ok(Self::Gateway),
            "anchor" | "external" => Ok(Self::Anchor),
            other => Err(ProbeError::Config(format!("unknown target role: {}", other))),
        }
    }
}

/// Transport used to check a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Ping,
    Tcp,
    Http,
}

impl FromStr for ProbeKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" | "icmp" => Ok(Self::Ping),
            "tcp" => Ok(Self::Tcp),
            "http" => Ok(Self::Http),
            other => Err(ProbeError::Config(format!("unknown probe type: {}", other))),
        }
    }
}

/// A single probe target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub role: TargetRole,
    pub kind: ProbeKind,
    pub address: String,
    pub timeout: Duration,
}

impl TargetConfig {
    pub fn new(role: TargetRole, kind: ProbeKind, address: &str, timeout: Duration) -> Self {
        Self {
            role,
            kind,
            address: address.to_string(),
            timeout,
        }
    }

    /// Parse a `role:kind:address[@timeout_secs]` entry.
    ///
    /// The address keeps any further colons, so `anchor:tcp:1.1.1.1:53` and
    /// `anchor:tcp:[2606:4700::1111]:53@2` both work.
    pub fn parse(entry: &str, default_timeout: Duration) -> Result<Self, ProbeError> {
        let mut parts = entry.trim().splitn(3, ':');
        let role = parts.next().unwrap_or_default().parse()?;
        let kind = parts
            .next()
            .ok_or_else(|| ProbeError::Config(format!("missing probe type in {:?}", entry)))?
            .parse()?;
        let rest = parts
            .next()
            .ok_or_else(|| ProbeError::Config(format!("missing address in {:?}", entry)))?;

        let (address, timeout) = match rest.rsplit_once('@') {
            Some((addr, secs)) => {
                let timeout = secs
                    .parse()
                    .ok()
                    .and_then(duration_from_secs)
                    .ok_or_else(|| ProbeError::Config(format!("invalid timeout in {:?}", entry)))?;
                (addr, timeout)
            }
            None => (rest, default_timeout),
        };

        if address.is_empty() {
            return Err(ProbeError::Config(format!("missing address in {:?}", entry)));
        }

        Ok(Self::new(role, kind, address, timeout))
    }

    /// Display name used in logs and the status API.
    pub fn name(&self) -> String {
        format!("{:?}:{}", self.role, self.address).to_lowercase()
    }
}

/// Shortest period or timeout accepted from configuration.
pub const MIN_CONFIG_DURATION: Duration = Duration::from_millis(1);

/// Convert configured seconds to a `Duration`.
///
/// `None` for values that are negative, non-finite, too large to represent,
/// or below [`MIN_CONFIG_DURATION`].
pub fn duration_from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| *d >= MIN_CONFIG_DURATION)
}

/// How per-target outcomes combine into one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityPolicy {
    /// Reachable if at least one target responds.
    #[default]
    Any,
    /// Reachable only if every target responds.
    All,
}

impl FromStr for ReachabilityPolicy {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "or" => Ok(Self::Any),
            "all" | "and" => Ok(Self::All),
            other => Err(ProbeError::Config(format!("unknown reachability policy: {}", other))),
        }
    }
}

impl ReachabilityPolicy {
    pub fn evaluate(&self, outcomes: &[TargetOutcome]) -> bool {
        if outcomes.is_empty() {
            return false;
        }
        match self {
            Self::Any => outcomes.iter().any(TargetOutcome::reachable),
            Self::All => outcomes.iter().all(TargetOutcome::reachable),
        }
    }
}

/// Outcome of probing one target in one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub name: String,
    pub role: TargetRole,
    pub kind: ProbeKind,
    /// Latency in nanoseconds, `None` when the target did not respond.
    pub latency_ns: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn reachable(&self) -> bool {
        self.latency_ns.is_some()
    }
}

/// Which side of the uplink is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDomain {
    /// Gateway unreachable while the anchor still answers.
    Local,
    /// Gateway answers but the anchor does not.
    Upstream,
    /// Nothing answers.
    Both,
}

/// Verdict of one probe cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub time: DateTime<Utc>,
    pub reachable: bool,
    pub outcomes: Vec<TargetOutcome>,
}

impl ProbeResult {
    pub fn from_outcomes(
        time: DateTime<Utc>,
        outcomes: Vec<TargetOutcome>,
        policy: ReachabilityPolicy,
    ) -> Self {
        Self {
            time,
            reachable: policy.evaluate(&outcomes),
            outcomes,
        }
    }

    /// A result without per-target detail.
    #[cfg(test)]
    pub fn verdict(time: DateTime<Utc>, reachable: bool) -> Self {
        Self {
            time,
            reachable,
            outcomes: Vec::new(),
        }
    }

    /// A role counts as failed when it has targets and none of them answered.
    pub fn failure_domain(&self) -> Option<FailureDomain> {
        let role_down = |role: TargetRole| {
            let mut targets = self.outcomes.iter().filter(|o| o.role == role).peekable();
            targets.peek().is_some() && targets.all(|o| !o.reachable())
        };

        match (role_down(TargetRole::Gateway), role_down(TargetRole::Anchor)) {
            (true, true) => Some(FailureDomain::Both),
            (true, false) => Some(FailureDomain::Local),
            (false, true) => Some(FailureDomain::Upstream),
            (false, false) if !self.reachable => Some(FailureDomain::Both),
            (false, false) => None,
        }
    }
}

/// Anything that yields one verdict per cycle.
pub trait Probe: Send + Sync {
    fn probe(&self) -> impl Future<Output = ProbeResult> + Send;
}

/// Probes every configured target concurrently.
#[derive(Debug, Clone)]
pub struct Prober {
    targets: Vec<TargetConfig>,
    policy: ReachabilityPolicy,
    interface: Option<String>,
}

impl Prober {
    pub fn new(
        targets: Vec<TargetConfig>,
        policy: ReachabilityPolicy,
        interface: Option<String>,
    ) -> Self {
        Self {
            targets,
            policy,
            interface,
        }
    }
}

impl Probe for Prober {
    async fn probe(&self) -> ProbeResult {
        let time = Utc::now();
        let mut set = JoinSet::new();

        for (idx, target) in self.targets.iter().enumerate() {
            let target = target.clone();
            let interface = self.interface.clone();
            set.spawn(async move {
                let result = run_probe(&target, interface.as_deref()).await;
                (idx, target, result)
            });
        }

        let mut outcomes = Vec::with_capacity(self.targets.len());
        while let Some(joined) = set.join_next().await {
            let (idx, target, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("Probe task failed: {}", e);
                    continue;
                }
            };

            let (latency_ns, error) = match result {
                Ok(latency) => (Some(latency), None),
                Err(e) => {
                    tracing::debug!("Probe {} unreachable: {}", target.name(), e);
                    (None, Some(e.to_string()))
                }
            };

            outcomes.push((
                idx,
                TargetOutcome {
                    name: target.name(),
                    role: target.role,
                    kind: target.kind,
                    latency_ns,
                    error,
                },
            ));
        }

        outcomes.sort_by_key(|(idx, _)| *idx);
        let outcomes = outcomes.into_iter().map(|(_, o)| o).collect();
        ProbeResult::from_outcomes(time, outcomes, self.policy)
    }
}

/// Run a probe against one target.
///
/// Returns latency in nanoseconds on success. Never takes longer than the
/// target timeout.
pub async fn run_probe(target: &TargetConfig, interface: Option<&str>) -> Result<f64, ProbeError> {
    // Add jitter so gateway and anchor probes don't fire in lockstep
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let attempt = async {
        match target.kind {
            ProbeKind::Http => run_http_probe(&target.address, target.timeout).await,
            ProbeKind::Tcp => run_tcp_probe(&target.address, target.timeout, interface).await,
            ProbeKind::Ping => run_ping_probe(&target.address, target.timeout, interface).await,
        }
    };

    let result = tokio::time::timeout(target.timeout, attempt)
        .await
        .unwrap_or(Err(ProbeError::Timeout(target.timeout)));

    // Enforce timeout check
    if let Ok(latency) = &result {
        if *latency >= target.timeout.as_nanos() as f64 {
            return Err(ProbeError::Timeout(target.timeout));
        }
    }

    result
}
