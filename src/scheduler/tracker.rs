//! Connectivity state machine.
//!
//! ```text
//! Up   → Down: `down_after` consecutive unreachable results
//! Down → Up:   `up_after` consecutive reachable results
//! ```
//!
//! Transitions are a pure function of the current state, the streak counters
//! and the next [`ProbeResult`]; no clocks are read here.

use crate::probe::{FailureDomain, ProbeResult};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Logical connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Up,
    Down,
}

/// Edge emitted by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `at` is the first failing probe of the debounce run.
    DownStarted { at: DateTime<Utc> },
    /// `at` is the confirming reachable probe.
    UpRestored {
        at: DateTime<Utc>,
        down_since: DateTime<Utc>,
    },
}

impl Transition {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::DownStarted { at } | Self::UpRestored { at, .. } => *at,
        }
    }
}

/// Debounce thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub down_after: u32,
    pub up_after: u32,
}

impl Thresholds {
    pub fn new(down_after: u32, up_after: u32) -> Self {
        Self {
            down_after: down_after.max(1),
            up_after: up_after.max(1),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(2, 1)
    }
}

#[derive(Debug)]
pub struct StateTracker {
    thresholds: Thresholds,
    state: ConnectivityState,
    failures: u32,
    first_failure: Option<DateTime<Utc>>,
    successes: u32,
    down_since: Option<DateTime<Utc>>,
    last_transition: Option<DateTime<Utc>>,
    last_failure_domain: Option<FailureDomain>,
    observed: bool,
}

impl StateTracker {
    /// A fresh tracker, initially `Up`.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            state: ConnectivityState::Up,
            failures: 0,
            first_failure: None,
            successes: 0,
            down_since: None,
            last_transition: None,
            last_failure_domain: None,
            observed: false,
        }
    }

    /// Resume in `Down` after a restart found an open interval.
    pub fn resume_down(&mut self, since: DateTime<Utc>) {
        self.state = ConnectivityState::Down;
        self.down_since = Some(since);
        self.last_transition = Some(since);
        self.failures = 0;
        self.first_failure = None;
        self.successes = 0;
    }

    /// Feed one probe result; returns the transition it confirmed, if any.
    pub fn observe(&mut self, result: &ProbeResult) -> Option<Transition> {
        self.observed = true;
        if !result.reachable {
            self.last_failure_domain = result.failure_domain();
        }

        match (self.state, result.reachable) {
            (ConnectivityState::Up, true) => {
                self.failures = 0;
                self.first_failure = None;
                None
            }
            (ConnectivityState::Up, false) => {
                self.failures += 1;
                let first = *self.first_failure.get_or_insert(result.time);
                if self.failures < self.thresholds.down_after {
                    return None;
                }

                self.state = ConnectivityState::Down;
                self.failures = 0;
                self.first_failure = None;
                self.successes = 0;
                self.down_since = Some(first);
                self.last_transition = Some(first);
                Some(Transition::DownStarted { at: first })
            }
            (ConnectivityState::Down, false) => {
                self.successes = 0;
                None
            }
            (ConnectivityState::Down, true) => {
                self.successes += 1;
                if self.successes < self.thresholds.up_after {
                    return None;
                }

                let down_since = self.down_since.take().unwrap_or(result.time);
                self.state = ConnectivityState::Up;
                self.successes = 0;
                self.last_transition = Some(result.time);
                Some(Transition::UpRestored {
                    at: result.time,
                    down_since,
                })
            }
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// False until the first probe cycle after startup has been observed.
    pub fn is_settled(&self) -> bool {
        self.observed
    }

    pub fn last_transition(&self) -> Option<DateTime<Utc>> {
        self.last_transition
    }

    pub fn down_since(&self) -> Option<DateTime<Utc>> {
        self.down_since
    }

    /// Failure domain of the most recent unreachable probe.
    pub fn last_failure_domain(&self) -> Option<FailureDomain> {
        self.last_failure_domain
    }
}
