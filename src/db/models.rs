//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// Lifetime of a downtime interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Interval {
    /// The outage is still ongoing.
    Open { start: DateTime<Utc> },
    Closed {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl Interval {
    pub fn start(&self) -> DateTime<Utc> {
        match self {
            Self::Open { start } | Self::Closed { start, .. } => *start,
        }
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Open { .. } => None,
            Self::Closed { end, .. } => Some(*end),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// A recorded outage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowntimeEvent {
    pub id: i64,
    /// Name of the monitored link, e.g. `Internet`.
    pub link_name: String,
    pub interval: Interval,
    /// Set when the close time preceded the start and was clamped.
    pub clock_skew: bool,
}

impl DowntimeEvent {
    pub fn start(&self) -> DateTime<Utc> {
        self.interval.start()
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.interval.end()
    }

    pub fn is_open(&self) -> bool {
        self.interval.is_open()
    }

    /// Whole seconds between start and end, `None` while ongoing.
    pub fn duration_seconds(&self) -> Option<i64> {
        self.end().map(|end| (end - self.start()).num_seconds())
    }

    /// Whether the event intersects `range`; open events extend indefinitely.
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.start() < range.end && self.end().map_or(true, |end| end > range.start)
    }

    /// Seconds of this event that fall inside `range`, measuring an open
    /// event up to `now`.
    pub fn seconds_within(&self, range: &TimeRange, now: DateTime<Utc>) -> f64 {
        let end = self.end().unwrap_or(now).min(range.end);
        let start = self.start().max(range.start);
        if end <= start {
            return 0.0;
        }
        (end - start).num_milliseconds() as f64 / 1000.0
    }
}

/// Kind of alert sent on a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Down,
    Restored,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Restored => "restored",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "down" => Ok(Self::Down),
            "restored" => Ok(Self::Restored),
            other => Err(format!("unknown notification kind: {}", other)),
        }
    }
}

/// One delivery attempt series, as recorded in the notification log.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub kind: NotificationKind,
    /// Timestamp of the transition that triggered the alert.
    pub event_time: DateTime<Utc>,
    pub event_id: Option<i64>,
    pub delivered: bool,
    pub attempts: u32,
}
