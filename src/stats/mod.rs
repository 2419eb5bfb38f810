//! Downtime aggregation over the fixed reporting windows.

mod query;

pub use query::*;

use crate::db::{DbError, DowntimeEvent, Store, TimeRange};

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Timelike, Utc};
use serde::Serialize;
use std::sync::Arc;

/// A fixed reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationWindow {
    /// Since local midnight.
    Today,
    LastDay,
    LastWeek,
    LastMonth,
}

impl AggregationWindow {
    pub const ALL: [AggregationWindow; 4] = [
        AggregationWindow::Today,
        AggregationWindow::LastDay,
        AggregationWindow::LastWeek,
        AggregationWindow::LastMonth,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::LastDay => "Last 24 Hours",
            Self::LastWeek => "Last 7 Days",
            Self::LastMonth => "Last 30 Days",
        }
    }

    /// Resolve to `[start, now)`. `Today` starts at midnight in `now`'s zone.
    pub fn range<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> TimeRange {
        let end = now.with_timezone(&Utc);
        let start = match self {
            Self::Today => local_midnight(now),
            Self::LastDay => end - ChronoDuration::hours(24),
            Self::LastWeek => end - ChronoDuration::days(7),
            Self::LastMonth => end - ChronoDuration::days(30),
        };
        TimeRange::new(start, end)
    }
}

/// Start of the calendar day containing `now`, in `now`'s time zone.
fn local_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| now.timezone().from_local_datetime(&naive).earliest());
    match midnight {
        Some(midnight) => midnight.with_timezone(&Utc),
        // Midnight skipped by a DST jump: count from the wall-clock offset
        None => {
            now.with_timezone(&Utc) - ChronoDuration::seconds(now.num_seconds_from_midnight() as i64)
        }
    }
}

/// Downtime totals for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationResult {
    pub window: AggregationWindow,
    pub downtime_count: u64,
    pub total_downtime_seconds: f64,
}

impl AggregationResult {
    pub fn empty(window: AggregationWindow) -> Self {
        Self {
            window,
            downtime_count: 0,
            total_downtime_seconds: 0.0,
        }
    }
}

/// Sum the clipped contribution of `events` to `window`.
///
/// An event spanning a boundary counts once in every window it touches.
pub fn summarize(
    window: AggregationWindow,
    range: &TimeRange,
    events: &[DowntimeEvent],
    now: DateTime<Utc>,
) -> AggregationResult {
    let mut result = AggregationResult::empty(window);
    for event in events.iter().filter(|e| e.overlaps(range)) {
        result.downtime_count += 1;
        result.total_downtime_seconds += event.seconds_within(range, now);
    }
    result
}

/// Computes downtime statistics on demand from the store.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<Store>,
}

impl AggregationEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Aggregate one window against the current local time.
    pub fn aggregate(&self, window: AggregationWindow) -> Result<AggregationResult, DbError> {
        self.aggregate_at(window, &Local::now())
    }

    pub fn aggregate_at<Tz: TimeZone>(
        &self,
        window: AggregationWindow,
        now: &DateTime<Tz>,
    ) -> Result<AggregationResult, DbError> {
        let range = window.range(now);
        let events = self.store.query_intervals(range)?;
        Ok(summarize(window, &range, &events, now.with_timezone(&Utc)))
    }

    /// Aggregate every window from a single read of the store.
    pub fn aggregate_all_at<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
    ) -> Result<Vec<AggregationResult>, DbError> {
        let ranges: Vec<_> = AggregationWindow::ALL
            .iter()
            .map(|w| (*w, w.range(now)))
            .collect();

        let widest = ranges.iter().fold(
            TimeRange::new(now.with_timezone(&Utc), now.with_timezone(&Utc)),
            |acc, (_, r)| TimeRange::new(acc.start.min(r.start), acc.end.max(r.end)),
        );

        let events = self.store.query_intervals(widest)?;
        let now = now.with_timezone(&Utc);

        Ok(ranges
            .iter()
            .map(|(window, range)| summarize(*window, range, &events, now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use tempfile::NamedTempFile;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn engine() -> (NamedTempFile, Arc<Store>, AggregationEngine) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let engine = AggregationEngine::new(store.clone());
        (tmp, store, engine)
    }

    fn record(store: &Store, start: DateTime<Utc>, end: DateTime<Utc>) {
        let id = store.open_interval(start).unwrap();
        store.close_interval(id, end).unwrap();
    }

    #[test]
    fn test_window_ranges() {
        let now = t(0);
        assert_eq!(
            AggregationWindow::Today.range(&now),
            TimeRange::new(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap(), now)
        );
        assert_eq!(AggregationWindow::LastDay.range(&now).start, now - ChronoDuration::hours(24));
        assert_eq!(AggregationWindow::LastWeek.range(&now).start, now - ChronoDuration::days(7));
        assert_eq!(AggregationWindow::LastMonth.range(&now).start, now - ChronoDuration::days(30));
    }

    #[test]
    fn test_today_uses_local_midnight() {
        // 01:30 at UTC+2 is 23:30 UTC the previous day
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 3, 10, 1, 30, 0).unwrap();
        let range = AggregationWindow::Today.range(&now);
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 3, 9, 22, 0, 0).unwrap());
        assert_eq!(range.end, Utc.with_ymd_and_hms(2024, 3, 9, 23, 30, 0).unwrap());
    }

    #[test]
    fn test_summarize_clips_to_window() {
        let (_tmp, store, _engine) = engine();
        record(&store, t(0), t(90));

        let range = TimeRange::new(t(30), t(60));
        let events = store.query_intervals(range).unwrap();
        let result = summarize(AggregationWindow::LastDay, &range, &events, t(1000));
        assert_eq!(result.downtime_count, 1);
        assert_eq!(result.total_downtime_seconds, 30.0);
    }

    #[test]
    fn test_boundary_spanning_event_counts_in_each_window() {
        let (_tmp, store, engine) = engine();
        // Starts yesterday 23:50 UTC, ends today 00:10 UTC
        let start = Utc.with_ymd_and_hms(2024, 3, 9, 23, 50, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 0, 10, 0).unwrap();
        record(&store, start, end);

        let now = t(0);
        let today = engine.aggregate_at(AggregationWindow::Today, &now).unwrap();
        assert_eq!(today.downtime_count, 1);
        assert_eq!(today.total_downtime_seconds, 600.0);

        let day = engine.aggregate_at(AggregationWindow::LastDay, &now).unwrap();
        assert_eq!(day.downtime_count, 1);
        assert_eq!(day.total_downtime_seconds, 1200.0);
    }

    #[test]
    fn test_events_outside_window_are_ignored() {
        let (_tmp, store, engine) = engine();
        record(&store, t(-40 * 86400), t(-40 * 86400 + 60));
        record(&store, t(-3 * 86400), t(-3 * 86400 + 120));
        record(&store, t(-600), t(-300));

        let now = t(0);
        let results = engine.aggregate_all_at(&now).unwrap();
        let by_window: Vec<_> = results
            .iter()
            .map(|r| (r.window, r.downtime_count, r.total_downtime_seconds))
            .collect();
        assert_eq!(
            by_window,
            vec![
                (AggregationWindow::Today, 1, 300.0),
                (AggregationWindow::LastDay, 1, 300.0),
                (AggregationWindow::LastWeek, 2, 420.0),
                (AggregationWindow::LastMonth, 2, 420.0),
            ]
        );
    }

    #[test]
    fn test_aggregate_is_idempotent_without_writes() {
        let (_tmp, store, engine) = engine();
        record(&store, t(-100), t(-50));

        let now = t(0);
        let first = engine.aggregate_all_at(&now).unwrap();
        let second = engine.aggregate_all_at(&now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_open_interval_grows_with_time() {
        let (_tmp, store, engine) = engine();
        store.open_interval(t(-60)).unwrap();

        let earlier = engine.aggregate_at(AggregationWindow::LastDay, &t(0)).unwrap();
        let later = engine.aggregate_at(AggregationWindow::LastDay, &t(5)).unwrap();
        assert_eq!(earlier.downtime_count, 1);
        assert_eq!(earlier.total_downtime_seconds, 60.0);
        assert!(later.total_downtime_seconds > earlier.total_downtime_seconds);
        assert_eq!(later.total_downtime_seconds, 65.0);
    }

    #[test]
    fn test_wall_clock_aggregate_sees_open_interval() {
        let (_tmp, store, engine) = engine();
        store.open_interval(Utc::now() - ChronoDuration::seconds(30)).unwrap();

        let result = engine.aggregate(AggregationWindow::LastDay).unwrap();
        assert_eq!(result.downtime_count, 1);
        assert!(result.total_downtime_seconds >= 30.0);
    }
}
