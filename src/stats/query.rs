//! Read-only status façade for the presentation layer.

use super::{AggregationEngine, AggregationResult, AggregationWindow};

use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use std::sync::Mutex;

/// One row of the status table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub window_label: String,
    pub downtime_count: u64,
    pub total_downtime_seconds: f64,
}

impl From<&AggregationResult> for WindowStatus {
    fn from(r: &AggregationResult) -> Self {
        Self {
            window_label: r.window.label().to_string(),
            downtime_count: r.downtime_count,
            total_downtime_seconds: r.total_downtime_seconds,
        }
    }
}

/// Answers status queries, falling back to the last good snapshot when the
/// store cannot be read. Never surfaces an error to the caller.
pub struct StatusQueryService {
    engine: AggregationEngine,
    last_good: Mutex<Option<Vec<WindowStatus>>>,
}

impl StatusQueryService {
    pub fn new(engine: AggregationEngine) -> Self {
        Self {
            engine,
            last_good: Mutex::new(None),
        }
    }

    /// Status for every window, recomputed against the current local time.
    pub fn get_status(&self) -> Vec<WindowStatus> {
        self.get_status_at(&Local::now())
    }

    pub fn get_status_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Vec<WindowStatus> {
        let mut last_good = self.last_good.lock().unwrap_or_else(|p| p.into_inner());

        match self.engine.aggregate_all_at(now) {
            Ok(results) => {
                let rows: Vec<WindowStatus> = results.iter().map(WindowStatus::from).collect();
                *last_good = Some(rows.clone());
                rows
            }
            Err(e) => {
                tracing::error!("Status query failed, serving last snapshot: {}", e);
                last_good.clone().unwrap_or_else(|| {
                    AggregationWindow::ALL
                        .iter()
                        .map(|w| WindowStatus::from(&AggregationResult::empty(*w)))
                        .collect()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_status_rows_in_window_order() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let id = store.open_interval(t(-120)).unwrap();
        store.close_interval(id, t(-60)).unwrap();

        let service = StatusQueryService::new(AggregationEngine::new(store));
        let rows = service.get_status_at(&t(0));

        let labels: Vec<_> = rows.iter().map(|r| r.window_label.as_str()).collect();
        assert_eq!(labels, vec!["Today", "Last 24 Hours", "Last 7 Days", "Last 30 Days"]);
        assert!(rows.iter().all(|r| r.downtime_count == 1));
        assert!(rows.iter().all(|r| r.total_downtime_seconds == 60.0));
    }

    #[test]
    fn test_store_failure_serves_last_snapshot() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let id = store.open_interval(t(-30)).unwrap();
        store.close_interval(id, t(-10)).unwrap();

        let service = StatusQueryService::new(AggregationEngine::new(store));
        let good = service.get_status_at(&t(0));
        assert_eq!(good[0].total_downtime_seconds, 20.0);

        // Break the store underneath the service
        let raw = rusqlite::Connection::open(tmp.path()).unwrap();
        raw.execute_batch("DROP TABLE downtime").unwrap();

        let fallback = service.get_status_at(&t(0));
        assert_eq!(fallback, good);
    }

    #[test]
    fn test_store_failure_before_first_success_returns_zeros() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let raw = rusqlite::Connection::open(tmp.path()).unwrap();
        raw.execute_batch("DROP TABLE downtime").unwrap();

        let service = StatusQueryService::new(AggregationEngine::new(store));
        let rows = service.get_status_at(&t(0));
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.downtime_count == 0 && r.total_downtime_seconds == 0.0));
    }
}
