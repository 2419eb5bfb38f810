//! Retention manager for pruning old downtime intervals.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Shortest retention accepted; the 30-day window must stay complete.
pub const MIN_RETENTION_DAYS: i64 = 31;

const RETENTION_TICK: Duration = Duration::from_secs(3600);

/// Deletes closed intervals that ended before the retention horizon.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: ChronoDuration,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: ChronoDuration) -> Self {
        let minimum = ChronoDuration::days(MIN_RETENTION_DAYS);
        let retention = if retention < minimum {
            tracing::warn!(
                "Retention of {} days is below the {}-day minimum, using {} days",
                retention.num_days(),
                MIN_RETENTION_DAYS,
                MIN_RETENTION_DAYS
            );
            minimum
        } else {
            retention
        };
        Self { store, retention }
    }

    pub fn retention(&self) -> ChronoDuration {
        self.retention
    }

    /// Start the retention background task; it exits on `stop_rx`.
    pub fn start(self, mut stop_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tracing::info!(
            "RetentionManager: pruning intervals older than {} days",
            self.retention().num_days()
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&self.store, self.retention, Utc::now());
                    }
                }
            }
        })
    }
}

/// Prune once relative to `now`. Returns the number of intervals removed.
pub fn process_retention(store: &Store, retention: ChronoDuration, now: DateTime<Utc>) -> usize {
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        tracing::warn!("RetentionManager: retention {} reaches before the calendar, nothing to prune", retention);
        return 0;
    };
    match store.prune_closed_before(cutoff) {
        Ok(0) => 0,
        Ok(n) => {
            tracing::info!("RetentionManager: pruned {} intervals ended before {}", n, cutoff);
            n
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to prune intervals: {}", e);
            0
        }
    }
}
