//! Scheduler module driving the probe → evaluate → persist → notify cycle.

mod retention;
mod tracker;

pub use retention::*;
pub use tracker::*;

use crate::db::Store;
use crate::notify::{NotificationChannel, NotificationDispatcher, NotificationRequest};
use crate::probe::{FailureDomain, Probe, ProbeResult, TargetOutcome};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Size of the queue between the monitor loop and the notifier.
const NOTIFY_QUEUE_DEPTH: usize = 32;

/// Snapshot of the link published after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub state: ConnectivityState,
    /// False until the first probe after startup has been evaluated.
    pub settled: bool,
    pub last_transition: Option<DateTime<Utc>>,
    pub down_since: Option<DateTime<Utc>>,
    pub failure_domain: Option<FailureDomain>,
    pub last_probe: Option<DateTime<Utc>>,
    pub reachable: Option<bool>,
    pub outcomes: Vec<TargetOutcome>,
    /// Store writes waiting to be retried.
    pub pending_writes: usize,
}

impl LinkStatus {
    fn from_tracker(tracker: &StateTracker) -> Self {
        Self {
            state: tracker.state(),
            settled: tracker.is_settled(),
            last_transition: tracker.last_transition(),
            down_since: tracker.down_since(),
            failure_domain: None,
            last_probe: None,
            reachable: None,
            outcomes: Vec::new(),
            pending_writes: 0,
        }
    }

    /// Seconds since the last transition, measured at `now`.
    pub fn seconds_since_transition(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_transition.map(|t| (now - t).num_seconds().max(0))
    }
}

/// A store write that failed and is retried on the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Open { start: DateTime<Utc> },
    Close { end: DateTime<Utc> },
}

/// Runs one probe cycle at a time and keeps the store in step with the
/// tracker. The only writer of connectivity state and downtime intervals.
pub struct Monitor<P> {
    prober: P,
    store: Arc<Store>,
    tracker: StateTracker,
    open_event: Option<i64>,
    pending: VecDeque<PendingWrite>,
    notify_tx: mpsc::Sender<NotificationRequest>,
    status_tx: watch::Sender<LinkStatus>,
}

impl<P: Probe> Monitor<P> {
    /// Create a monitor, resuming `Down` if the store holds an open interval.
    pub fn new(
        prober: P,
        store: Arc<Store>,
        thresholds: Thresholds,
        notify_tx: mpsc::Sender<NotificationRequest>,
    ) -> (Self, watch::Receiver<LinkStatus>) {
        let mut tracker = StateTracker::new(thresholds);
        let mut open_event = None;

        match store.open_event() {
            Ok(Some(event)) => {
                tracing::warn!(
                    "Resuming outage {} open since {} from a previous run",
                    event.id,
                    event.start()
                );
                tracker.resume_down(event.start());
                open_event = Some(event.id);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Could not check for an open outage at startup: {}", e);
            }
        }

        let (status_tx, status_rx) = watch::channel(LinkStatus::from_tracker(&tracker));

        let monitor = Self {
            prober,
            store,
            tracker,
            open_event,
            pending: VecDeque::new(),
            notify_tx,
            status_tx,
        };
        (monitor, status_rx)
    }

    /// Probe once, evaluate, persist and queue notifications.
    pub async fn run_cycle(&mut self) -> Option<Transition> {
        let result = self.prober.probe().await;
        self.process(&result)
    }

    /// Handle one probe result.
    pub fn process(&mut self, result: &ProbeResult) -> Option<Transition> {
        let transition = self.tracker.observe(result);

        if let Some(t) = &transition {
            self.pending.push_back(match *t {
                Transition::DownStarted { at } => PendingWrite::Open { start: at },
                Transition::UpRestored { at, .. } => PendingWrite::Close { end: at },
            });
        }

        let newest = self.flush_pending();

        if let Some(t) = &transition {
            self.log_transition(t, result);
            self.enqueue_notification(t, newest);
        }

        tracing::debug!(
            state = ?self.tracker.state(),
            reachable = result.reachable,
            since_transition_secs = self.tracker.last_transition().map(|t| (result.time - t).num_seconds()),
            "Probe cycle complete"
        );

        self.publish(result);
        transition
    }

    pub fn state(&self) -> ConnectivityState {
        self.tracker.state()
    }

    /// Apply queued writes in order, stopping at the first failure.
    ///
    /// Returns the interval ID written by the newest queued write, or `None`
    /// if that write is still pending.
    fn flush_pending(&mut self) -> Option<i64> {
        let mut last = None;
        while let Some(op) = self.pending.front().copied() {
            match self.apply(op) {
                Ok(id) => {
                    last = id;
                    self.pending.pop_front();
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to persist {:?}, will retry next cycle ({} pending): {}",
                        op,
                        self.pending.len(),
                        e
                    );
                    break;
                }
            }
        }
        if self.pending.is_empty() {
            last
        } else {
            None
        }
    }

    fn apply(&mut self, op: PendingWrite) -> Result<Option<i64>, crate::db::DbError> {
        use crate::db::DbError;

        match op {
            PendingWrite::Open { start } => {
                let id = self.store.open_interval(start)?;
                self.open_event = Some(id);
                Ok(Some(id))
            }
            PendingWrite::Close { end } => {
                if let Some(id) = self.open_event.take() {
                    match self.store.close_interval(id, end) {
                        Ok(event) => {
                            tracing::info!(
                                "Closed outage {} ({}s)",
                                event.id,
                                event.duration_seconds().unwrap_or(0)
                            );
                            return Ok(Some(event.id));
                        }
                        Err(DbError::NotFound(_)) | Err(DbError::AlreadyClosed(_)) => {
                            tracing::warn!("Anomaly: outage handle {} is stale, looking up the open interval", id);
                        }
                        Err(e) => {
                            self.open_event = Some(id);
                            return Err(e);
                        }
                    }
                }

                match self.store.open_event()? {
                    Some(open) => {
                        let event = self.store.close_interval(open.id, end)?;
                        tracing::info!(
                            "Closed outage {} ({}s)",
                            event.id,
                            event.duration_seconds().unwrap_or(0)
                        );
                        Ok(Some(event.id))
                    }
                    None => {
                        tracing::warn!("Anomaly: restore at {} but no outage is open", end);
                        Ok(None)
                    }
                }
            }
        }
    }

    fn log_transition(&self, transition: &Transition, result: &ProbeResult) {
        match transition {
            Transition::DownStarted { at } => {
                tracing::warn!(
                    "Link is down at {} (failure domain: {:?})",
                    at,
                    result.failure_domain().or(self.tracker.last_failure_domain())
                );
            }
            Transition::UpRestored { at, down_since } => {
                tracing::info!(
                    "Link is back up at {}. Downtime duration: {} seconds.",
                    at,
                    (*at - *down_since).num_seconds()
                );
            }
        }
    }

    fn enqueue_notification(&self, transition: &Transition, event_id: Option<i64>) {
        let request = NotificationRequest::from_transition(transition, event_id);
        if let Err(e) = self.notify_tx.try_send(request) {
            tracing::warn!(
                "Notification queue unavailable, dropping alert for {}: {}",
                transition.at(),
                e
            );
        }
    }

    fn publish(&self, result: &ProbeResult) {
        let status = LinkStatus {
            state: self.tracker.state(),
            settled: self.tracker.is_settled(),
            last_transition: self.tracker.last_transition(),
            down_since: self.tracker.down_since(),
            failure_domain: result.failure_domain(),
            last_probe: Some(result.time),
            reachable: Some(result.reachable),
            outcomes: result.outcomes.clone(),
            pending_writes: self.pending.len(),
        };
        self.status_tx.send_replace(status);
    }
}

/// Run the monitor on a fixed interval until stopped.
pub async fn run_monitor_loop<P: Probe>(
    mut monitor: Monitor<P>,
    probe_interval: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                monitor.run_cycle().await;
            }
        }
    }

    tracing::info!("Monitor stopped in state {:?}", monitor.state());
}

/// Owns the background tasks: monitor loop, notifier and retention.
pub struct Scheduler {
    store: Arc<Store>,
    stop_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            store,
            stop_tx,
            handles: Vec::new(),
        }
    }

    /// Start monitoring. Returns a handle to the published link status.
    pub fn start<P, C>(
        &mut self,
        prober: P,
        thresholds: Thresholds,
        probe_interval: Duration,
        dispatcher: NotificationDispatcher<C>,
        retention: Option<chrono::Duration>,
    ) -> watch::Receiver<LinkStatus>
    where
        P: Probe + 'static,
        C: NotificationChannel + 'static,
    {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        let (monitor, status_rx) = Monitor::new(prober, self.store.clone(), thresholds, notify_tx);

        tracing::info!(
            "Starting monitor: every {:?}, down after {}, up after {}",
            probe_interval,
            thresholds.down_after,
            thresholds.up_after
        );

        self.handles.push(tokio::spawn(dispatcher.run(notify_rx)));
        self.handles.push(tokio::spawn(run_monitor_loop(
            monitor,
            probe_interval,
            self.stop_tx.subscribe(),
        )));

        if let Some(retention) = retention {
            let manager = RetentionManager::new(self.store.clone(), retention);
            self.handles.push(manager.start(self.stop_tx.subscribe()));
        }

        status_rx
    }

    /// Stop the loops and let the notifier drain its queue.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.stop_tx.send(());
        for handle in self.handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("Background task did not stop within {:?}", grace);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DowntimeEvent, Interval, TimeRange};
    use crate::stats::{AggregationEngine, AggregationWindow};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Replays a fixed list of verdicts.
    struct ScriptedProbe {
        results: Mutex<VecDeque<ProbeResult>>,
    }

    impl ScriptedProbe {
        fn new(script: &[(i64, bool)]) -> Self {
            Self {
                results: Mutex::new(
                    script
                        .iter()
                        .map(|(secs, up)| ProbeResult::verdict(t(*secs), *up))
                        .collect(),
                ),
            }
        }
    }

    impl Probe for ScriptedProbe {
        async fn probe(&self) -> ProbeResult {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .expect("probe script exhausted")
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn all_events(store: &Store) -> Vec<DowntimeEvent> {
        store
            .query_intervals(TimeRange::new(t(-1_000_000), t(1_000_000)))
            .unwrap()
    }

    fn monitor(
        store: &Arc<Store>,
        script: &[(i64, bool)],
        thresholds: Thresholds,
    ) -> (Monitor<ScriptedProbe>, mpsc::Receiver<NotificationRequest>) {
        let (tx, rx) = mpsc::channel(64);
        let (monitor, _status) = Monitor::new(ScriptedProbe::new(script), store.clone(), thresholds, tx);
        (monitor, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<NotificationRequest>) -> Vec<NotificationRequest> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn test_scenario_one_outage() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());

        let script: Vec<(i64, bool)> = (0..=10)
            .map(|i| {
                let secs = i * 10;
                (secs, secs != 20 && secs != 30)
            })
            .collect();
        let (mut monitor, mut rx) = monitor(&store, &script, Thresholds::new(2, 1));

        let mut transitions = Vec::new();
        for _ in 0..script.len() {
            transitions.extend(monitor.run_cycle().await);
        }

        assert_eq!(
            transitions,
            vec![
                Transition::DownStarted { at: t(20) },
                Transition::UpRestored { at: t(40), down_since: t(20) },
            ]
        );

        let events = all_events(&store);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interval, Interval::Closed { start: t(20), end: t(40) });
        assert_eq!(events[0].duration_seconds(), Some(20));

        let engine = AggregationEngine::new(store.clone());
        let today = engine.aggregate_at(AggregationWindow::Today, &t(100)).unwrap();
        assert_eq!(today.downtime_count, 1);
        assert_eq!(today.total_downtime_seconds, 20.0);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].event_id, Some(events[0].id));
        assert_eq!(sent[1].downtime_seconds, Some(20));
    }

    #[tokio::test]
    async fn test_isolated_failure_records_nothing() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let script = [(0, true), (10, false), (20, true), (30, true)];
        let (mut monitor, mut rx) = monitor(&store, &script, Thresholds::new(2, 1));

        for _ in 0..script.len() {
            monitor.run_cycle().await;
        }

        assert!(all_events(&store).is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_restart_closes_existing_open_interval() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let crashed = store.open_interval(t(-300)).unwrap();

        let (mut monitor, mut rx) = monitor(&store, &[(0, true), (10, true)], Thresholds::new(2, 1));
        assert_eq!(monitor.state(), ConnectivityState::Down);

        let first = monitor.run_cycle().await;
        let second = monitor.run_cycle().await;
        assert_eq!(first, Some(Transition::UpRestored { at: t(0), down_since: t(-300) }));
        assert_eq!(second, None);

        let events = all_events(&store);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, crashed);
        assert_eq!(events[0].interval, Interval::Closed { start: t(-300), end: t(0) });

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_id, Some(crashed));
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_next_cycle() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let raw = rusqlite::Connection::open(tmp.path()).unwrap();

        let script = [(0, false), (10, false), (20, false), (30, true)];
        let (mut monitor, _rx) = monitor(&store, &script, Thresholds::new(2, 1));

        // Hide the table so the open fails
        raw.execute_batch("ALTER TABLE downtime RENAME TO downtime_hidden").unwrap();
        monitor.run_cycle().await;
        assert_eq!(monitor.run_cycle().await, Some(Transition::DownStarted { at: t(0) }));
        assert_eq!(monitor.pending.len(), 1);

        raw.execute_batch("ALTER TABLE downtime_hidden RENAME TO downtime").unwrap();
        monitor.run_cycle().await;
        assert!(monitor.pending.is_empty());
        assert!(store.open_event().unwrap().is_some());

        monitor.run_cycle().await;
        let events = all_events(&store);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interval, Interval::Closed { start: t(0), end: t(30) });
    }

    #[tokio::test]
    async fn test_failed_close_keeps_interval_open_until_reconciled() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let raw = rusqlite::Connection::open(tmp.path()).unwrap();

        let script = [(0, false), (10, false), (20, true), (30, true)];
        let (mut monitor, _rx) = monitor(&store, &script, Thresholds::new(2, 1));
        monitor.run_cycle().await;
        monitor.run_cycle().await;

        raw.execute_batch("ALTER TABLE downtime RENAME TO downtime_hidden").unwrap();
        assert!(matches!(monitor.run_cycle().await, Some(Transition::UpRestored { .. })));
        assert_eq!(monitor.pending.len(), 1);
        raw.execute_batch("ALTER TABLE downtime_hidden RENAME TO downtime").unwrap();

        // Still open until the retry lands
        assert!(store.open_event().unwrap().is_some());
        monitor.run_cycle().await;
        assert!(store.open_event().unwrap().is_none());
        assert_eq!(all_events(&store)[0].end(), Some(t(20)));
    }

    #[tokio::test]
    async fn test_alert_carries_id_of_its_own_interval() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let raw = rusqlite::Connection::open(tmp.path()).unwrap();

        let script = [(0, false), (10, true), (20, false), (30, false)];
        let (mut monitor, mut rx) = monitor(&store, &script, Thresholds::new(1, 1));

        monitor.run_cycle().await;
        let first = store.open_event().unwrap().unwrap().id;
        assert_eq!(drain(&mut rx)[0].event_id, Some(first));

        // Restore cannot be written yet
        raw.execute_batch(
            "CREATE TRIGGER block_update BEFORE UPDATE ON downtime
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .unwrap();
        monitor.run_cycle().await;
        assert_eq!(drain(&mut rx)[0].event_id, None);

        // The old close lands but the new open does not
        raw.execute_batch(
            "DROP TRIGGER block_update;
             CREATE TRIGGER block_insert BEFORE INSERT ON downtime
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .unwrap();
        assert_eq!(monitor.run_cycle().await, Some(Transition::DownStarted { at: t(20) }));
        let down = drain(&mut rx);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].event_id, None);
        assert!(store.open_event().unwrap().is_none());
        assert_eq!(monitor.pending.len(), 1);

        raw.execute_batch("DROP TRIGGER block_insert;").unwrap();
        monitor.run_cycle().await;
        let events = all_events(&store);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].interval, Interval::Closed { start: t(0), end: t(10) });
        assert_eq!(events[1].interval, Interval::Open { start: t(20) });
    }

    #[tokio::test]
    async fn test_status_published_each_cycle() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (tx, _rx) = mpsc::channel(4);
        let (mut monitor, status) = Monitor::new(
            ScriptedProbe::new(&[(0, false), (10, false)]),
            store,
            Thresholds::new(2, 1),
            tx,
        );

        assert!(!status.borrow().settled);
        monitor.run_cycle().await;
        assert!(status.borrow().settled);
        assert_eq!(status.borrow().state, ConnectivityState::Up);

        monitor.run_cycle().await;
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.state, ConnectivityState::Down);
        assert_eq!(snapshot.last_transition, Some(t(0)));
        assert_eq!(snapshot.seconds_since_transition(t(70)), Some(70));
        assert_eq!(snapshot.reachable, Some(false));
    }

    #[tokio::test]
    async fn test_full_notification_queue_does_not_block() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let script = [(0, false), (10, true), (20, false), (30, true)];
        let (mut monitor, _status) =
            Monitor::new(ScriptedProbe::new(&script), store.clone(), Thresholds::new(1, 1), tx);

        for _ in 0..script.len() {
            monitor.run_cycle().await;
        }
        // Alerts beyond the queue depth are dropped, but both outages are recorded
        assert_eq!(all_events(&store).len(), 2);
    }

    #[test]
    fn test_random_sequences_keep_intervals_disjoint() {
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let tmp = NamedTempFile::new().unwrap();
            let store = Arc::new(Store::new(tmp.path()).unwrap());
            let thresholds = Thresholds::new(rng.gen_range(1..4), rng.gen_range(1..3));

            let script: Vec<(i64, bool)> = (0..200).map(|i| (i * 10, rng.gen_bool(0.6))).collect();
            let (tx, _rx) = mpsc::channel(512);
            let (mut monitor, _status) =
                Monitor::new(ScriptedProbe::new(&script), store.clone(), thresholds, tx);

            for (secs, up) in &script {
                monitor.process(&ProbeResult::verdict(t(*secs), *up));
            }

            let events = all_events(&store);
            let open = events.iter().filter(|e| e.is_open()).count();
            assert!(open <= 1, "seed {}: {} open intervals", seed, open);
            assert_eq!(open == 1, monitor.state() == ConnectivityState::Down, "seed {}", seed);

            for pair in events.windows(2) {
                let prev_end = pair[0].end().expect("only the last interval may be open");
                assert!(prev_end <= pair[1].start(), "seed {}: overlap", seed);
            }
            for e in &events {
                if let Some(end) = e.end() {
                    assert!(end >= e.start());
                }
            }
        }
    }
}
