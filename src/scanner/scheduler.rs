//! Scan scheduler state machine.
//!
//! State flow: Idle → Running → Cooldown(until) → Idle
//!
//! Automatic ticks fire a cycle when the persisted schedule is due and the
//! scheduler is Idle. A manual request runs from Idle or Cooldown and is a
//! no-op while Running. Each cycle writes exactly one scan log entry and the
//! schedule's `last_run` in one transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use super::policy::{ScanPolicy, Verdict};
use crate::constants::SCAN_TICK_MAX_SECS;
use crate::models::{NewScanEntry, ScanLogEntry, ScanSchedule};
use crate::notifications::{CoreEvent, EventSink};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    /// Automatic ticks are ignored until `until`.
    Cooldown { until: DateTime<Utc> },
}

impl SchedulerState {
    pub fn label(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Cooldown { .. } => "cooldown",
        }
    }
}

/// Answer to a manual scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualScan {
    Accepted,
    AlreadyRunning,
    /// The scheduler task has stopped.
    Unavailable,
}

#[derive(Debug)]
struct ScanRequest;

/// Cloneable handle for requesting scans from other tasks.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    requests: mpsc::UnboundedSender<ScanRequest>,
    state: watch::Receiver<SchedulerState>,
}

impl ScanHandle {
    pub fn request_scan(&self) -> ManualScan {
        if *self.state.borrow() == SchedulerState::Running {
            return ManualScan::AlreadyRunning;
        }
        match self.requests.send(ScanRequest) {
            Ok(()) => ManualScan::Accepted,
            Err(_) => ManualScan::Unavailable,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }
}

pub struct ScanScheduler {
    store: Arc<Store>,
    policy: Arc<dyn ScanPolicy>,
    events: EventSink,
    state_tx: watch::Sender<SchedulerState>,
    requests_tx: mpsc::UnboundedSender<ScanRequest>,
    requests_rx: mpsc::UnboundedReceiver<ScanRequest>,
    cooldown: chrono::Duration,
    default_interval_secs: u64,
    /// Stands in for `last_run` until the first scan completes.
    started_at: DateTime<Utc>,
}

impl ScanScheduler {
    pub fn new(
        store: Arc<Store>,
        policy: Arc<dyn ScanPolicy>,
        events: EventSink,
        default_interval_secs: u64,
        cooldown: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            store,
            policy,
            events,
            state_tx,
            requests_tx,
            requests_rx,
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero()),
            default_interval_secs,
            started_at,
        }
    }

    pub fn handle(&self) -> ScanHandle {
        ScanHandle {
            requests: self.requests_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, state: SchedulerState) {
        self.state_tx.send_replace(state);
    }

    /// Leave Cooldown once its grace period has passed.
    fn settle_cooldown(&mut self, now: DateTime<Utc>) {
        if let SchedulerState::Cooldown { until } = self.state() {
            if now >= until {
                self.set_state(SchedulerState::Idle);
            }
        }
    }

    /// Automatic check: run a cycle if Idle and the schedule is due at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<ScanLogEntry> {
        self.settle_cooldown(now);
        if self.state() != SchedulerState::Idle {
            return None;
        }
        let schedule = match self.store.schedule_or_seed(self.default_interval_secs) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::error!(error = %e, "could not read scan schedule");
                self.events.storage_fault("read_schedule", &e);
                return None;
            }
        };
        if !schedule.is_due(now, self.started_at) {
            return None;
        }
        tracing::info!("scheduled scan due");
        self.run_cycle(now).await
    }

    /// User-requested scan. Ignored while a cycle is running.
    pub async fn trigger_manual(&mut self, now: DateTime<Utc>) -> Option<ScanLogEntry> {
        self.settle_cooldown(now);
        if self.state() == SchedulerState::Running {
            tracing::debug!("manual scan ignored, scan already in progress");
            return None;
        }
        tracing::info!("manual scan requested");
        self.run_cycle(now).await
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Option<ScanLogEntry> {
        self.set_state(SchedulerState::Running);

        let policy = self.policy.clone();
        let verdict = match tokio::task::spawn_blocking(move || policy.evaluate()).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(error = %e, "scan policy panicked");
                self.set_state(SchedulerState::Idle);
                return None;
            }
        };

        let entry = match verdict {
            Verdict::Clean => NewScanEntry::clean(
                now,
                &format!("No threats found ({} policy)", self.policy.name()),
            ),
            Verdict::ThreatFound { detail } => NewScanEntry::threat(now, &detail, true),
        };

        let fallback = ScanSchedule::new(self.default_interval_secs);
        match self.store.record_scan_cycle(&entry, &fallback) {
            Ok((logged, _schedule)) => {
                tracing::info!(id = logged.id, outcome = %logged.outcome, "scan cycle recorded");
                self.events.emit(CoreEvent::ScanCompleted(logged.clone()));
                let until = now
                    .checked_add_signed(self.cooldown)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.set_state(SchedulerState::Cooldown { until });
                Some(logged)
            }
            Err(e) => {
                tracing::error!(error = %e, "could not record scan cycle");
                self.events.storage_fault("record_scan_cycle", &e);
                self.set_state(SchedulerState::Idle);
                None
            }
        }
    }

    /// Tick on a timer and serve manual requests until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SCAN_TICK_MAX_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.tick(Utc::now()) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Some(ScanRequest) = self.requests_rx.recv() => {
                    tokio::select! {
                        _ = self.trigger_manual(Utc::now()) => {}
                        _ = shutdown.changed() => break,
                    }
                    // Requests made while that cycle ran were for the same scan
                    while self.requests_rx.try_recv().is_ok() {
                        tracing::debug!("dropping manual scan request made during a running scan");
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("scan scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    use crate::models::ScanOutcome;
    use crate::scanner::policy::{CleanPolicy, ScriptedPolicy};

    /// Blocks each evaluation until the test opens the gate.
    struct GatedPolicy {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ScanPolicy for GatedPolicy {
        fn evaluate(&self) -> Verdict {
            let _ = self.gate.lock().unwrap().recv();
            Verdict::Clean
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
    }

    fn setup(
        interval_secs: u64,
        cooldown_secs: u64,
        policy: Arc<dyn ScanPolicy>,
    ) -> (
        tempfile::TempDir,
        Arc<Store>,
        ScanScheduler,
        mpsc::UnboundedReceiver<CoreEvent>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("test.db")).unwrap());
        store.write_schedule(&ScanSchedule::new(interval_secs)).unwrap();
        let (events, rx) = EventSink::channel();
        let scheduler = ScanScheduler::new(
            store.clone(),
            policy,
            events,
            interval_secs,
            Duration::from_secs(cooldown_secs),
            t0(),
        );
        (dir, store, scheduler, rx)
    }

    #[tokio::test]
    async fn hourly_schedule_fires_three_times_in_three_hours() {
        let (_dir, store, mut scheduler, _rx) = setup(3600, 60, Arc::new(CleanPolicy));
        let mut fired = 0;
        let mut now = t0();
        while now <= t0() + chrono::Duration::hours(3) {
            if scheduler.tick(now).await.is_some() {
                fired += 1;
            }
            now += chrono::Duration::seconds(30);
        }
        assert_eq!(fired, 3);
        assert_eq!(store.recent_scans(10).unwrap().len(), 3);
        let schedule = store.read_schedule().unwrap().unwrap();
        assert_eq!(schedule.last_run, Some(t0() + chrono::Duration::hours(3)));
    }

    #[tokio::test]
    async fn nothing_fires_before_first_interval() {
        let (_dir, _store, mut scheduler, _rx) = setup(3600, 60, Arc::new(CleanPolicy));
        assert!(scheduler.tick(t0()).await.is_none());
        assert!(scheduler
            .tick(t0() + chrono::Duration::minutes(59))
            .await
            .is_none());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn cooldown_throttles_ticks_but_not_manual_requests() {
        let (_dir, store, mut scheduler, _rx) = setup(300, 600, Arc::new(CleanPolicy));

        assert!(scheduler.trigger_manual(t0()).await.is_some());
        assert_eq!(
            scheduler.state(),
            SchedulerState::Cooldown {
                until: t0() + chrono::Duration::seconds(600)
            }
        );

        // Due by interval, but still cooling down
        assert!(scheduler
            .tick(t0() + chrono::Duration::seconds(301))
            .await
            .is_none());

        // User intent goes through
        assert!(scheduler
            .trigger_manual(t0() + chrono::Duration::seconds(10))
            .await
            .is_some());
        assert_eq!(store.recent_scans(10).unwrap().len(), 2);

        // After the grace period the automatic tick resumes
        assert!(scheduler
            .tick(t0() + chrono::Duration::seconds(700))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn manual_trigger_while_running_is_noop() {
        let (_dir, store, mut scheduler, _rx) = setup(3600, 60, Arc::new(CleanPolicy));
        scheduler.set_state(SchedulerState::Running);
        assert!(scheduler.trigger_manual(t0()).await.is_none());
        assert!(scheduler.handle().request_scan() == ManualScan::AlreadyRunning);
        assert!(store.recent_scans(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn threat_cycle_records_isolation_and_emits_once() {
        let policy = Arc::new(ScriptedPolicy::new(vec![Verdict::ThreatFound {
            detail: "cryptominer (pid 42)".to_string(),
        }]));
        let (_dir, store, mut scheduler, mut rx) = setup(3600, 60, policy);

        let entry = scheduler.trigger_manual(t0()).await.unwrap();
        assert_eq!(entry.outcome, ScanOutcome::ThreatFound);
        assert!(entry.isolated);
        assert_eq!(entry.detail, "cryptominer (pid 42)");
        assert_eq!(store.get_scan(entry.id).unwrap(), Some(entry.clone()));
        assert_eq!(rx.try_recv().unwrap(), CoreEvent::ScanCompleted(entry));
        assert!(rx.try_recv().is_err());

        let clean = scheduler
            .trigger_manual(t0() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(clean.outcome, ScanOutcome::Clean);
        assert!(!clean.isolated);
    }

    #[tokio::test]
    async fn disabled_schedule_only_runs_on_request() {
        let (_dir, store, mut scheduler, _rx) = setup(3600, 60, Arc::new(CleanPolicy));
        let mut schedule = store.read_schedule().unwrap().unwrap();
        schedule.enabled = false;
        store.write_schedule(&schedule).unwrap();

        for h in 0..48 {
            assert!(scheduler
                .tick(t0() + chrono::Duration::hours(h))
                .await
                .is_none());
        }
        assert!(scheduler.trigger_manual(t0()).await.is_some());
    }

    #[tokio::test]
    async fn storage_failure_returns_to_idle_and_reports() {
        let (dir, store, mut scheduler, mut rx) = setup(3600, 60, Arc::new(CleanPolicy));
        let conn = rusqlite::Connection::open(dir.path().join("test.db")).unwrap();
        conn.execute_batch("DROP TABLE scan_log").unwrap();
        drop(conn);

        assert!(scheduler.trigger_manual(t0()).await.is_none());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreEvent::StorageFault {
                operation: "record_scan_cycle",
                ..
            }
        ));
        // last_run did not move, so the next tick retries
        assert_eq!(store.read_schedule().unwrap().unwrap().last_run, None);
    }

    #[tokio::test]
    async fn handle_reports_running_scan() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let policy = Arc::new(GatedPolicy {
            gate: Mutex::new(gate_rx),
        });
        let (_dir, store, scheduler, mut rx) = setup(3600, 60, policy);
        let handle = scheduler.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(shutdown_rx));

        assert_eq!(handle.request_scan(), ManualScan::Accepted);
        while handle.state() != SchedulerState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.request_scan(), ManualScan::AlreadyRunning);

        gate_tx.send(()).unwrap();
        assert!(matches!(rx.recv().await, Some(CoreEvent::ScanCompleted(_))));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(store.recent_scans(10).unwrap().len(), 1);
        assert_eq!(handle.request_scan(), ManualScan::Unavailable);
    }

    #[tokio::test]
    async fn oversized_interval_never_fires_automatically() {
        let (_dir, store, mut scheduler, _rx) =
            setup(200_000_000_000_000 * 60, 60, Arc::new(CleanPolicy));
        assert!(scheduler.tick(t0() + chrono::Duration::days(3650)).await.is_none());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(store.recent_scans(10).unwrap().is_empty());

        // Manual scans still work
        assert!(scheduler.trigger_manual(t0()).await.is_some());
    }

    #[tokio::test]
    async fn cooldown_past_the_calendar_saturates() {
        let (_dir, _store, mut scheduler, _rx) =
            setup(3600, 1_000_000_000_000_000, Arc::new(CleanPolicy));
        assert!(scheduler.trigger_manual(t0()).await.is_some());
        assert_eq!(
            scheduler.state(),
            SchedulerState::Cooldown {
                until: DateTime::<Utc>::MAX_UTC
            }
        );
        assert!(scheduler.tick(t0() + chrono::Duration::hours(2)).await.is_none());
        assert!(scheduler.trigger_manual(t0() + chrono::Duration::minutes(1)).await.is_some());
    }
}

