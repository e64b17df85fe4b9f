//! Connectivity monitor.
//!
//! State flow: Offline → (reachable, held for the debounce window) → Online
//!             Online → (one failed probe) → Offline
//!
//! The monitor polls a [`ReachabilityProbe`] on a fixed interval, publishes
//! the current [`ConnectivityState`] through a `watch` channel (readers get a
//! receiver and cannot mutate it), and sends exactly one reconciliation
//! trigger per committed Offline → Online transition. Rapid flapping while
//! offline restarts the debounce window, so it collapses into one trigger.

pub mod probe;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

pub use probe::{HttpProbe, ReachabilityProbe};

use crate::notifications::{CoreEvent, EventSink};
use crate::reconcile::ReconcileTrigger;

/// Last observed network reachability. Written only by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub is_online: bool,
    pub last_checked: DateTime<Utc>,
}

impl ConnectivityState {
    pub fn offline() -> Self {
        Self {
            is_online: false,
            last_checked: Utc::now(),
        }
    }
}

/// A committed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
}

/// Debounced two-state machine fed with raw probe results.
#[derive(Debug)]
pub struct TransitionTracker {
    online: bool,
    debounce: Duration,
    /// First reachable observation of the current offline streak.
    reachable_since: Option<Instant>,
}

impl TransitionTracker {
    /// Starts `Offline`, so the first stable connection after startup also
    /// reconciles anything left queued by a previous session.
    pub fn new(debounce: Duration) -> Self {
        Self {
            online: false,
            debounce,
            reachable_since: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Feed one probe result observed at `now`.
    pub fn observe(&mut self, reachable: bool, now: Instant) -> Option<Transition> {
        match (self.online, reachable) {
            (true, true) => None,
            (true, false) => {
                self.online = false;
                self.reachable_since = None;
                Some(Transition::WentOffline)
            }
            (false, false) => {
                self.reachable_since = None;
                None
            }
            (false, true) => {
                let since = *self.reachable_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.debounce {
                    self.online = true;
                    self.reachable_since = None;
                    Some(Transition::CameOnline)
                } else {
                    None
                }
            }
        }
    }
}

/// Polls reachability and publishes transitions.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    poll_interval: Duration,
    tracker: TransitionTracker,
    state_tx: watch::Sender<ConnectivityState>,
    events: EventSink,
    reconcile_tx: mpsc::UnboundedSender<ReconcileTrigger>,
}

impl ConnectivityMonitor {
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        poll_interval: Duration,
        debounce: Duration,
        events: EventSink,
        reconcile_tx: mpsc::UnboundedSender<ReconcileTrigger>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::offline());
        Self {
            probe,
            poll_interval,
            tracker: TransitionTracker::new(debounce),
            state_tx,
            events,
            reconcile_tx,
        }
    }

    /// Read-only view of the connectivity state for dependent tasks.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Probe once and apply the result.
    pub async fn poll_once(&mut self) -> Option<Transition> {
        let reachable = self.probe.is_reachable().await;
        let transition = self.tracker.observe(reachable, Instant::now());
        let state = ConnectivityState {
            is_online: self.tracker.is_online(),
            last_checked: Utc::now(),
        };
        self.state_tx.send_replace(state);

        match transition {
            Some(Transition::CameOnline) => {
                tracing::info!("connectivity restored, triggering reconciliation");
                self.events.emit(CoreEvent::ConnectivityChanged(state));
                if self.reconcile_tx.send(ReconcileTrigger).is_err() {
                    tracing::debug!("no reconciliation worker listening, trigger dropped");
                }
            }
            Some(Transition::WentOffline) => {
                tracing::info!("connectivity lost");
                self.events.emit(CoreEvent::ConnectivityChanged(state));
            }
            None => {}
        }
        transition
    }

    /// Poll until the shutdown flag flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("connectivity monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of probe results, then reports the last one forever.
    struct ScriptedProbe {
        results: Mutex<VecDeque<bool>>,
    }

    impl ScriptedProbe {
        fn new(results: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn is_reachable(&self) -> bool {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                results.front().copied().unwrap_or(false)
            }
        }
    }

    // ── Tracker ───────────────────────────────────────────────────

    #[test]
    fn starts_offline() {
        let tracker = TransitionTracker::new(Duration::from_secs(10));
        assert!(!tracker.is_online());
    }

    #[test]
    fn online_requires_stable_window() {
        let mut tracker = TransitionTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert_eq!(tracker.observe(true, t0), None);
        assert_eq!(tracker.observe(true, t0 + Duration::from_secs(5)), None);
        assert_eq!(
            tracker.observe(true, t0 + Duration::from_secs(10)),
            Some(Transition::CameOnline)
        );
        assert!(tracker.is_online());
        assert_eq!(tracker.observe(true, t0 + Duration::from_secs(15)), None);
    }

    #[test]
    fn flapping_collapses_into_single_trigger() {
        let mut tracker = TransitionTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let pattern = [true, false, true, false, true, true, true];
        let mut transitions = Vec::new();
        for (i, reachable) in pattern.iter().enumerate() {
            if let Some(t) = tracker.observe(*reachable, t0 + Duration::from_secs(5 * i as u64)) {
                transitions.push(t);
            }
        }
        assert_eq!(transitions, vec![Transition::CameOnline]);
    }

    #[test]
    fn going_offline_is_immediate() {
        let mut tracker = TransitionTracker::new(Duration::ZERO);
        let t0 = Instant::now();
        assert_eq!(tracker.observe(true, t0), Some(Transition::CameOnline));
        assert_eq!(tracker.observe(false, t0), Some(Transition::WentOffline));
        assert_eq!(tracker.observe(false, t0), None);
    }

    #[test]
    fn zero_debounce_commits_on_first_success() {
        let mut tracker = TransitionTracker::new(Duration::ZERO);
        assert_eq!(tracker.observe(true, Instant::now()), Some(Transition::CameOnline));
    }

    // ── Monitor ───────────────────────────────────────────────────

    #[tokio::test]
    async fn monitor_publishes_state_and_one_trigger_per_transition() {
        let probe = ScriptedProbe::new(&[false, true, true, false, true]);
        let (events, mut event_rx) = EventSink::channel();
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let mut monitor = ConnectivityMonitor::new(
            probe,
            Duration::from_secs(1),
            Duration::ZERO,
            events,
            trigger_tx,
        );
        let state_rx = monitor.subscribe();

        assert_eq!(monitor.poll_once().await, None);
        assert!(!state_rx.borrow().is_online);

        assert_eq!(monitor.poll_once().await, Some(Transition::CameOnline));
        assert!(state_rx.borrow().is_online);
        assert_eq!(monitor.poll_once().await, None);
        assert_eq!(monitor.poll_once().await, Some(Transition::WentOffline));
        assert!(!state_rx.borrow().is_online);
        assert_eq!(monitor.poll_once().await, Some(Transition::CameOnline));

        let mut triggers = 0;
        while trigger_rx.try_recv().is_ok() {
            triggers += 1;
        }
        assert_eq!(triggers, 2);

        let mut changes = Vec::new();
        while let Ok(CoreEvent::ConnectivityChanged(state)) = event_rx.try_recv() {
            changes.push(state.is_online);
        }
        assert_eq!(changes, vec![true, false, true]);
    }

    #[tokio::test]
    async fn last_checked_moves_forward() {
        let probe = ScriptedProbe::new(&[false]);
        let (events, _event_rx) = EventSink::channel();
        let (trigger_tx, _trigger_rx) = mpsc::unbounded_channel();
        let mut monitor =
            ConnectivityMonitor::new(probe, Duration::from_secs(1), Duration::ZERO, events, trigger_tx);
        let state_rx = monitor.subscribe();
        monitor.poll_once().await;
        let first = state_rx.borrow().last_checked;
        monitor.poll_once().await;
        assert!(state_rx.borrow().last_checked >= first);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let probe = ScriptedProbe::new(&[true]);
        let (events, _event_rx) = EventSink::channel();
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let monitor = ConnectivityMonitor::new(
            probe,
            Duration::from_millis(10),
            Duration::ZERO,
            events,
            trigger_tx,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(shutdown_rx));

        // First tick fires immediately and commits the transition
        assert_eq!(trigger_rx.recv().await, Some(ReconcileTrigger));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
