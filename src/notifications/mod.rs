//! Events the core emits for the presentation layer.
//!
//! The core never renders anything itself: it pushes [`CoreEvent`]s into an
//! [`EventSink`] and whoever holds the receiving end (the shell, a test)
//! decides what to show. Scan alerts pass through [`AlertGate`] so each scan
//! entry is surfaced at most once.

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::connectivity::ConnectivityState;
use crate::models::{ScanLogEntry, ScanOutcome};

/// Notifications from the core to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A queued query was answered during reconciliation.
    QueryResolved { id: i64, text: String },
    /// A queued query hit the retry ceiling and was given up on.
    QueryFailed { id: i64 },
    /// A scan cycle finished and was logged.
    ScanCompleted(ScanLogEntry),
    /// The connectivity monitor committed a state transition.
    ConnectivityChanged(ConnectivityState),
    /// A storage write failed; the operation will be retried later.
    StorageFault { operation: &'static str, message: String },
}

impl CoreEvent {
    /// One-line human-readable rendering for the shell.
    pub fn summary(&self) -> String {
        match self {
            CoreEvent::QueryResolved { id, text } => {
                format!("[queued #{}] {}", id, text)
            }
            CoreEvent::QueryFailed { id } => {
                format!("[queued #{}] could not be answered, giving up", id)
            }
            CoreEvent::ScanCompleted(entry) => match entry.outcome {
                ScanOutcome::Clean => format!("[scan #{}] clean: {}", entry.id, entry.detail),
                ScanOutcome::ThreatFound => format!(
                    "[scan #{}] THREAT FOUND{}: {}",
                    entry.id,
                    if entry.isolated { " (isolated)" } else { "" },
                    entry.detail
                ),
            },
            CoreEvent::ConnectivityChanged(state) => {
                if state.is_online {
                    "[network] back online".to_string()
                } else {
                    "[network] offline, new questions will be queued".to_string()
                }
            }
            CoreEvent::StorageFault { operation, message } => {
                format!("[storage] {} failed: {} (will retry)", operation, message)
            }
        }
    }
}

/// Sending half handed to every background task.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. A closed receiver (UI gone during shutdown) is not an error.
    pub fn emit(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event receiver closed, dropping event");
        }
    }

    pub fn storage_fault(&self, operation: &'static str, error: &dyn std::fmt::Display) {
        self.emit(CoreEvent::StorageFault {
            operation,
            message: error.to_string(),
        });
    }
}

/// Makes scan alerts idempotent: each scan entry id passes at most once.
#[derive(Debug, Default)]
pub struct AlertGate {
    surfaced: HashSet<i64>,
}

impl AlertGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this event should be shown. Non-scan events always pass.
    pub fn admit(&mut self, event: &CoreEvent) -> bool {
        match event {
            CoreEvent::ScanCompleted(entry) => self.surfaced.insert(entry.id),
            _ => true,
        }
    }
}
