use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Result of one scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    ThreatFound,
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Clean => write!(f, "clean"),
            ScanOutcome::ThreatFound => write!(f, "threat-found"),
        }
    }
}

impl ScanOutcome {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(ScanOutcome::Clean),
            "threat-found" => Some(ScanOutcome::ThreatFound),
            _ => None,
        }
    }
}

/// One persisted scan cycle. Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub outcome: ScanOutcome,
    pub detail: String,
    /// Only ever true for `ThreatFound`.
    pub isolated: bool,
}

/// A scan log entry that has not been written yet.
///
/// Fields are private so a clean entry can never carry isolation state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScanEntry {
    timestamp: DateTime<Utc>,
    outcome: ScanOutcome,
    detail: String,
    isolated: bool,
}

impl NewScanEntry {
    pub fn clean(timestamp: DateTime<Utc>, detail: &str) -> Self {
        Self {
            timestamp,
            outcome: ScanOutcome::Clean,
            detail: detail.to_string(),
            isolated: false,
        }
    }

    pub fn threat(timestamp: DateTime<Utc>, detail: &str, isolated: bool) -> Self {
        Self {
            timestamp,
            outcome: ScanOutcome::ThreatFound,
            detail: detail.to_string(),
            isolated,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn outcome(&self) -> ScanOutcome {
        self.outcome
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn isolated(&self) -> bool {
        self.isolated
    }
}

/// Persisted scan schedule. Changed only through explicit settings commands;
/// the scheduler writes `last_run` after each completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSchedule {
    pub interval_secs: u64,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
}

impl ScanSchedule {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            enabled: interval_secs > 0,
            last_run: None,
        }
    }

    /// `None` when the interval does not fit a chrono duration.
    pub fn interval(&self) -> Option<Duration> {
        Duration::try_seconds(i64::try_from(self.interval_secs).ok()?)
    }

    /// Next automatic fire time. `anchor` stands in for `last_run` when no
    /// scan has ever run (typically the moment the scheduler started).
    /// An interval too large to land on a representable date is never due.
    pub fn next_due(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled || self.interval_secs == 0 {
            return None;
        }
        self.last_run
            .unwrap_or(anchor)
            .checked_add_signed(self.interval()?)
    }

    pub fn is_due(&self, now: DateTime<Utc>, anchor: DateTime<Utc>) -> bool {
        self.next_due(anchor).is_some_and(|due| now >= due)
    }
}
