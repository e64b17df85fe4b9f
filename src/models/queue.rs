use std::fmt;

use chrono::{DateTime, Utc};

/// Lifecycle of a queued query. Records are never deleted; they end in
/// `Resolved` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Resolved,
    Failed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Resolved => write!(f, "resolved"),
            QueueStatus::Failed => write!(f, "failed"),
        }
    }
}

impl QueueStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "resolved" => Some(QueueStatus::Resolved),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// A question that could not be answered online when it was asked.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedQuery {
    pub id: i64,
    /// When the user originally asked.
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// Provider failures counted against the retry ceiling.
    pub attempts: u32,
    pub status: QueueStatus,
    /// Answer text once resolved.
    pub answer: Option<String>,
}
