use std::fmt;

use chrono::{DateTime, Utc};

/// Who wrote a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl Role {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Where the text of a chat turn came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSource {
    /// Typed by the user or produced without the network.
    Local,
    /// Answered synchronously by the remote provider.
    Online,
    /// Answered later by reconciliation of a queued query.
    QueuedResolved,
}

impl fmt::Display for TurnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnSource::Local => write!(f, "local"),
            TurnSource::Online => write!(f, "online"),
            TurnSource::QueuedResolved => write!(f, "queued-resolved"),
        }
    }
}

impl TurnSource {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(TurnSource::Local),
            "online" => Some(TurnSource::Online),
            "queued-resolved" => Some(TurnSource::QueuedResolved),
            _ => None,
        }
    }
}

/// A persisted, immutable chat turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub text: String,
    pub source: TurnSource,
    /// The queued query this turn answers, if any.
    pub query_id: Option<i64>,
}

/// A chat turn that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub text: String,
    pub source: TurnSource,
    pub query_id: Option<i64>,
}

impl NewTurn {
    pub fn user(text: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            role: Role::User,
            text: text.to_string(),
            source: TurnSource::Local,
            query_id: None,
        }
    }

    pub fn assistant(text: &str, source: TurnSource) -> Self {
        Self {
            timestamp: Utc::now(),
            role: Role::Assistant,
            text: text.to_string(),
            source,
            query_id: None,
        }
    }

    pub fn with_query(mut self, query_id: i64) -> Self {
        self.query_id = Some(query_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip() {
        for role in [Role::User, Role::Assistant] {
            assert_eq!(Role::from_str(&role.to_string()), Some(role));
        }
        assert_eq!(Role::from_str("system"), None);
    }

    #[test]
    fn source_roundtrip() {
        for source in [TurnSource::Local, TurnSource::Online, TurnSource::QueuedResolved] {
            assert_eq!(TurnSource::from_str(&source.to_string()), Some(source));
        }
        assert_eq!(TurnSource::QueuedResolved.to_string(), "queued-resolved");
    }

    #[test]
    fn constructors_set_role_and_source() {
        let u = NewTurn::user("is ssh safe?");
        assert_eq!(u.role, Role::User);
        assert_eq!(u.source, TurnSource::Local);
        assert!(u.query_id.is_none());

        let a = NewTurn::assistant("mostly", TurnSource::Online).with_query(7);
        assert_eq!(a.role, Role::Assistant);
        assert_eq!(a.source, TurnSource::Online);
        assert_eq!(a.query_id, Some(7));
    }
}
