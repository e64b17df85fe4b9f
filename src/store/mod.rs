//! Persistent store backed by SQLite.
//!
//! Records chat turns, the unanswered-query queue, scan log entries, and a
//! small key/value settings table (scan schedule, API keys). This is the
//! single source of truth after a restart.
//!
//! Design:
//! - WAL mode with `synchronous=FULL`: a write has hit the disk when the call returns
//! - Two connection lanes on one file, each behind its own mutex: the
//!   conversation lane (chat + queue) and the scan lane (scan log + settings).
//!   A scan cycle never waits for a reconciliation batch and vice versa.
//! - Queue settlement (resolve / fail) and its chat turn commit in one transaction
//! - Write transactions begin IMMEDIATE so the two lanes wait on the busy
//!   timeout instead of failing a read-to-write upgrade

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::{SETTING_SCAN_SCHEDULE, SQLITE_BUSY_TIMEOUT_MS};
use crate::models::{
    ChatTurn, NewScanEntry, NewTurn, QueueStatus, QueuedQuery, Role, ScanLogEntry, ScanOutcome,
    ScanSchedule, TurnSource,
};

// ── Errors ────────────────────────────────────────────────────────

/// Failure of a storage operation. Fatal to the current operation only;
/// callers leave their state unchanged and retry on the next tick or action.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored setting is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no queued query with id {0}")]
    UnknownQuery(i64),
    #[error("storage lane lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of settling (resolving or failing) a queued query.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// The query moved out of `pending`; the turn was written with it.
    Settled(ChatTurn),
    /// The query was already settled; nothing changed.
    AlreadySettled(QueueStatus),
}

// ── Store ─────────────────────────────────────────────────────────

/// Persistent store backed by SQLite.
pub struct Store {
    path: PathBuf,
    /// Chat history and the unanswered queue.
    conversation: Mutex<Connection>,
    /// Scan log and settings.
    scans: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conversation = open_lane(path)?;
        init_schema(&conversation)?;
        let scans = open_lane(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            conversation: Mutex::new(conversation),
            scans: Mutex::new(scans),
        })
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conversation(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conversation.lock().map_err(|_| StoreError::Poisoned)
    }

    fn scans(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.scans.lock().map_err(|_| StoreError::Poisoned)
    }

    // ── Chat history ──────────────────────────────────────────────

    /// Append an immutable chat turn.
    #[cfg(test)]
    pub fn append(&self, turn: &NewTurn) -> StoreResult<ChatTurn> {
        let conn = self.conversation()?;
        Ok(insert_turn(&conn, turn)?)
    }

    /// The most recent `limit` turns, oldest first, ordered by timestamp.
    pub fn history(&self, limit: usize) -> StoreResult<Vec<ChatTurn>> {
        let conn = self.conversation()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, role, text, source, query_id FROM chat_turns
             ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], turn_from_row)?;
        let mut turns = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// Turns written for a given queued query.
    #[cfg(test)]
    pub fn turns_for_query(&self, query_id: i64) -> StoreResult<Vec<ChatTurn>> {
        let conn = self.conversation()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, role, text, source, query_id FROM chat_turns
             WHERE query_id = ?1 ORDER BY ts ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![query_id], turn_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Unanswered queue ──────────────────────────────────────────

    /// Queue a question for later, with `attempts = 0` and status `pending`.
    #[cfg(test)]
    pub fn enqueue(&self, text: &str, asked_at: DateTime<Utc>) -> StoreResult<QueuedQuery> {
        let conn = self.conversation()?;
        Ok(insert_query(&conn, text, asked_at)?)
    }

    /// Record a question together with its immediate reply, all-or-nothing.
    pub fn append_exchange(
        &self,
        question: &NewTurn,
        reply: &NewTurn,
    ) -> StoreResult<(ChatTurn, ChatTurn)> {
        let mut conn = self.conversation()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let asked = insert_turn(&tx, question)?;
        let answered = insert_turn(&tx, reply)?;
        tx.commit()?;
        Ok((asked, answered))
    }

    /// Record a question, queue it and append the interim reply linked to
    /// the new query, in one transaction. On error nothing is written, so
    /// asking again cannot queue the same question twice.
    pub fn enqueue_exchange(
        &self,
        question: &NewTurn,
        interim: &NewTurn,
    ) -> StoreResult<(QueuedQuery, ChatTurn)> {
        let mut conn = self.conversation()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_turn(&tx, question)?;
        let query = insert_query(&tx, &question.text, question.timestamp)?;
        let reply = insert_turn(&tx, &interim.clone().with_query(query.id))?;
        tx.commit()?;
        Ok((query, reply))
    }

    /// Pending queries in insertion order.
    pub fn list_pending(&self) -> StoreResult<Vec<QueuedQuery>> {
        self.queue_entries(Some(QueueStatus::Pending))
    }

    /// Queue records, optionally filtered by status, in insertion order.
    pub fn queue_entries(&self, status: Option<QueueStatus>) -> StoreResult<Vec<QueuedQuery>> {
        let conn = self.conversation()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, text, attempts, status, answer FROM queued_queries
             WHERE (?1 IS NULL OR status = ?1) ORDER BY id ASC",
        )?;
        let filter = status.map(|s| s.to_string());
        let rows = stmt.query_map(params![filter], query_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Point lookup of a queued query.
    pub fn get_query(&self, id: i64) -> StoreResult<Option<QueuedQuery>> {
        let conn = self.conversation()?;
        Ok(conn
            .query_row(
                "SELECT id, ts, text, attempts, status, answer FROM queued_queries WHERE id = ?1",
                params![id],
                query_from_row,
            )
            .optional()?)
    }

    /// Resolve a pending query and append its answer turn atomically.
    ///
    /// The turn carries the query's original timestamp. Resolving a query
    /// that is already settled is a no-op.
    pub fn resolve(&self, id: i64, answer: &str) -> StoreResult<Settlement> {
        let mut conn = self.conversation()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let asked_at = match pending_timestamp(&tx, id)? {
            Ok(ts) => ts,
            Err(status) => return Ok(Settlement::AlreadySettled(status)),
        };

        tx.execute(
            "UPDATE queued_queries SET status = 'resolved', answer = ?1, updated_ts = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![answer, now_ms(), id],
        )?;
        let turn = insert_turn(
            &tx,
            &NewTurn {
                timestamp: asked_at,
                role: Role::Assistant,
                text: answer.to_string(),
                source: TurnSource::QueuedResolved,
                query_id: Some(id),
            },
        )?;
        tx.commit()?;
        Ok(Settlement::Settled(turn))
    }

    /// Count one provider failure against a pending query. Returns the new
    /// attempts count; settled queries are left untouched.
    pub fn record_attempt(&self, id: i64) -> StoreResult<u32> {
        let conn = self.conversation()?;
        conn.execute(
            "UPDATE queued_queries SET attempts = attempts + 1, updated_ts = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now_ms(), id],
        )?;
        conn.query_row(
            "SELECT attempts FROM queued_queries WHERE id = ?1",
            params![id],
            |row| row.get::<_, u32>(0),
        )
        .optional()?
        .ok_or(StoreError::UnknownQuery(id))
    }

    /// Give up on a pending query and append the user-visible notice turn
    /// atomically. The record itself stays for audit.
    pub fn mark_failed(&self, id: i64, notice: &str) -> StoreResult<Settlement> {
        let mut conn = self.conversation()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let asked_at = match pending_timestamp(&tx, id)? {
            Ok(ts) => ts,
            Err(status) => return Ok(Settlement::AlreadySettled(status)),
        };

        tx.execute(
            "UPDATE queued_queries SET status = 'failed', updated_ts = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now_ms(), id],
        )?;
        let turn = insert_turn(
            &tx,
            &NewTurn {
                timestamp: asked_at,
                role: Role::Assistant,
                text: notice.to_string(),
                source: TurnSource::Local,
                query_id: Some(id),
            },
        )?;
        tx.commit()?;
        Ok(Settlement::Settled(turn))
    }

    // ── Scan log ──────────────────────────────────────────────────

    /// Append a scan log entry without touching the schedule.
    #[cfg(test)]
    pub fn append_scan_log(&self, entry: &NewScanEntry) -> StoreResult<ScanLogEntry> {
        let conn = self.scans()?;
        Ok(insert_scan(&conn, entry)?)
    }

    /// Append the entry for a completed cycle and advance the schedule's
    /// `last_run` to the entry's timestamp, in one transaction. `fallback`
    /// is used when no schedule has been persisted yet.
    pub fn record_scan_cycle(
        &self,
        entry: &NewScanEntry,
        fallback: &ScanSchedule,
    ) -> StoreResult<(ScanLogEntry, ScanSchedule)> {
        let mut conn = self.scans()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let logged = insert_scan(&tx, entry)?;
        let mut schedule = read_setting::<ScanSchedule>(&tx, SETTING_SCAN_SCHEDULE)?
            .unwrap_or_else(|| fallback.clone());
        schedule.last_run = Some(logged.timestamp);
        write_setting(&tx, SETTING_SCAN_SCHEDULE, &schedule)?;

        tx.commit()?;
        Ok((logged, schedule))
    }

    /// The most recent `limit` scan entries, newest first.
    pub fn recent_scans(&self, limit: usize) -> StoreResult<Vec<ScanLogEntry>> {
        let conn = self.scans()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, outcome, detail, isolated FROM scan_log
             ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], scan_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Point lookup of a scan entry.
    #[cfg(test)]
    pub fn get_scan(&self, id: i64) -> StoreResult<Option<ScanLogEntry>> {
        let conn = self.scans()?;
        Ok(conn
            .query_row(
                "SELECT id, ts, outcome, detail, isolated FROM scan_log WHERE id = ?1",
                params![id],
                scan_from_row,
            )
            .optional()?)
    }

    // ── Settings ──────────────────────────────────────────────────

    pub fn read_schedule(&self) -> StoreResult<Option<ScanSchedule>> {
        self.get_setting(SETTING_SCAN_SCHEDULE)
    }

    pub fn write_schedule(&self, schedule: &ScanSchedule) -> StoreResult<()> {
        self.set_setting(SETTING_SCAN_SCHEDULE, schedule)
    }

    /// The persisted schedule, seeding it with `default_interval_secs` on first use.
    pub fn schedule_or_seed(&self, default_interval_secs: u64) -> StoreResult<ScanSchedule> {
        if let Some(schedule) = self.read_schedule()? {
            return Ok(schedule);
        }
        let schedule = ScanSchedule::new(default_interval_secs);
        self.write_schedule(&schedule)?;
        Ok(schedule)
    }

    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let conn = self.scans()?;
        read_setting(&conn, key)
    }

    pub fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let conn = self.scans()?;
        write_setting(&conn, key, value)
    }

    // ── Diagnostics ───────────────────────────────────────────────

    /// Get database file size in bytes.
    pub fn db_size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Row counts for each table (for the status display).
    pub fn table_stats(&self) -> StoreResult<Vec<(String, u64)>> {
        let mut stats = Vec::new();
        {
            let conn = self.conversation()?;
            for table in ["chat_turns", "queued_queries"] {
                stats.push((table.to_string(), count_rows(&conn, table)?));
            }
        }
        let conn = self.scans()?;
        for table in ["scan_log", "settings"] {
            stats.push((table.to_string(), count_rows(&conn, table)?));
        }
        Ok(stats)
    }
}

// ── Schema ────────────────────────────────────────────────────────

fn open_lane(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    // Durable before return, not just crash-consistent
    conn.execute_batch("PRAGMA synchronous=FULL;")?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chat_turns (
            id          INTEGER PRIMARY KEY,
            ts          INTEGER NOT NULL,
            role        TEXT NOT NULL,
            text        TEXT NOT NULL,
            source      TEXT NOT NULL,
            query_id    INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_chat_ts ON chat_turns(ts);
        CREATE INDEX IF NOT EXISTS idx_chat_query ON chat_turns(query_id);

        CREATE TABLE IF NOT EXISTS queued_queries (
            id          INTEGER PRIMARY KEY,
            ts          INTEGER NOT NULL,
            text        TEXT NOT NULL,
            attempts    INTEGER NOT NULL DEFAULT 0,
            status      TEXT NOT NULL DEFAULT 'pending',
            answer      TEXT,
            updated_ts  INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_queue_status ON queued_queries(status, id);

        CREATE TABLE IF NOT EXISTS scan_log (
            id          INTEGER PRIMARY KEY,
            ts          INTEGER NOT NULL,
            outcome     TEXT NOT NULL,
            detail      TEXT NOT NULL,
            isolated    INTEGER NOT NULL DEFAULT 0,
            CHECK (isolated = 0 OR outcome = 'threat-found')
        );
        CREATE INDEX IF NOT EXISTS idx_scan_ts ON scan_log(ts);

        CREATE TABLE IF NOT EXISTS settings (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL
        );",
    )
}

// ── Row helpers ───────────────────────────────────────────────────

fn insert_turn(conn: &Connection, turn: &NewTurn) -> rusqlite::Result<ChatTurn> {
    let ts = turn.timestamp.timestamp_millis();
    conn.execute(
        "INSERT INTO chat_turns (ts, role, text, source, query_id) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            ts,
            turn.role.to_string(),
            turn.text,
            turn.source.to_string(),
            turn.query_id
        ],
    )?;
    Ok(ChatTurn {
        id: conn.last_insert_rowid(),
        timestamp: from_ms(ts),
        role: turn.role,
        text: turn.text.clone(),
        source: turn.source,
        query_id: turn.query_id,
    })
}

fn insert_query(
    conn: &Connection,
    text: &str,
    asked_at: DateTime<Utc>,
) -> rusqlite::Result<QueuedQuery> {
    let ts = asked_at.timestamp_millis();
    conn.execute(
        "INSERT INTO queued_queries (ts, text, attempts, status) VALUES (?1, ?2, 0, 'pending')",
        params![ts, text],
    )?;
    Ok(QueuedQuery {
        id: conn.last_insert_rowid(),
        timestamp: from_ms(ts),
        text: text.to_string(),
        attempts: 0,
        status: QueueStatus::Pending,
        answer: None,
    })
}

fn insert_scan(conn: &Connection, entry: &NewScanEntry) -> rusqlite::Result<ScanLogEntry> {
    let ts = entry.timestamp().timestamp_millis();
    conn.execute(
        "INSERT INTO scan_log (ts, outcome, detail, isolated) VALUES (?1, ?2, ?3, ?4)",
        params![
            ts,
            entry.outcome().to_string(),
            entry.detail(),
            entry.isolated()
        ],
    )?;
    Ok(ScanLogEntry {
        id: conn.last_insert_rowid(),
        timestamp: from_ms(ts),
        outcome: entry.outcome(),
        detail: entry.detail().to_string(),
        isolated: entry.isolated(),
    })
}

/// `Ok(Ok(ts))` for a pending query, `Ok(Err(status))` for a settled one.
fn pending_timestamp(
    conn: &Connection,
    id: i64,
) -> StoreResult<Result<DateTime<Utc>, QueueStatus>> {
    let row = conn
        .query_row(
            "SELECT ts, status FROM queued_queries WHERE id = ?1",
            params![id],
            |row| {
                let ts: i64 = row.get(0)?;
                let status = enum_col(row, 1, QueueStatus::from_str)?;
                Ok((ts, status))
            },
        )
        .optional()?;

    match row {
        None => Err(StoreError::UnknownQuery(id)),
        Some((ts, QueueStatus::Pending)) => Ok(Ok(from_ms(ts))),
        Some((_, status)) => Ok(Err(status)),
    }
}

fn read_setting<T: DeserializeOwned>(conn: &Connection, key: &str) -> StoreResult<Option<T>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn write_setting<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> StoreResult<()> {
    let json = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, json],
    )?;
    Ok(())
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
        row.get(0)
    })
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<ChatTurn> {
    Ok(ChatTurn {
        id: row.get(0)?,
        timestamp: from_ms(row.get(1)?),
        role: enum_col(row, 2, Role::from_str)?,
        text: row.get(3)?,
        source: enum_col(row, 4, TurnSource::from_str)?,
        query_id: row.get(5)?,
    })
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedQuery> {
    Ok(QueuedQuery {
        id: row.get(0)?,
        timestamp: from_ms(row.get(1)?),
        text: row.get(2)?,
        attempts: row.get(3)?,
        status: enum_col(row, 4, QueueStatus::from_str)?,
        answer: row.get(5)?,
    })
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanLogEntry> {
    Ok(ScanLogEntry {
        id: row.get(0)?,
        timestamp: from_ms(row.get(1)?),
        outcome: enum_col(row, 2, ScanOutcome::from_str)?,
        detail: row.get(3)?,
        isolated: row.get(4)?,
    })
}

/// Decode a text column into one of our enums, reporting unknown values as
/// conversion failures rather than silently defaulting.
fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected value {:?}", raw).into(),
        )
    })
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Current time as Unix epoch milliseconds.
fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Tests ─────────────────────────────────────────────────────────
