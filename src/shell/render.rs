//! Plain-text rendering for the shell and one-shot commands.

use chrono::{DateTime, Utc};

use crate::constants::HISTORY_PREVIEW_LEN;
use crate::models::{ChatTurn, QueuedQuery, Role, ScanLogEntry, ScanOutcome, ScanSchedule};
use crate::utils::{format_bytes, format_interval, format_local, preview};

pub const HELP_TEXT: &str = "\
Type a question and press Enter. Commands:
  /scan              run a scan now
  /history [N]       last N chat turns (default 20)
  /queue             questions waiting for a connection
  /scans [N]         last N scan results
  /status            connectivity, provider, scheduler and storage
  /help              this help
  /quit              exit (Ctrl-C also works)";

fn speaker(turn: &ChatTurn) -> String {
    match turn.role {
        Role::User => "you".to_string(),
        Role::Assistant => format!("sentinel [{}]", turn.source),
    }
}

/// Full reply as shown right after a question.
pub fn reply(turn: &ChatTurn) -> String {
    format!("{}: {}", speaker(turn), turn.text)
}

pub fn history_lines(turns: &[ChatTurn]) -> Vec<String> {
    if turns.is_empty() {
        return vec!["No conversation yet.".to_string()];
    }
    turns
        .iter()
        .map(|t| {
            format!(
                "{}  {}: {}",
                format_local(t.timestamp),
                speaker(t),
                preview(&t.text, HISTORY_PREVIEW_LEN)
            )
        })
        .collect()
}

pub fn queue_lines(queries: &[QueuedQuery]) -> Vec<String> {
    if queries.is_empty() {
        return vec!["Queue is empty.".to_string()];
    }
    queries
        .iter()
        .map(|q| {
            format!(
                "#{:<4} {:<8} attempts={}  {}  {}",
                q.id,
                q.status.to_string(),
                q.attempts,
                format_local(q.timestamp),
                preview(&q.text, HISTORY_PREVIEW_LEN)
            )
        })
        .collect()
}

pub fn scan_line(entry: &ScanLogEntry) -> String {
    let outcome = match entry.outcome {
        ScanOutcome::Clean => "clean".to_string(),
        ScanOutcome::ThreatFound if entry.isolated => "THREAT (isolated)".to_string(),
        ScanOutcome::ThreatFound => "THREAT".to_string(),
    };
    format!(
        "#{:<4} {}  {:<17} {}",
        entry.id,
        format_local(entry.timestamp),
        outcome,
        entry.detail
    )
}

pub fn scan_lines(entries: &[ScanLogEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["No scans recorded yet.".to_string()];
    }
    entries.iter().map(scan_line).collect()
}

pub fn schedule_lines(schedule: &ScanSchedule, anchor: DateTime<Utc>) -> Vec<String> {
    let mut lines = vec![
        format!("interval: {}", format_interval(schedule.interval_secs)),
        format!("enabled:  {}", if schedule.enabled { "yes" } else { "no" }),
        format!(
            "last run: {}",
            schedule
                .last_run
                .map(format_local)
                .unwrap_or_else(|| "never".to_string())
        ),
    ];
    if let Some(due) = schedule.next_due(anchor) {
        lines.push(format!("next due: {}", format_local(due)));
    }
    lines
}

/// Snapshot of runtime state for `/status`.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub online: bool,
    pub last_checked: DateTime<Utc>,
    pub provider: Option<String>,
    pub scheduler: &'static str,
    pub pending: usize,
    pub knowledge_pairs: usize,
    pub db_path: String,
    pub db_bytes: u64,
    pub tables: Vec<(String, u64)>,
}

pub fn status_lines(view: &StatusView) -> Vec<String> {
    let mut lines = vec![
        format!(
            "network:   {} (checked {})",
            if view.online { "online" } else { "offline" },
            format_local(view.last_checked)
        ),
        format!(
            "provider:  {}",
            view.provider.as_deref().unwrap_or("none (questions stay queued)")
        ),
        format!("scanner:   {}", view.scheduler),
        format!("queued:    {} pending", view.pending),
        format!("knowledge: {} local answers", view.knowledge_pairs),
        format!("database:  {} ({})", view.db_path, format_bytes(view.db_bytes)),
    ];
    for (table, rows) in &view.tables {
        lines.push(format!("  {:<15} {} rows", table, rows));
    }
    lines
}
