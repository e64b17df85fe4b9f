//! # CyberSentinel - offline-aware security assistant
//!
//! Answers security questions from a local knowledge base or a remote AI
//! provider. Questions asked while offline are queued durably and answered
//! automatically once the connection is back. A scheduler runs periodic
//! device scans and records every result.

mod ai;
mod app;
mod assistant;
mod config;
mod connectivity;
pub mod constants;
mod logging;
mod models;
mod notifications;
mod reconcile;
mod scanner;
mod shell;
mod store;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};

use assistant::AskOutcome;
use config::{Config, ProviderKind};
use constants::{
    DEFAULT_LIST_LIMIT, MAX_SCAN_INTERVAL_SECS, MIN_SCAN_INTERVAL_SECS, SETTING_SCAN_SCHEDULE,
};
use models::QueueStatus;
use scanner::{CleanPolicy, HeuristicPolicy, ScanPolicy};
use shell::render;
use store::Store;

/// CyberSentinel - security assistant with offline queueing and scheduled scans
#[derive(Parser, Debug)]
#[command(name = "cybersentinel", version, about = "Offline-aware security assistant shell")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (default ~/.config/cybersentinel/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Database file, overrides the config
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// AI provider (openai, huggingface, none), overrides the config
    #[arg(long, global = true, value_name = "KIND")]
    provider: Option<String>,

    /// Scan decision policy
    #[arg(long, global = true, value_enum, default_value_t = PolicyArg::Heuristic)]
    policy: PolicyArg,

    /// Log at info level (CYBERSENTINEL_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Suspicious process names and risky downloads
    Heuristic,
    /// Always reports clean
    Clean,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive shell (the default)
    Shell,
    /// Ask one question
    Ask {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Run one scan now
    Scan,
    /// Show recent chat turns
    History {
        #[arg(long, short = 'n', default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Show queued questions (pending only unless --all)
    Queue {
        #[arg(long)]
        all: bool,
    },
    /// Show recent scan results
    Scans {
        #[arg(long, short = 'n', default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Show or change the automatic scan schedule
    Schedule {
        /// Interval in minutes (5 to 525600, 0 disables)
        #[arg(long, value_name = "N")]
        interval_minutes: Option<u64>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Read or write a stored setting (e.g. openai_api_key)
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Create the database schema and report where it lives
    InitDb,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Set { key: String, value: String },
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    // Provider API keys may live in a .env next to the config (optional, never committed)
    let _ = dotenvy::from_path(constants::env_file_path());

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    if let Some(kind) = &cli.provider {
        match ProviderKind::from_str(kind) {
            Some(k) => config.provider.kind = k,
            None => bail!("unknown provider '{}' (expected openai, huggingface or none)", kind),
        }
    }

    match cli.command.unwrap_or(Command::Shell) {
        Command::Shell => {
            let app = app::App::new(config, policy(cli.policy))?;
            shell::run(&app).await
        }
        Command::Ask { text } => {
            let app = app::App::new(config, policy(cli.policy))?;
            let outcome = app.ask_once(&text.join(" ")).await?;
            println!("{}", render::reply(outcome.reply()));
            if let AskOutcome::Queued { query, .. } = outcome {
                println!("(queued as #{}; it will be answered next time the shell is online)", query.id);
            }
            Ok(())
        }
        Command::Scan => {
            let app = app::App::new(config, policy(cli.policy))?;
            match app.scan_once().await? {
                Some(entry) => println!("{}", render::scan_line(&entry)),
                None => println!("No scan was recorded."),
            }
            Ok(())
        }
        Command::History { limit } => {
            let store = open_store(&config)?;
            print_lines(render::history_lines(&store.history(limit)?));
            Ok(())
        }
        Command::Queue { all } => {
            let store = open_store(&config)?;
            let filter = if all { None } else { Some(QueueStatus::Pending) };
            print_lines(render::queue_lines(&store.queue_entries(filter)?));
            Ok(())
        }
        Command::Scans { limit } => {
            let store = open_store(&config)?;
            print_lines(render::scan_lines(&store.recent_scans(limit)?));
            Ok(())
        }
        Command::Schedule {
            interval_minutes,
            enable,
            disable,
        } => {
            let store = open_store(&config)?;
            let mut schedule = store.schedule_or_seed(config.scan_interval_secs)?;
            let changed = interval_minutes.is_some() || enable || disable;
            if let Some(minutes) = interval_minutes {
                if minutes == 0 {
                    schedule.interval_secs = 0;
                    schedule.enabled = false;
                } else {
                    schedule.interval_secs = interval_from_minutes(minutes);
                    schedule.enabled = true;
                }
            }
            if enable {
                if schedule.interval_secs == 0 {
                    bail!("set --interval-minutes before enabling automatic scans");
                }
                schedule.enabled = true;
            }
            if disable {
                schedule.enabled = false;
            }
            if changed {
                store.write_schedule(&schedule)?;
                tracing::info!(interval_secs = schedule.interval_secs, enabled = schedule.enabled, "scan schedule updated");
            }
            print_lines(render::schedule_lines(&schedule, Utc::now()));
            Ok(())
        }
        Command::Settings { action } => {
            let store = open_store(&config)?;
            match action {
                SettingsAction::Set { key, value } => {
                    if key == SETTING_SCAN_SCHEDULE {
                        bail!("use the `schedule` command to change the scan schedule");
                    }
                    store.set_setting(&key, &value)?;
                    println!("{} saved.", key);
                }
                SettingsAction::Get { key } => match store.get_setting::<serde_json::Value>(&key)? {
                    Some(value) => println!("{} = {}", key, display_setting(&key, &value)),
                    None => println!("{} is not set.", key),
                },
            }
            Ok(())
        }
        Command::InitDb => {
            let store = open_store(&config)?;
            println!("Database ready at {}", store.path().display());
            for (table, rows) in store.table_stats()? {
                println!("  {:<15} {} rows", table, rows);
            }
            Ok(())
        }
    }
}

fn policy(arg: PolicyArg) -> Arc<dyn ScanPolicy> {
    match arg {
        PolicyArg::Heuristic => Arc::new(HeuristicPolicy::default()),
        PolicyArg::Clean => Arc::new(CleanPolicy),
    }
}

/// Scan interval in seconds for a non-zero minute count, clamped to the accepted range.
fn interval_from_minutes(minutes: u64) -> u64 {
    minutes
        .checked_mul(60)
        .unwrap_or(u64::MAX)
        .clamp(MIN_SCAN_INTERVAL_SECS, MAX_SCAN_INTERVAL_SECS)
}

fn open_store(config: &Config) -> Result<Store> {
    Store::open(&config.database_path)
        .with_context(|| format!("Failed to open database at {}", config.database_path.display()))
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

/// Render a stored setting, masking API keys.
fn display_setting(key: &str, value: &serde_json::Value) -> String {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if key.ends_with("_api_key") {
        let visible: String = text.chars().take(4).collect();
        format!("{}****", visible)
    } else {
        text
    }
}
