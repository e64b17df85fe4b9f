//! Interactive line-oriented shell.
//!
//! Plain lines are questions; lines starting with `/` are commands. Core
//! events are printed as they arrive, scan alerts at most once per entry.

pub mod render;

use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::app::{App, Services};
use crate::assistant::{AskOutcome, Assistant};
use crate::constants::DEFAULT_LIST_LIMIT;
use crate::notifications::AlertGate;
use crate::scanner::ManualScan;

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Ask(String),
    Scan,
    History(usize),
    Queue,
    Scans(usize),
    Status,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl ShellCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ShellCommand::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return ShellCommand::Ask(line.to_string());
        };

        let parts: Vec<&str> = command.split_whitespace().collect();
        let limit = parts
            .get(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LIST_LIMIT);
        match parts.first().map(|c| c.to_lowercase()).as_deref() {
            Some("scan") => ShellCommand::Scan,
            Some("history") | Some("h") => ShellCommand::History(limit),
            Some("queue") | Some("q") => ShellCommand::Queue,
            Some("scans") => ShellCommand::Scans(limit),
            Some("status") => ShellCommand::Status,
            Some("help") | Some("?") => ShellCommand::Help,
            Some("quit") | Some("exit") => ShellCommand::Quit,
            _ => ShellCommand::Unknown(line.to_string()),
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

/// Run the shell until `/quit`, end of input or Ctrl-C.
pub async fn run(app: &App) -> Result<()> {
    let mut services = app.start();
    let assistant = app.assistant(services.connectivity.clone());
    let mut gate = AlertGate::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!(
        "CyberSentinel ready, {}. Type /help for commands.",
        app.config().user_name
    );
    prompt();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = ShellCommand::parse(&line);
                if let Flow::Quit = execute(command, app, &assistant, &services).await {
                    break;
                }
                prompt();
            }
            Some(event) = services.events.recv() => {
                if gate.admit(&event) {
                    println!("\n{}", event.summary());
                    prompt();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    tracing::info!("shutting down");
    services.shutdown().await;
    println!("Goodbye.");
    Ok(())
}

async fn execute(
    command: ShellCommand,
    app: &App,
    assistant: &Assistant,
    services: &Services,
) -> Flow {
    let store = app.store();
    match command {
        ShellCommand::Empty => {}
        ShellCommand::Ask(text) => match assistant.ask(&text).await {
            Ok(outcome) => {
                println!("{}", render::reply(outcome.reply()));
                if let AskOutcome::Queued { query, .. } = outcome {
                    println!("(queued as #{}; the answer will appear here once online)", query.id);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "ask failed");
                println!("Could not save your question ({}). Please try again.", e);
            }
        },
        ShellCommand::Scan => match services.scans.request_scan() {
            ManualScan::Accepted => println!("Scan started."),
            ManualScan::AlreadyRunning => println!("A scan is already in progress."),
            ManualScan::Unavailable => println!("The scanner is not running."),
        },
        ShellCommand::History(limit) => match store.history(limit) {
            Ok(turns) => print_lines(render::history_lines(&turns)),
            Err(e) => println!("Could not read history: {}", e),
        },
        ShellCommand::Queue => match store.queue_entries(None) {
            Ok(queries) => print_lines(render::queue_lines(&queries)),
            Err(e) => println!("Could not read the queue: {}", e),
        },
        ShellCommand::Scans(limit) => match store.recent_scans(limit) {
            Ok(entries) => print_lines(render::scan_lines(&entries)),
            Err(e) => println!("Could not read scans: {}", e),
        },
        ShellCommand::Status => match app.status(services) {
            Ok(view) => print_lines(render::status_lines(&view)),
            Err(e) => println!("Could not read status: {}", e),
        },
        ShellCommand::Help => println!("{}", render::HELP_TEXT),
        ShellCommand::Quit => return Flow::Quit,
        ShellCommand::Unknown(line) => {
            println!("Unknown command: {}. Type /help for commands.", line)
        }
    }
    Flow::Continue
}
