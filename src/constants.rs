//! Application-wide constants.
//!
//! Centralizes the defaults, thresholds, and filesystem locations used by the
//! queue, the connectivity monitor and the scan scheduler.

use std::path::PathBuf;

// ── Connectivity ──────────────────────────────────────────────────
/// Default connectivity poll interval (seconds).
pub const DEFAULT_CONNECTIVITY_POLL_SECS: u64 = 5;
/// Default time a restored connection must stay up before reconciling (seconds).
pub const DEFAULT_CONNECTIVITY_DEBOUNCE_SECS: u64 = 10;
/// Default timeout for a single reachability probe (seconds).
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;
/// Reachability endpoints, tried in order until one answers.
pub const DEFAULT_PROBE_URLS: &[&str] = &[
    "https://clients3.google.com/generate_204",
    "https://1.1.1.1",
];

// ── Queue / Reconciliation ────────────────────────────────────────
/// Provider failures tolerated before a queued query is marked failed.
pub const DEFAULT_RETRY_CEILING: u32 = 3;
/// Default timeout for one AI provider call (seconds).
pub const DEFAULT_AI_TIMEOUT_SECS: u64 = 30;
/// Text of the assistant turn written when a queued query is given up on.
pub const COULD_NOT_ANSWER_TEXT: &str =
    "I could not get an answer for this question after several attempts. Please ask again later.";

// ── Scanning ──────────────────────────────────────────────────────
/// Default automatic scan interval (6 hours, in seconds).
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 6 * 3600;
/// Smallest interval accepted from the schedule settings command (seconds).
pub const MIN_SCAN_INTERVAL_SECS: u64 = 5 * 60;
/// Largest interval accepted from settings or the config file (one year, in seconds).
pub const MAX_SCAN_INTERVAL_SECS: u64 = 365 * 24 * 3600;
/// Grace period after a scan during which automatic ticks are ignored (seconds).
pub const DEFAULT_SCAN_COOLDOWN_SECS: u64 = 60;
/// Upper bound on how long the scheduler sleeps between due checks (seconds).
pub const SCAN_TICK_MAX_SECS: u64 = 30;
/// Process name fragments the heuristic policy treats as suspicious.
pub const SUSPICIOUS_PROCESS_KEYWORDS: &[&str] = &["keylogger", "miner", "rat", "spy", "sniff", "ddos"];
/// File extensions the heuristic policy treats as risky downloads.
pub const RISKY_FILE_EXTENSIONS: &[&str] = &[".apk", ".exe", ".sh", ".bat"];
/// Maximum risky files collected in one scan.
pub const MAX_RISKY_FILES: usize = 50;
/// Hits that saturate the threat score at 1.0.
pub const THREAT_SCORE_SATURATION: f64 = 10.0;

// ── Local knowledge ───────────────────────────────────────────────
/// Minimum Jaccard similarity for a local knowledge match.
pub const KNOWLEDGE_MATCH_THRESHOLD: f64 = 0.2;
/// Reply used while offline when the knowledge base has nothing relevant.
pub const OFFLINE_FALLBACK_TEXT: &str = "I am currently operating in offline mode. Based on my onboard knowledge, here are best practices: \
1) Keep OS and apps updated. 2) Use a password manager and MFA. 3) Avoid sideloading unknown APKs. \
4) Back up regularly. 5) Use device encryption. I have queued your question and will answer it once we are back online.";

/// Reply used when the provider answered with an error and nothing local matches.
pub const PROVIDER_FALLBACK_TEXT: &str = "The AI provider could not answer that right now. \
General guidance: keep software updated, use unique passwords with MFA, and only install apps from trusted sources.";

// ── AI providers ──────────────────────────────────────────────────
/// OpenAI chat completions endpoint.
pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
/// Default OpenAI model.
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
/// Hugging Face inference endpoint prefix.
pub const HUGGINGFACE_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";
/// Default Hugging Face model.
pub const DEFAULT_HUGGINGFACE_MODEL: &str = "meta-llama/Meta-Llama-3-8B-Instruct";
/// Maximum new tokens requested from the inference API.
pub const HF_MAX_NEW_TOKENS: u32 = 256;
/// Sampling temperature for provider requests.
pub const PROVIDER_TEMPERATURE: f32 = 0.2;
/// Settings keys for API keys entered through the CLI.
pub const SETTING_OPENAI_KEY: &str = "openai_api_key";
pub const SETTING_HUGGINGFACE_KEY: &str = "huggingface_api_key";

// ── Storage ───────────────────────────────────────────────────────
/// Settings key holding the persisted scan schedule.
pub const SETTING_SCAN_SCHEDULE: &str = "scan_schedule";
/// How long a writer waits for a competing SQLite lock (ms).
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5000;

// ── Shell ─────────────────────────────────────────────────────────
/// Default number of rows shown by history listings.
pub const DEFAULT_LIST_LIMIT: usize = 20;
/// Maximum characters of a message shown in one history line.
pub const HISTORY_PREVIEW_LEN: usize = 60;

// ── Paths ─────────────────────────────────────────────────────────

/// Returns the user's home directory, falling back to /tmp.
pub fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Returns `~/.config/cybersentinel/`.
pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("cybersentinel")
}

/// Returns `~/.config/cybersentinel/config.toml`.
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Returns `~/.config/cybersentinel/.env` (provider API keys, never committed).
pub fn env_file_path() -> PathBuf {
    config_dir().join(".env")
}

/// Returns `~/.local/share/cybersentinel/`.
pub fn data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("cybersentinel")
}

/// Returns `~/.local/share/cybersentinel/cybersentinel.db`.
pub fn default_database_path() -> PathBuf {
    data_dir().join("cybersentinel.db")
}

/// Returns `~/.local/share/cybersentinel/kb.json` (user-learned answers).
pub fn default_knowledge_base_path() -> PathBuf {
    data_dir().join("kb.json")
}

/// Returns `~/Downloads`.
pub fn downloads_dir() -> PathBuf {
    home_dir().join("Downloads")
}
