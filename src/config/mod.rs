use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::constants::*;

/// Which remote AI provider answers online questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    HuggingFace,
    /// No remote provider; everything is answered locally and nothing is reconciled.
    None,
}

impl ProviderKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "huggingface" | "hf" => Some(ProviderKind::HuggingFace),
            "none" | "off" => Some(ProviderKind::None),
            _ => None,
        }
    }
}

/// Remote provider selection.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Model override; `None` uses the provider's default.
    pub model: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            model: None,
        }
    }
}

/// Application configuration with sensible defaults.
///
/// Can be overridden via ~/.config/cybersentinel/config.toml
#[derive(Debug, Clone)]
pub struct Config {
    /// Automatic scan interval in seconds, used to seed the persisted schedule
    pub scan_interval_secs: u64,
    /// Provider failures tolerated before a queued query is marked failed
    pub retry_ceiling: u32,
    /// Connectivity probe interval in seconds
    pub connectivity_poll_secs: u64,
    /// How long a restored connection must hold before reconciling (seconds)
    pub connectivity_debounce_secs: u64,
    /// Try the local knowledge base before the remote provider
    pub offline_first: bool,
    /// Grace period after a scan that suppresses automatic ticks (seconds)
    pub scan_cooldown_secs: u64,
    /// Timeout for one provider call (seconds)
    pub ai_timeout_secs: u64,
    /// Timeout for one reachability probe (seconds)
    pub probe_timeout_secs: u64,
    /// Reachability endpoints, tried in order
    pub probe_urls: Vec<String>,
    /// SQLite database location
    pub database_path: PathBuf,
    /// User-learned knowledge base location
    pub knowledge_base_path: PathBuf,
    /// Name the assistant addresses the user by
    pub user_name: String,
    /// Remote provider selection
    pub provider: ProviderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            connectivity_poll_secs: DEFAULT_CONNECTIVITY_POLL_SECS,
            connectivity_debounce_secs: DEFAULT_CONNECTIVITY_DEBOUNCE_SECS,
            offline_first: true,
            scan_cooldown_secs: DEFAULT_SCAN_COOLDOWN_SECS,
            ai_timeout_secs: DEFAULT_AI_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            probe_urls: DEFAULT_PROBE_URLS.iter().map(|u| u.to_string()).collect(),
            database_path: default_database_path(),
            knowledge_base_path: default_knowledge_base_path(),
            user_name: "Analyst".to_string(),
            provider: ProviderConfig::default(),
        }
    }
}

impl Config {
    pub fn connectivity_poll_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_poll_secs)
    }

    pub fn connectivity_debounce(&self) -> Duration {
        Duration::from_secs(self.connectivity_debounce_secs)
    }

    pub fn scan_cooldown(&self) -> Duration {
        Duration::from_secs(self.scan_cooldown_secs)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// TOML-deserializable config file format.
/// All fields are optional; missing fields use defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    scan_interval_secs: Option<u64>,
    retry_ceiling: Option<u32>,
    connectivity_poll_secs: Option<u64>,
    connectivity_debounce_secs: Option<u64>,
    offline_first: Option<bool>,
    scan_cooldown_secs: Option<u64>,
    ai_timeout_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    probe_urls: Option<Vec<String>>,
    database_path: Option<PathBuf>,
    knowledge_base_path: Option<PathBuf>,
    user_name: Option<String>,
    provider: Option<FileProviderConfig>,
}

/// TOML-deserializable provider section.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileProviderConfig {
    kind: Option<String>,
    model: Option<String>,
}

impl Config {
    /// Load config from ~/.config/cybersentinel/config.toml, falling back to defaults
    /// for any missing fields. If the file doesn't exist, returns pure defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path with the same fallback rules as [`Config::load`].
    pub fn load_from(config_path: &Path) -> Self {
        let content = match std::fs::read_to_string(config_path) {
            Ok(c) => c,
            Err(_) => return Config::default(), // No config file, use defaults
        };
        Self::from_toml_str(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %config_path.display(),
                error = %e,
                "failed to parse config file, using defaults"
            );
            Config::default()
        })
    }

    /// Parse TOML text and merge it over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let file_config: FileConfig = toml::from_str(content)?;
        let mut config = Config::default();

        if let Some(v) = file_config.scan_interval_secs {
            config.scan_interval_secs = v.min(MAX_SCAN_INTERVAL_SECS); // 0 = automatic scans disabled
        }
        if let Some(v) = file_config.retry_ceiling {
            config.retry_ceiling = v.max(1);
        }
        if let Some(v) = file_config.connectivity_poll_secs {
            config.connectivity_poll_secs = v.max(1);
        }
        if let Some(v) = file_config.connectivity_debounce_secs {
            config.connectivity_debounce_secs = v;
        }
        if let Some(v) = file_config.offline_first {
            config.offline_first = v;
        }
        if let Some(v) = file_config.scan_cooldown_secs {
            config.scan_cooldown_secs = v.min(MAX_SCAN_INTERVAL_SECS);
        }
        if let Some(v) = file_config.ai_timeout_secs {
            config.ai_timeout_secs = v.max(1);
        }
        if let Some(v) = file_config.probe_timeout_secs {
            config.probe_timeout_secs = v.max(1);
        }
        if let Some(v) = file_config.probe_urls {
            if !v.is_empty() {
                config.probe_urls = v;
            }
        }
        if let Some(v) = file_config.database_path {
            config.database_path = v;
        }
        if let Some(v) = file_config.knowledge_base_path {
            config.knowledge_base_path = v;
        }
        if let Some(v) = file_config.user_name {
            if !v.is_empty() {
                config.user_name = v;
            }
        }

        if let Some(p) = file_config.provider {
            if let Some(kind) = p.kind {
                match ProviderKind::from_str(&kind) {
                    Some(k) => config.provider.kind = k,
                    None => tracing::warn!(kind = %kind, "unknown provider kind, keeping default"),
                }
            }
            if let Some(model) = p.model {
                if !model.is_empty() {
                    config.provider.model = Some(model);
                }
            }
        }

        Ok(config)
    }
}
