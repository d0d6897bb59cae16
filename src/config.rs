//! Configuration file parser for ~/.config/feedsync/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as warnings, since they are
//! usually typos.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::util::HostPolicy;

/// Environment variable that overrides `news_api_key`.
pub const NEWS_API_KEY_ENV: &str = "NEWS_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level service configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// `news_api_key` is masked in the `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. `None` uses `feedsync.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Delay between two synchronization passes, in minutes.
    pub sync_interval_minutes: u64,

    /// Number of feeds fetched concurrently during a pass.
    pub sync_concurrency: usize,

    /// Synchronization outcomes kept per feed; older ones are pruned.
    pub sync_history_retention: i64,

    /// Per-request timeout for feed and page fetches, in seconds.
    pub request_timeout_secs: u64,

    /// Maximum accepted response body size, in bytes.
    pub max_feed_size_bytes: usize,

    /// Allow fetching loopback and private-network hosts.
    pub allow_private_hosts: bool,

    /// Base URL of the News API (must end with `/`).
    pub news_api_base_url: String,

    /// News API key (the `NEWS_API_KEY` env var takes precedence).
    #[serde(deserialize_with = "deserialize_secret")]
    pub news_api_key: Option<SecretString>,

    /// Custom feed store emptied once at startup, if set.
    pub custom_feed_store: Option<PathBuf>,

    /// Capacity of the notification channel to the index/favicon consumers.
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            sync_interval_minutes: 10,
            sync_concurrency: 1,
            sync_history_retention: 600,
            request_timeout_secs: 30,
            max_feed_size_bytes: 10 * 1024 * 1024,
            allow_private_hosts: false,
            news_api_base_url: "https://newsapi.org/v2/".to_string(),
            news_api_key: None,
            custom_feed_store: None,
            event_channel_capacity: 1024,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("sync_interval_minutes", &self.sync_interval_minutes)
            .field("sync_concurrency", &self.sync_concurrency)
            .field("sync_history_retention", &self.sync_history_retention)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_feed_size_bytes", &self.max_feed_size_bytes)
            .field("allow_private_hosts", &self.allow_private_hosts)
            .field("news_api_base_url", &self.news_api_base_url)
            .field(
                "news_api_key",
                &self.news_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("custom_feed_store", &self.custom_feed_store)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 11] = [
        "database_path",
        "sync_interval_minutes",
        "sync_concurrency",
        "sync_history_retention",
        "request_timeout_secs",
        "max_feed_size_bytes",
        "allow_private_hosts",
        "news_api_base_url",
        "news_api_key",
        "custom_feed_store",
        "event_channel_capacity",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            interval_minutes = config.sync_interval_minutes,
            concurrency = config.sync_concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Delay between synchronization passes (at least one minute).
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.max(1) * 60)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn host_policy(&self) -> HostPolicy {
        if self.allow_private_hosts {
            HostPolicy::AllowPrivate
        } else {
            HostPolicy::PublicOnly
        }
    }

    /// The News API key, preferring the environment over the file.
    pub fn news_api_key(&self) -> Option<SecretString> {
        std::env::var(NEWS_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from)
            .or_else(|| self.news_api_key.clone())
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

// ============================================================================
// Tests
// ============================================================================
