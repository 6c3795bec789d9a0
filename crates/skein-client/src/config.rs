//! Client configuration.
//!
//! Configuration lives in a `.skein/` directory:
//! - `.skein/config.toml` - Configuration file
//! - `.skein/calls/` - Call logs when the file transport is used
//! - `.skein/logs/` - Log files
//!
//! Discovery searches for `.skein/config.toml` starting from the current
//! directory and walking up to parent directories. Environment variables
//! override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// The skein data directory name.
pub const SKEIN_DIR: &str = ".skein";
/// The config file name within the skein directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Default ingestion endpoint.
pub const DEFAULT_BASE_URL: &str = "https://trace.skein.dev";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Project that calls are recorded under.
    pub project: String,
    /// How many call records the client keeps for `get_call` lookups.
    pub call_cache_capacity: usize,
    /// Delivery endpoint settings.
    pub transport: TransportConfig,
    /// Batching settings.
    pub batch: BatchSettings,
    /// Retry settings for failed sends.
    pub retry: RetrySettings,
    /// Logging settings for top-level entry points.
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            call_cache_capacity: 10_000,
            transport: TransportConfig::default(),
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where call records are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// POST batches to the ingestion API.
    Http,
    /// Append batches to a local JSONL call log.
    File,
    /// Accept and discard everything.
    Disabled,
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Base URL of the ingestion API.
    pub base_url: String,
    /// API key sent as a bearer token.
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Call log location for the file transport (relative to `.skein/`).
    pub log_path: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout_secs: 30,
            log_path: PathBuf::from("calls"),
        }
    }
}

/// Batching configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Flush once this many entries are waiting.
    pub max_batch_size: usize,
    /// Flush once the oldest waiting entry is this old.
    pub max_flush_interval_ms: u64,
    /// Entries beyond this bound are dropped and reported.
    pub max_queue_size: usize,
    /// Maximum number of batches being sent at once.
    pub max_concurrent_batches: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_flush_interval_ms: 1_000,
            max_queue_size: 10_000,
            max_concurrent_batches: 2,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetrySettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log at debug level instead of info.
    pub verbose: bool,
    /// Write daily-rotated log files here instead of stderr.
    pub log_dir: Option<PathBuf>,
}

impl ClientConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: ClientConfig = toml::from_str(&content).map_err(|e| {
            ClientError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(config)
    }

    /// Find and load configuration from the current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Returns the config together with the `.skein` directory it came from.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let skein_dir = dir.join(SKEIN_DIR);
            let config_path = skein_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, skein_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Load configuration or use defaults, then apply environment overrides.
    pub fn load_or_default() -> Self {
        let mut config = match Self::find_and_load() {
            Ok(Some((config, path))) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Ok(None) => {
                tracing::debug!("No .skein/config.toml found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    /// Apply `SKEIN_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("SKEIN_API_KEY") {
            self.transport.api_key = Some(key);
        }
        if let Some(url) = lookup("SKEIN_BASE_URL") {
            self.transport.base_url = url;
        }
        if let Some(project) = lookup("SKEIN_PROJECT") {
            self.project = project;
        }
        if let Some(size) = lookup("SKEIN_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.batch.max_batch_size = size;
        }
        if let Some(ms) = lookup("SKEIN_FLUSH_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.batch.max_flush_interval_ms = ms;
        }
    }

    /// Resolve the call log path relative to the `.skein` directory.
    pub fn resolve_log_path(&self, skein_dir: Option<&Path>) -> PathBuf {
        if self.transport.log_path.is_absolute() {
            self.transport.log_path.clone()
        } else if let Some(dir) = skein_dir {
            dir.join(&self.transport.log_path)
        } else {
            PathBuf::from(SKEIN_DIR).join(&self.transport.log_path)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.transport.timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch.max_flush_interval_ms)
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

impl ClientConfig {
    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ConfigValidationError {
                field: field.to_string(),
                message,
            })
        };

        if self.project.trim().is_empty() {
            push("project", "Project cannot be empty.".to_string());
        }

        if self.batch.max_batch_size == 0 {
            push(
                "batch.max_batch_size",
                "Batch size must be at least 1.".to_string(),
            );
        }

        if self.batch.max_queue_size < self.batch.max_batch_size {
            push(
                "batch.max_queue_size",
                format!(
                    "Queue size {} is smaller than batch size {}.",
                    self.batch.max_queue_size, self.batch.max_batch_size
                ),
            );
        }

        if self.batch.max_concurrent_batches == 0 {
            push(
                "batch.max_concurrent_batches",
                "At least one concurrent batch is required.".to_string(),
            );
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            push(
                "retry.initial_backoff_ms",
                "Initial backoff exceeds max backoff.".to_string(),
            );
        }

        if self.transport.mode == TransportMode::Http {
            if !(self.transport.base_url.starts_with("http://")
                || self.transport.base_url.starts_with("https://"))
            {
                push(
                    "transport.base_url",
                    format!(
                        "Invalid base URL '{}'. Expected an http(s) URL.",
                        self.transport.base_url
                    ),
                );
            }
            if self.transport.api_key.is_none() && std::env::var("SKEIN_API_KEY").is_err() {
                push(
                    "transport.api_key",
                    "API key required for http transport. Set [transport] api_key or SKEIN_API_KEY env var."
                        .to_string(),
                );
            }
        }

        errors
    }
}
