//! Configuration loading and management.
//!
//! Loads armitage configuration from `./armitage.toml` (or
//! `$ARMITAGE_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::message::Channel;

// ── Top-level config ────────────────────────────────────────────

/// Top-level armitage configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage paths (`[storage]`).
    pub storage: StorageConfig,
    /// Provider bridge connection (`[provider]`).
    pub provider: ProviderConfig,
    /// Webhook ingress (`[webhook]`).
    pub webhook: WebhookConfig,
    /// Dispatch scheduling and retry (`[dispatch]`).
    pub dispatch: DispatchConfig,
    /// Template sync job (`[sync]`).
    pub sync: SyncConfig,
    /// Logging (`[logging]`).
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$ARMITAGE_CONFIG_PATH` or `./armitage.toml`.
    /// If the file does not exist, defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or if the resulting configuration is invalid.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("ARMITAGE_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("armitage.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids `set_var` in
    /// tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Storage.
        if let Some(v) = env("ARMITAGE_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(v));
        }

        // Provider bridge.
        if let Some(v) = env("ARMITAGE_PROVIDER_URL") {
            self.provider.base_url = v;
        }
        if let Some(v) = env("ARMITAGE_PROVIDER_TOKEN") {
            self.provider.token = Some(v);
        }

        // Webhook ingress.
        if let Some(v) = env("ARMITAGE_WEBHOOK_PORT") {
            match v.parse() {
                Ok(n) => self.webhook.port = n,
                Err(_) => tracing::warn!(
                    var = "ARMITAGE_WEBHOOK_PORT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Retry.
        if let Some(v) = env("ARMITAGE_MAX_RETRY_ATTEMPTS") {
            match v.parse() {
                Ok(n) => self.dispatch.max_retry_attempts = n,
                Err(_) => tracing::warn!(
                    var = "ARMITAGE_MAX_RETRY_ATTEMPTS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("ARMITAGE_RETRY_BASE_INTERVAL_SECS") {
            match v.parse() {
                Ok(n) => self.dispatch.retry_base_interval_secs = n,
                Err(_) => tracing::warn!(
                    var = "ARMITAGE_RETRY_BASE_INTERVAL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Logging.
        if let Some(v) = env("ARMITAGE_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Reject configurations the service cannot run with.
    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.provider.base_url)
            .with_context(|| format!("invalid provider base_url: {}", self.provider.base_url))?;
        if self.dispatch.queues.is_empty() {
            anyhow::bail!("at least one dispatch queue must be configured");
        }
        if self.dispatch.concurrency == 0 {
            anyhow::bail!("dispatch concurrency must be at least 1");
        }
        Ok(())
    }

    /// Resolve the runtime data paths, creating nothing.
    ///
    /// The database defaults to `armitage.db` under the platform data
    /// directory (or the working directory as a last resort); logs go to
    /// `logs/` next to it.
    pub fn runtime_paths(&self) -> RuntimePaths {
        let root = directories::ProjectDirs::from("", "", "armitage")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let db_path = self
            .storage
            .db_path
            .clone()
            .unwrap_or_else(|| root.join("armitage.db"));
        let logs_dir = db_path
            .parent()
            .map(|p| p.join("logs"))
            .unwrap_or_else(|| root.join("logs"));
        RuntimePaths {
            root,
            db_path,
            logs_dir,
        }
    }
}

/// Resolved filesystem locations for runtime state.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Data root directory.
    pub root: PathBuf,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Directory for rotated log files.
    pub logs_dir: PathBuf,
}

// ── Sections ────────────────────────────────────────────────────

/// Storage configuration (`[storage]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to the platform data directory.
    pub db_path: Option<PathBuf>,
}

/// Provider bridge configuration (`[provider]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Bridge base URL.
    pub base_url: String,
    /// Optional bearer token.
    pub token: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3100".to_owned(),
            token: None,
        }
    }
}

/// Webhook ingress configuration (`[webhook]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Idempotency-key recency window in seconds.
    pub dedup_window_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8085,
            dedup_window_secs: 86_400,
        }
    }
}

/// Dispatch scheduling and retry configuration (`[dispatch]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Dispatch queues; each runs its own loop. At least one is required.
    #[serde(rename = "queue")]
    pub queues: Vec<QueueConfig>,
    /// Global cap on concurrent provider calls, shared across queues.
    pub concurrency: usize,
    /// Maximum failed send attempts before a message fails permanently.
    pub max_retry_attempts: u32,
    /// Retry backoff base interval in seconds.
    pub retry_base_interval_secs: u64,
    /// How long a dispatch claim hides a message from other ticks.
    pub claim_lease_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueConfig::default()],
            concurrency: 10,
            max_retry_attempts: 3,
            retry_base_interval_secs: 60,
            claim_lease_secs: 120,
        }
    }
}

/// One dispatch queue (`[[dispatch.queue]]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, for logs.
    pub name: String,
    /// Tick interval in seconds.
    pub interval_secs: u64,
    /// Maximum messages claimed per tick.
    pub batch_size: i64,
    /// Restrict this queue to one channel (e.g. a 1 s high-volume chat
    /// queue next to the general queue). `None` serves every channel.
    pub channel: Option<Channel>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "general".to_owned(),
            interval_secs: 30,
            batch_size: 100,
            channel: None,
        }
    }
}

/// Template sync configuration (`[sync]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Enable the polling sync job.
    pub enabled: bool,
    /// Poll interval in seconds.
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

/// Logging configuration (`[logging]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}
