//! Configuration for the ingestion manager.
//!
//! Loaded from TOML (or JSON, chosen by file extension) with defaults for every
//! section. Lookup order: an explicit `--config` path, the `INGEST_CONFIG`
//! environment variable, `config/settings.toml`, then compiled-in defaults.
//! Command-line flags override whatever the file says.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scheduler::ExecutionMode;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "INGEST_CONFIG";
/// Relative path tried when nothing else is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/settings.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    /// JSON schedule file.
    pub schedule_file: PathBuf,
    pub runner: RunnerConfig,
    pub secrets: SecretsConfig,
    pub clients: ClientsConfig,
    pub logging: LoggingConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            schedule_file: PathBuf::from("config/schedules.json"),
            runner: RunnerConfig::default(),
            secrets: SecretsConfig::default(),
            clients: ClientsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from `path`. Files ending in `.json` are parsed as
    /// JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        };
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicitly requested file must load;
    /// the fallbacks only warn and move on.
    ///
    /// This runs before logging is configured, so fallback problems are
    /// returned as messages for the caller to log once tracing is up.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Vec<String>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Vec::new()));
        }
        Ok(Self::load_or_default())
    }

    /// Try, in order:
    /// 1. The path in the `INGEST_CONFIG` environment variable.
    /// 2. `config/settings.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> (Self, Vec<String>) {
        let env_path = std::env::var(CONFIG_ENV).ok();
        Self::load_with_fallbacks(env_path.as_deref().map(Path::new), Path::new(DEFAULT_CONFIG_PATH))
    }

    fn load_with_fallbacks(env_path: Option<&Path>, local: &Path) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();

        // 1. Environment variable override.
        if let Some(path) = env_path {
            match Self::load(path) {
                Ok(cfg) => return (cfg, warnings),
                Err(e) => warnings.push(format!(
                    "{CONFIG_ENV} set but {} could not be loaded, trying fallback: {e:#}",
                    path.display()
                )),
            }
        }

        // 2. Working-directory default.
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return (cfg, warnings),
                Err(e) => warnings.push(format!(
                    "config file {} exists but could not be loaded, using defaults: {e:#}",
                    local.display()
                )),
            }
        }

        // 3. Defaults.
        debug!("no config file found, using compiled-in defaults");
        (Self::default(), warnings)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.runner.async_mode {
            ExecutionMode::Concurrent {
                workers: self.runner.max_workers.max(1),
            }
        } else {
            ExecutionMode::Serial
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding the history ledger and SCD2 tables.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/ingest.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Seconds between poll cycles.
    pub poll_interval_secs: u64,
    /// Upper bound on concurrently running jobs in async mode.
    pub max_workers: usize,
    /// Run independent jobs concurrently.
    pub async_mode: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_workers: 4,
            async_mode: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Optional JSON object file of named API keys.
    pub path: Option<PathBuf>,
    /// Environment variable prefix consulted before the file.
    pub env_prefix: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            path: None,
            env_prefix: "INGEST_KEY_".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    pub source: SourceConfig,
}

/// Which upstream the built-in jobs read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Randomly generated transactions.
    #[default]
    Mock,
    /// JSON-over-HTTP endpoint. `api_key` names a secret sent as a bearer
    /// token.
    Http {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
