//! Configuration loading and representation.
//!
//! Configuration is a JSON file. Every section and field is optional; missing
//! values take their defaults. A handful of environment variables override
//! file values (see [`AppConfig::apply_env`]); command-line flags are applied
//! last by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::CommandEngine;
use crate::jobs::RetryPolicy;
use crate::workers::WorkerConfig;

pub const ENV_REDIS_URL: &str = "MSAQ_REDIS_URL";
pub const ENV_RESULTS_DIR: &str = "MSAQ_RESULTS_DIR";
pub const ENV_DATABASES_DIR: &str = "MSAQ_DATABASES_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address of the HTTP adapter
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory of `*.params` database descriptors
    pub databases: PathBuf,
    /// Root of per-ticket work directories
    pub results: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            databases: PathBuf::from("databases"),
            results: PathBuf::from("jobs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Search program spawned per job
    pub program: PathBuf,
    /// Arguments placed before the per-job arguments
    pub args_prefix: Vec<String>,
    /// Kill the engine after this many seconds (none = no limit)
    pub timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("msa-search"),
            args_prefix: Vec::new(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
    /// How long one worker claim blocks on the queue
    pub claim_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "msaq".to_string(),
            claim_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Worker threads started by the local run mode
    pub workers: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Claim wait of in-process workers
    pub poll_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { poll_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub engine: EngineConfig,
    pub redis: RedisConfig,
    pub local: LocalConfig,
    pub worker: WorkerSettings,
    pub retry: RetrySettings,
    pub verbose: bool,
}

impl AppConfig {
    /// Read a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a config file, writing the defaults there first if it is missing.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "creating default config file");
            Self::default().write(path)?;
        }
        Self::load(path)
    }

    /// Write this configuration as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, body + "\n").map_err(io_err)
    }

    /// Apply `MSAQ_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup. Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key| lookup(key).filter(|v: &String| !v.trim().is_empty());

        if let Some(url) = get(ENV_REDIS_URL) {
            self.redis.url = url;
        }
        if let Some(dir) = get(ENV_RESULTS_DIR) {
            self.paths.results = PathBuf::from(dir);
        }
        if let Some(dir) = get(ENV_DATABASES_DIR) {
            self.paths.databases = PathBuf::from(dir);
        }
    }

    /// Reject configurations no run mode can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local.workers == 0 {
            return Err(ConfigError::Invalid("local.workers must be at least 1".into()));
        }
        if self.paths.results.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.results is empty".into()));
        }
        if self.paths.databases.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.databases is empty".into()));
        }
        if self.engine.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("engine.program is empty".into()));
        }
        if self.server.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.address {:?} is not a socket address",
                self.server.address
            )));
        }
        Ok(())
    }

    /// Create the results directory if it does not exist yet and make its
    /// path absolute. Work directories are derived from it and handed to
    /// engines that run in a different current directory.
    pub fn ensure_paths(&mut self) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io {
            path: self.paths.results.clone(),
            source,
        };
        fs::create_dir_all(&self.paths.results).map_err(io)?;
        let absolute = fs::canonicalize(&self.paths.results).map_err(io)?;
        self.paths.results = absolute;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn engine_timeout(&self) -> Option<Duration> {
        self.engine
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn command_engine(&self) -> CommandEngine {
        CommandEngine::new(&self.engine.program)
            .with_args_prefix(self.engine.args_prefix.iter().cloned())
            .with_timeout(self.engine_timeout())
    }

    /// Worker settings for in-process workers.
    pub fn local_worker(&self, name: impl Into<String>) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(name)
            .with_poll_interval(Duration::from_millis(self.worker.poll_ms.max(1)))
            .with_store_backoff(self.retry_policy())
    }

    /// Worker settings for workers claiming from Redis.
    pub fn redis_worker(&self, name: impl Into<String>) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(name)
            .with_poll_interval(Duration::from_secs(self.redis.claim_timeout_secs.max(1)))
            .with_store_backoff(self.retry_policy())
    }
}
