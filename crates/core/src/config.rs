use serde::Deserialize;
use std::path::Path;

use crate::error::{NurtureError, NurtureResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `NURTURE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Scheduler and executor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// How often the worker polls the store for due assignments.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on assignments fetched per poll.
    #[serde(default = "default_due_batch_size")]
    pub due_batch_size: usize,
    /// Transient failures tolerated on one step before the assignment is aborted.
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Trailing window used by the `no_response` step condition.
    #[serde(default = "default_no_response_window_days")]
    pub no_response_window_days: i64,
    /// Interval of the periodic `no_response_days` trigger sweep. Zero disables it.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Store-level lease held while one worker mutates an assignment.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "nurture-01".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_due_batch_size() -> usize {
    500
}
fn default_max_step_attempts() -> u32 {
    5
}
fn default_retry_backoff_base_ms() -> u64 {
    30_000
}
fn default_retry_backoff_max_ms() -> u64 {
    3_600_000
}
fn default_no_response_window_days() -> i64 {
    7
}
fn default_sweep_interval_secs() -> u64 {
    3600
}
fn default_lease_ttl_ms() -> u64 {
    30_000
}
fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_key_prefix() -> String {
    "nurture".to_string()
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            due_batch_size: default_due_batch_size(),
            max_step_attempts: default_max_step_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            no_response_window_days: default_no_response_window_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
            lease_ttl_ms: default_lease_ttl_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            redis: RedisConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, overridden by
    /// `NURTURE__`-prefixed environment variables.
    pub fn load_from(path: Option<&Path>) -> NurtureResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("NURTURE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()
            .map_err(|e| NurtureError::Config(e.to_string()))?;
        config
            .try_deserialize()
            .map_err(|e| NurtureError::Config(e.to_string()))
    }
}
