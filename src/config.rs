//! Configuration management.
//!
//! Loaded once at bootstrap from an optional file plus `CUMULUS__`-prefixed
//! environment variables. Backend selection is immutable for the process
//! lifetime.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::jobs::{QueueFullPolicy, WorkerConfig, WorkersList};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Job system configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Which broker/scheduler pair the process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process queues and timer loop; single instance, no persistence
    /// of queued jobs across restarts.
    #[default]
    Memory,
    /// Shared Redis lists and sorted set; safe across multiple processes.
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub redis: RedisConfig,

    /// Default execution slots per worker type
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default bounded queue depth per worker type
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// What a full queue does to new submissions
    #[serde(default)]
    pub full_policy: QueueFullPolicy,

    /// Distributed scheduler claim interval (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Per-worker-type overrides, keyed by worker type name
    #[serde(default)]
    pub workers: HashMap<String, WorkerOverrides>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis: RedisConfig::default(),
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            full_policy: QueueFullPolicy::default(),
            tick_interval_ms: default_tick_interval_ms(),
            workers: HashMap::new(),
        }
    }
}

impl JobsConfig {
    /// Worker settings derived from the global defaults.
    pub fn base_worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(self.concurrency)
            .with_queue_capacity(self.queue_capacity)
            .with_full_policy(self.full_policy)
    }

    /// Apply per-type overrides onto a registered catalogue.
    pub fn apply_overrides(&self, workers: &mut WorkersList) {
        for def in workers.iter_mut() {
            if let Some(overrides) = self.workers.get(&def.name) {
                if let Some(concurrency) = overrides.concurrency {
                    def.config.concurrency = concurrency.max(1);
                }
                if let Some(capacity) = overrides.queue_capacity {
                    def.config.queue_capacity = capacity.max(1);
                }
                if let Some(policy) = overrides.full_policy {
                    def.config.full_policy = policy;
                }
                if let Some(timeout) = overrides.timeout {
                    def.config.timeout = Some(timeout);
                }
            }
        }
    }
}

/// Per-worker-type setting overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerOverrides {
    pub concurrency: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub full_policy: Option<QueueFullPolicy>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_concurrency() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_json_logging() -> bool {
    true
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CUMULUS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CUMULUS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
