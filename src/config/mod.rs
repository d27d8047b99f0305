mod server;

pub use server::ServerConfig;

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::queue::QueueConfig;
use crate::worker::ConsumerConfig;

/// Top-level configuration, read from an optional TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let w = &self.worker;
        if w.max_concurrent == 0 {
            return Err(Error::Config("worker.max_concurrent must be at least 1".into()));
        }
        if w.rate_limit_per_window == 0 || w.rate_window_secs == 0 {
            return Err(Error::Config(
                "worker.rate_limit_per_window and worker.rate_window_secs must be positive".into(),
            ));
        }
        if w.max_attempts == 0 {
            return Err(Error::Config("worker.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub rate_limit_per_window: usize,
    pub rate_window_secs: u64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            rate_limit_per_window: 10,
            rate_window_secs: 1,
            poll_interval_ms: 500,
            batch_size: 20,
            max_attempts: 5,
            retry_base_ms: 5_000,
            lease_secs: 60,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            max_concurrent: self.max_concurrent,
            rate_limit: self.rate_limit_per_window,
            rate_window: Duration::from_secs(self.rate_window_secs),
        }
    }

    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_attempts: self.max_attempts,
            retry_base: Duration::from_millis(self.retry_base_ms),
            lease: Duration::from_secs(self.lease_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 60 }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}
