//! Runtime configuration for queues and the storage engine.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::queue::RetryPolicy;

/// Per-queue settings. Every field has a default, so a partial document
/// deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retryable failures tolerated before a record is failed permanently.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Capacity of the broadcast channel behind `JobQueue::subscribe`.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 30,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            event_capacity: 256,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl QueueConfig {
    /// Absent or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("COURIER_MAX_RETRIES", defaults.max_retries),
            base_delay_ms: env_or("COURIER_RETRY_BASE_MS", defaults.base_delay_ms),
            multiplier: env_or("COURIER_RETRY_MULTIPLIER", defaults.multiplier),
            max_delay_ms: env_or("COURIER_RETRY_MAX_MS", defaults.max_delay_ms),
            event_capacity: defaults.event_capacity,
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(QueueError::Config(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(QueueError::Config(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::Config("event_capacity must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Which storage engine backs the record store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEngine {
    /// The legacy in-process key-value engine.
    KeyValue,
    #[default]
    Sqlite,
}

impl FromStr for StorageEngine {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "key_value" | "kv" | "memory" => Ok(StorageEngine::KeyValue),
            "sqlite" => Ok(StorageEngine::Sqlite),
            other => Err(QueueError::Config(format!("unknown storage engine '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub engine: StorageEngine,
    /// Sqlite database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            engine: env_or("COURIER_STORAGE_ENGINE", StorageEngine::default()),
            path: std::env::var_os("COURIER_DB_PATH").map(PathBuf::from),
        }
    }
}
