//! Engine configuration from YAML

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the dispatcher and its workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker tasks polling the queue
    pub worker_count: usize,

    /// How long an idle worker sleeps before polling again, in milliseconds
    pub poll_interval_ms: u64,

    /// Soft wall-clock budget per handler invocation, in seconds
    pub handler_timeout_secs: u64,

    /// Message re-queue policy
    pub retry: RetryConfig,
}

/// Message-level retry tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay for handler re-queues, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any computed re-queue delay, in milliseconds
    pub max_delay_ms: u64,

    /// Attempts beyond this convert the message into an invalid marker
    pub attempts_ceiling: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 50,
            handler_timeout_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 30_000,
            max_delay_ms: 300_000,
            attempts_ceiling: 1000,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse engine config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}
