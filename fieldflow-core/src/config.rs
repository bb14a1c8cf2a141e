use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::outbox::RetryPolicy;

/// How `run_once` gets called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// An outside scheduler calls `run_once`.
    #[default]
    External,
    /// A built-in loop calls `run_once` every `interval_ms`.
    InternalPolling { interval_ms: u64 },
}

/// Runtime configuration for the propagation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Renewed while a task runs, so it only bounds how long a crashed
    /// worker's task stays unclaimable.
    pub lease_duration_ms: u64,
    pub claim_batch_size: usize,
    /// Must stay below `lease_duration_ms`.
    pub task_timeout_ms: u64,
    pub write_chunk_size: usize,
    pub dispatch: DispatchMode,
    pub emit_changes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            lease_duration_ms: 180_000,
            claim_batch_size: 16,
            task_timeout_ms: 120_000,
            write_chunk_size: 500,
            dispatch: DispatchMode::External,
            emit_changes: true,
        }
    }
}

impl EngineConfig {
    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError("max_attempts must be at least 1".into()));
        }
        if self.write_chunk_size == 0 {
            return Err(ConfigError("write_chunk_size must be at least 1".into()));
        }
        if self.claim_batch_size == 0 {
            return Err(ConfigError("claim_batch_size must be at least 1".into()));
        }
        if self.lease_duration_ms < 1_000 {
            return Err(ConfigError(format!(
                "lease_duration_ms {} is under one second",
                self.lease_duration_ms
            )));
        }
        if self.task_timeout_ms >= self.lease_duration_ms {
            return Err(ConfigError(format!(
                "task_timeout_ms {} must be below lease_duration_ms {}",
                self.task_timeout_ms, self.lease_duration_ms
            )));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError(format!(
                "backoff_base_ms {} exceeds backoff_max_ms {}",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if let DispatchMode::InternalPolling { interval_ms: 0 } = self.dispatch {
            return Err(ConfigError("polling interval must be non-zero".into()));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}
