//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use queuestore::DEFAULT_PRIORITY;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Max tasks dispatched at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Failed attempts before a task is terminally Failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed backoff before a failed task is re-enqueued
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Bounded wait on an empty queue before re-scanning the store
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Sleep while paused or at the concurrency limit
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// Dispatch up to `batch_size` tasks at once when nothing is running
    #[serde(default)]
    pub batch_mode: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long `stop()` waits for the loop to exit
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Max Pending rows loaded from the store at start or rescan
    #[serde(default = "default_load_limit")]
    pub load_limit: usize,

    /// Priority for tasks added without one
    #[serde(default = "default_priority")]
    pub default_priority: i32,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_idle_interval_ms() -> u64 {
    100
}

fn default_batch_size() -> usize {
    10
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_load_limit() -> usize {
    10_000
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            batch_mode: false,
            batch_size: default_batch_size(),
            stop_timeout_ms: default_stop_timeout_ms(),
            load_limit: default_load_limit(),
            default_priority: default_priority(),
        }
    }
}

impl SchedulerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
