//! Queue configuration
//!
//! This module provides `QueueConfig` for configuring the queue worker.

use crate::error::QueueError;
use core_config::{env_or_default, env_parse_or_default, ConfigError, FromEnv};
use std::time::Duration;

/// Prefix applied to every queue key unless overridden.
pub const DEFAULT_QUEUE_PREFIX: &str = "queue";

/// Configuration for the queue worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Logical queue name (without prefix)
    pub queue_name: String,

    /// Namespace prepended to the queue name to build the transport key
    pub queue_prefix: String,

    /// Delay when there is no work, when at capacity, or after a transport error
    pub poll_interval_ms: u64,

    /// Ceiling on dequeued-but-unresolved items
    pub max_in_flight: usize,

    /// Retries per item before it is dropped
    pub max_retries: u32,

    /// Consecutive failures tolerated before the run aborts
    pub error_threshold: u32,

    /// Items pulled per dequeue call
    pub batch_size: usize,
}

impl QueueConfig {
    /// Create a new QueueConfig with default tunables
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            poll_interval_ms: 100,
            max_in_flight: 100,
            max_retries: 3,
            error_threshold: 10,
            batch_size: 1,
        }
    }

    /// Full transport key, `<prefix>:<queue_name>`
    pub fn queue_key(&self) -> String {
        format!("{}:{}", self.queue_prefix, self.queue_name)
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Set the queue prefix
    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Set the maximum number of in-flight items
    pub fn with_max_in_flight(mut self, count: usize) -> Self {
        self.max_in_flight = count;
        self
    }

    /// Set the maximum retries per item
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the consecutive error threshold
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Reject configurations the worker cannot make progress with.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::Config("queue name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(QueueError::Config("batch size must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(QueueError::Config(
                "max in-flight items must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl FromEnv for QueueConfig {
    /// Environment variables (all optional, defaults as in [`QueueConfig::new`]):
    /// `QUEUE_NAME`, `QUEUE_PREFIX`, `QUEUE_POLL_INTERVAL_MS`, `QUEUE_MAX_IN_FLIGHT`,
    /// `QUEUE_MAX_RETRIES`, `QUEUE_ERROR_THRESHOLD`, `QUEUE_BATCH_SIZE`.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = QueueConfig::new(env_or_default("QUEUE_NAME", "default"));

        let config = Self {
            queue_prefix: env_or_default("QUEUE_PREFIX", &defaults.queue_prefix),
            poll_interval_ms: env_parse_or_default(
                "QUEUE_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            )?,
            max_in_flight: env_parse_or_default("QUEUE_MAX_IN_FLIGHT", defaults.max_in_flight)?,
            max_retries: env_parse_or_default("QUEUE_MAX_RETRIES", defaults.max_retries)?,
            error_threshold: env_parse_or_default(
                "QUEUE_ERROR_THRESHOLD",
                defaults.error_threshold,
            )?,
            batch_size: env_parse_or_default("QUEUE_BATCH_SIZE", defaults.batch_size)?,
            queue_name: defaults.queue_name,
        };

        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(config)
    }
}
