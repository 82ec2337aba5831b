//! Queue listener configuration.

use crate::error::ConfigurationError;
use crate::queues::processor::QueueProcessorFactory;
use jobhost_storage::MAX_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Shortest polling backoff, and the floor for the configured maximum
pub const MINIMUM_POLLING_INTERVAL: Duration = Duration::from_millis(100);

/// Default ceiling for the polling backoff
pub const DEFAULT_MAX_POLLING_INTERVAL: Duration = Duration::from_secs(60);

/// Settings shared by every queue listener on a host.
///
/// Durations are stored as integer milliseconds so the struct maps
/// directly onto configuration files.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Messages fetched per poll
    pub batch_size: u32,

    /// In-flight count at or below which the next batch is fetched;
    /// `None` means half the batch size
    pub new_batch_threshold: Option<u32>,

    /// Attempts before a failing message is moved to the poison queue
    pub max_dequeue_count: u32,

    /// Ceiling for the polling backoff
    pub max_polling_interval_ms: u64,

    /// Visibility delay applied when releasing a failed message
    pub visibility_timeout_ms: u64,

    /// Creates the processor deciding what happens to each message
    #[serde(skip)]
    pub processor_factory: Option<Arc<dyn QueueProcessorFactory>>,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            new_batch_threshold: None,
            max_dequeue_count: 5,
            max_polling_interval_ms: DEFAULT_MAX_POLLING_INTERVAL.as_millis() as u64,
            visibility_timeout_ms: 0,
            processor_factory: None,
        }
    }
}

impl std::fmt::Debug for QueuesConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuesConfig")
            .field("batch_size", &self.batch_size)
            .field("new_batch_threshold", &self.new_batch_threshold)
            .field("max_dequeue_count", &self.max_dequeue_count)
            .field("max_polling_interval_ms", &self.max_polling_interval_ms)
            .field("visibility_timeout_ms", &self.visibility_timeout_ms)
            .field("custom_processor", &self.processor_factory.is_some())
            .finish()
    }
}

impl QueuesConfig {
    /// Check every value is in range.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::OutOfRange`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigurationError::out_of_range(
                "batch_size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            ));
        }

        if self.max_dequeue_count == 0 {
            return Err(ConfigurationError::out_of_range(
                "max_dequeue_count",
                "must be greater than zero",
            ));
        }

        if self.max_polling_interval() < MINIMUM_POLLING_INTERVAL {
            return Err(ConfigurationError::out_of_range(
                "max_polling_interval_ms",
                format!("must be at least {}", MINIMUM_POLLING_INTERVAL.as_millis()),
            ));
        }

        Ok(())
    }

    /// Threshold after defaulting
    pub fn effective_new_batch_threshold(&self) -> u32 {
        self.new_batch_threshold.unwrap_or(self.batch_size / 2)
    }

    pub fn max_polling_interval(&self) -> Duration {
        Duration::from_millis(self.max_polling_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Use a custom processor factory
    pub fn with_processor_factory(mut self, factory: Arc<dyn QueueProcessorFactory>) -> Self {
        self.processor_factory = Some(factory);
        self
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
