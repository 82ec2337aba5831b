//! Host status rows written while listeners poll.

use crate::error::JobHostResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// One status observation from a running listener
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRow {
    /// What wrote the row, e.g. `"QueueListener"`
    pub role: String,
    pub queue_name: String,
    /// `None` when the depth could not be read
    pub queue_depth: Option<usize>,
    /// Messages completed by the listener so far
    pub processed_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl LogRow {
    pub fn new(role: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            queue_name: queue_name.into(),
            queue_depth: None,
            processed_count: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_queue_depth(mut self, depth: Option<usize>) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_processed_count(mut self, count: u64) -> Self {
        self.processed_count = count;
        self
    }
}

/// Destination for host status rows.
///
/// Rows are written fire-and-forget; callers log and drop failures.
#[async_trait]
pub trait HostLogSink: Send + Sync {
    async fn add(&self, row: LogRow) -> JobHostResult<()>;
}

/// Sink that emits each row as a tracing event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

#[async_trait]
impl HostLogSink for TracingLogSink {
    async fn add(&self, row: LogRow) -> JobHostResult<()> {
        info!(
            role = %row.role,
            queue = %row.queue_name,
            queue_depth = ?row.queue_depth,
            processed_count = row.processed_count,
            timestamp = %row.timestamp.to_rfc3339(),
            "Host status"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "logging_tests.rs"]
mod tests;
