//! Keeps a message hidden while its function is still running.

use crate::error::JobHostResult;
use crate::timers::{DelayStrategy, LinearSpeedupStrategy, TaskSeriesCommand, TaskSeriesCommandResult};
use async_trait::async_trait;
use jobhost_storage::{QueueMessage, StorageQueue};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Message shared between the processing task and its visibility timer.
///
/// Each visibility update issues a new pop receipt, so completion must use
/// the latest copy.
pub(crate) type SharedMessage = Arc<Mutex<QueueMessage>>;

pub(crate) fn snapshot(message: &SharedMessage) -> QueueMessage {
    lock(message).clone()
}

fn lock(message: &SharedMessage) -> MutexGuard<'_, QueueMessage> {
    message.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Extends a message's visibility timeout each time it runs
pub(crate) struct UpdateQueueMessageVisibilityCommand {
    queue: Arc<dyn StorageQueue>,
    message: SharedMessage,
    visibility_timeout: Duration,
    strategy: Mutex<LinearSpeedupStrategy>,
}

impl UpdateQueueMessageVisibilityCommand {
    pub(crate) fn new(
        queue: Arc<dyn StorageQueue>,
        message: SharedMessage,
        visibility_timeout: Duration,
        strategy: LinearSpeedupStrategy,
    ) -> Self {
        Self {
            queue,
            message,
            visibility_timeout,
            strategy: Mutex::new(strategy),
        }
    }

    fn next_delay(&self, succeeded: bool) -> Duration {
        self.strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_next_delay(succeeded)
    }
}

#[async_trait]
impl TaskSeriesCommand for UpdateQueueMessageVisibilityCommand {
    async fn execute(&self, _cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult> {
        let current = snapshot(&self.message);

        match self
            .queue
            .update_message_visibility(&current, self.visibility_timeout)
            .await
        {
            Ok(updated) => {
                *lock(&self.message) = updated;
                Ok(TaskSeriesCommandResult::delay(self.next_delay(true)))
            }
            Err(e) if e.is_server_side() => {
                let delay = self.next_delay(false);
                warn!(
                    queue = %self.queue.name(),
                    message_id = %current.id,
                    error = %e,
                    retry_ms = delay.as_millis() as u64,
                    "Failed to extend message visibility; retrying sooner"
                );
                Ok(TaskSeriesCommandResult::delay(delay))
            }
            Err(e) if e.is_benign_race() => {
                debug!(
                    queue = %self.queue.name(),
                    message_id = %current.id,
                    error = %e,
                    "Message no longer ours; stopping visibility updates"
                );
                Ok(TaskSeriesCommandResult::completed())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "visibility_tests.rs"]
mod tests;
