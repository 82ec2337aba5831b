//! What happens to a queue message before and after its function runs.

use crate::error::JobHostResult;
use crate::executors::FunctionResult;
use crate::queues::config::QueuesConfig;
use crate::queues::watcher::MessageEnqueuedWatcher;
use async_trait::async_trait;
use jobhost_storage::{QueueMessage, StorageError, StorageQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a processor needs to know about the queue it serves
#[derive(Clone)]
pub struct QueueProcessorContext {
    pub queue: Arc<dyn StorageQueue>,
    /// `None` disables poison handling: failed messages are left invisible
    pub poison_queue: Option<Arc<dyn StorageQueue>>,
    pub config: QueuesConfig,
    /// Told when a message is moved to the poison queue
    pub poison_watcher: Option<Arc<dyn MessageEnqueuedWatcher>>,
}

/// Strategy for processing queue messages.
///
/// Custom processors usually wrap [`DefaultQueueProcessor`] and override
/// [`begin_processing`](Self::begin_processing).
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// Messages fetched per poll
    fn batch_size(&self) -> u32;

    /// In-flight count at or below which the next batch is fetched
    fn new_batch_threshold(&self) -> u32;

    /// Attempts before a failing message is poisoned
    fn max_dequeue_count(&self) -> u32;

    /// Ceiling for the polling backoff
    fn max_polling_interval(&self) -> Duration;

    /// Called before the function runs; returning `false` skips the message
    /// and leaves it untouched.
    async fn begin_processing(
        &self,
        _message: &QueueMessage,
        _cancel: &CancellationToken,
    ) -> JobHostResult<bool> {
        Ok(true)
    }

    /// Called after the function ran with its result
    async fn complete_processing(
        &self,
        message: &QueueMessage,
        result: &FunctionResult,
        cancel: &CancellationToken,
    ) -> JobHostResult<()>;
}

/// Creates a processor for each queue listener
pub trait QueueProcessorFactory: Send + Sync {
    fn create(&self, context: QueueProcessorContext) -> Arc<dyn QueueProcessor>;
}

/// Factory producing [`DefaultQueueProcessor`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultQueueProcessorFactory;

impl QueueProcessorFactory for DefaultQueueProcessorFactory {
    fn create(&self, context: QueueProcessorContext) -> Arc<dyn QueueProcessor> {
        Arc::new(DefaultQueueProcessor::new(context))
    }
}

/// Deletes succeeded messages and releases or poisons failed ones
pub struct DefaultQueueProcessor {
    queue: Arc<dyn StorageQueue>,
    poison_queue: Option<Arc<dyn StorageQueue>>,
    poison_watcher: Option<Arc<dyn MessageEnqueuedWatcher>>,
    batch_size: u32,
    new_batch_threshold: u32,
    max_dequeue_count: u32,
    max_polling_interval: Duration,
    visibility_timeout: Duration,
}

impl DefaultQueueProcessor {
    pub fn new(context: QueueProcessorContext) -> Self {
        Self {
            batch_size: context.config.batch_size,
            new_batch_threshold: context.config.effective_new_batch_threshold(),
            max_dequeue_count: context.config.max_dequeue_count,
            max_polling_interval: context.config.max_polling_interval(),
            visibility_timeout: context.config.visibility_timeout(),
            queue: context.queue,
            poison_queue: context.poison_queue,
            poison_watcher: context.poison_watcher,
        }
    }

    /// Visibility delay applied when releasing a failed message
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Delete a message, ignoring it having been taken over or removed
    pub async fn delete_message(&self, message: &QueueMessage) -> JobHostResult<()> {
        match self.queue.delete_message(message).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_benign_race() => {
                debug!(queue = %self.queue.name(), message_id = %message.id, error = %e, "Message already gone; nothing to delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make a failed message visible again after `visibility_timeout`
    pub async fn release_message(
        &self,
        message: &QueueMessage,
        visibility_timeout: Duration,
    ) -> JobHostResult<()> {
        match self
            .queue
            .update_message_visibility(message, visibility_timeout)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign_race() => {
                debug!(queue = %self.queue.name(), message_id = %message.id, error = %e, "Message already gone; nothing to release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Add a copy of the message to the poison queue, creating the queue
    /// if it does not exist yet
    pub async fn copy_message_to_poison_queue(
        &self,
        poison_queue: &Arc<dyn StorageQueue>,
        message: &QueueMessage,
    ) -> JobHostResult<()> {
        warn!(
            queue = %self.queue.name(),
            poison_queue = %poison_queue.name(),
            message_id = %message.id,
            dequeue_count = message.dequeue_count,
            "Message has reached MaxDequeueCount of {}. Moving message to queue '{}'.",
            self.max_dequeue_count,
            poison_queue.name()
        );

        match poison_queue.add_message(message.copy_for_enqueue()).await {
            Ok(_) => {}
            Err(StorageError::QueueNotFound { .. }) => {
                poison_queue.create_if_not_exists().await?;
                poison_queue.add_message(message.copy_for_enqueue()).await?;
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(watcher) = &self.poison_watcher {
            watcher.notify(poison_queue.name());
        }

        Ok(())
    }
}

#[async_trait]
impl QueueProcessor for DefaultQueueProcessor {
    fn batch_size(&self) -> u32 {
        self.batch_size
    }

    fn new_batch_threshold(&self) -> u32 {
        self.new_batch_threshold
    }

    fn max_dequeue_count(&self) -> u32 {
        self.max_dequeue_count
    }

    fn max_polling_interval(&self) -> Duration {
        self.max_polling_interval
    }

    async fn complete_processing(
        &self,
        message: &QueueMessage,
        result: &FunctionResult,
        _cancel: &CancellationToken,
    ) -> JobHostResult<()> {
        if result.succeeded() {
            return self.delete_message(message).await;
        }

        let Some(poison_queue) = &self.poison_queue else {
            // Releasing here would redeliver immediately and spin
            debug!(queue = %self.queue.name(), message_id = %message.id, "No poison queue; leaving failed message invisible");
            return Ok(());
        };

        if message.dequeue_count >= self.max_dequeue_count {
            self.copy_message_to_poison_queue(poison_queue, message)
                .await?;
            self.delete_message(message).await
        } else {
            self.release_message(message, self.visibility_timeout).await
        }
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
