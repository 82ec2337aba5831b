//! Queue abstraction with visibility-timeout semantics.

use crate::error::StorageError;
use crate::message::{QueueMessage, QueueName};
use async_trait::async_trait;
use std::time::Duration;

/// Largest batch a single fetch may request
pub const MAX_BATCH_SIZE: u32 = 32;

/// A single storage queue.
///
/// Fetching a message hides it for the requested visibility timeout and
/// issues a pop receipt. Updating, releasing and deleting require the
/// current receipt; stale receipts fail with
/// [`StorageError::PopReceiptMismatch`].
#[async_trait]
pub trait StorageQueue: Send + Sync {
    /// Name of this queue
    fn name(&self) -> &QueueName;

    /// Check whether the queue exists
    async fn exists(&self) -> Result<bool, StorageError>;

    /// Create the queue; returns `true` if it was created by this call
    async fn create_if_not_exists(&self) -> Result<bool, StorageError>;

    /// Add a message, making it visible immediately.
    ///
    /// # Returns
    ///
    /// The stored message with its assigned id and insertion time.
    async fn add_message(&self, message: QueueMessage) -> Result<QueueMessage, StorageError>;

    /// Fetch up to `max_messages` visible messages, hiding each for
    /// `visibility_timeout` and incrementing its dequeue count.
    ///
    /// # Errors
    ///
    /// [`StorageError::QueueNotFound`] when the queue does not exist and
    /// [`StorageError::Validation`] when `max_messages` is outside `1..=32`.
    async fn get_messages(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, StorageError>;

    /// Set the message to become visible `visibility_timeout` from now.
    ///
    /// A zero timeout releases the message immediately.
    ///
    /// # Returns
    ///
    /// The message with its new pop receipt and next-visible time.
    async fn update_message_visibility(
        &self,
        message: &QueueMessage,
        visibility_timeout: Duration,
    ) -> Result<QueueMessage, StorageError>;

    /// Delete a message using its current pop receipt
    async fn delete_message(&self, message: &QueueMessage) -> Result<(), StorageError>;

    /// Approximate number of messages in the queue, visible or not
    async fn approximate_message_count(&self) -> Result<usize, StorageError>;
}
