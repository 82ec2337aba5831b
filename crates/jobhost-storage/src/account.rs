//! Storage accounts and account resolution.

use crate::blob::BlobContainer;
use crate::error::StorageError;
use crate::lease::LeaseStore;
use crate::message::QueueName;
use crate::queue::StorageQueue;
use async_trait::async_trait;
use std::sync::Arc;

/// Name used when no account is specified
pub const DEFAULT_STORAGE_ACCOUNT: &str = "Storage";

/// A storage account exposing queues, blob containers and blob lease
/// directories
pub trait StorageAccount: Send + Sync {
    /// Account name
    fn name(&self) -> &str;

    /// Handle to a queue in this account. The queue need not exist yet.
    fn queue(&self, name: &QueueName) -> Arc<dyn StorageQueue>;

    /// Lease store for a directory inside a container
    fn lease_store(&self, container: &str, directory: &str) -> Arc<dyn LeaseStore>;

    /// Handle to a blob container. The container need not exist yet.
    fn blob_container(&self, container: &str) -> Arc<dyn BlobContainer>;
}

/// Resolves storage accounts by name
#[async_trait]
pub trait StorageAccountProvider: Send + Sync {
    /// Look up an account.
    ///
    /// # Errors
    ///
    /// [`StorageError::AccountNotFound`] when no account has that name.
    async fn get_account(&self, name: &str) -> Result<Arc<dyn StorageAccount>, StorageError>;
}
