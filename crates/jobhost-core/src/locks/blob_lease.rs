//! Distributed locks backed by blob leases.
//!
//! Each lock id is a blob in the `locks` directory of the hosts container.
//! Holding the lock means holding the blob's lease. The owner id is written
//! to the blob metadata so other hosts can see who holds a lock.

use crate::error::{JobHostError, JobHostResult};
use crate::locks::{DistributedLockManager, LockHandle};
use async_trait::async_trait;
use jobhost_storage::{
    LeaseId, LeaseStore, StorageAccountProvider, StorageError, DEFAULT_STORAGE_ACCOUNT,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Container holding host coordination blobs
pub const HOSTS_CONTAINER_NAME: &str = "jobhost-hosts";

/// Directory inside the hosts container holding singleton lock blobs
pub const SINGLETON_LOCK_DIRECTORY: &str = "locks";

/// Metadata key recording the current lock owner
pub const FUNCTION_INSTANCE_METADATA_KEY: &str = "FunctionInstance";

/// [`DistributedLockManager`] over blob leases.
///
/// Lock directories are resolved once per account and cached.
pub struct BlobLeaseDistributedLockManager {
    accounts: Arc<dyn StorageAccountProvider>,
    lock_directories: Mutex<HashMap<String, Arc<dyn LeaseStore>>>,
}

impl BlobLeaseDistributedLockManager {
    pub fn new(accounts: Arc<dyn StorageAccountProvider>) -> Self {
        Self {
            accounts,
            lock_directories: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_directory(&self, account: Option<&str>) -> JobHostResult<Arc<dyn LeaseStore>> {
        let account_name = account
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_STORAGE_ACCOUNT);

        if let Some(store) = self
            .lock_directories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account_name)
        {
            return Ok(Arc::clone(store));
        }

        let storage_account = self.accounts.get_account(account_name).await?;
        let store = storage_account.lease_store(HOSTS_CONTAINER_NAME, SINGLETON_LOCK_DIRECTORY);

        let mut directories = self
            .lock_directories
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(
            directories
                .entry(account_name.to_string())
                .or_insert(store),
        ))
    }

    /// Acquire the lease, creating the blob on first use.
    ///
    /// Returns `None` when another holder has the lease.
    async fn try_acquire_lease(
        store: &dyn LeaseStore,
        lock_id: &str,
        lock_period: Duration,
        proposed_lease_id: Option<LeaseId>,
        cancel: &CancellationToken,
    ) -> JobHostResult<Option<LeaseId>> {
        let first_attempt = cancellable(
            cancel,
            store.acquire_lease(lock_id, lock_period, proposed_lease_id.clone()),
        )
        .await?;

        match first_attempt {
            Ok(lease_id) => return Ok(Some(lease_id)),
            Err(e) if e.is_conflict() => return Ok(None),
            Err(e) if e.is_not_found() => {
                debug!(lock_id = %lock_id, "Lock blob not found; creating it");
            }
            Err(e) => return Err(e.into()),
        }

        Self::try_create(store, lock_id, cancel).await?;

        match cancellable(
            cancel,
            store.acquire_lease(lock_id, lock_period, proposed_lease_id),
        )
        .await?
        {
            Ok(lease_id) => Ok(Some(lease_id)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the lock blob (and its container if needed).
    ///
    /// Losing a creation race to another host is not an error.
    async fn try_create(
        store: &dyn LeaseStore,
        lock_id: &str,
        cancel: &CancellationToken,
    ) -> JobHostResult<bool> {
        let mut created_container = false;
        loop {
            match cancellable(cancel, store.create_blob(lock_id)).await? {
                Ok(()) => return Ok(true),
                Err(StorageError::ContainerNotFound { .. }) if !created_container => {
                    cancellable(cancel, store.create_container_if_not_exists()).await??;
                    created_container = true;
                }
                Err(e) if e.is_conflict() || e.is_precondition_failed() => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Race a storage call against cancellation
async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> JobHostResult<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobHostError::Cancelled),
        result = operation => Ok(result),
    }
}

#[async_trait]
impl DistributedLockManager for BlobLeaseDistributedLockManager {
    async fn try_lock(
        &self,
        account: Option<&str>,
        lock_id: &str,
        lock_owner_id: Option<&str>,
        proposed_lease_id: Option<&str>,
        lock_period: Duration,
        cancel: &CancellationToken,
    ) -> JobHostResult<Option<LockHandle>> {
        let store = self.lock_directory(account).await?;
        let proposed = proposed_lease_id.map(LeaseId::from_proposed);

        let lease_id =
            match Self::try_acquire_lease(store.as_ref(), lock_id, lock_period, proposed, cancel)
                .await?
            {
                Some(lease_id) => lease_id,
                None => return Ok(None),
            };

        if let Some(owner) = lock_owner_id {
            let metadata = HashMap::from([(
                FUNCTION_INSTANCE_METADATA_KEY.to_string(),
                owner.to_string(),
            )]);
            cancellable(cancel, store.set_metadata(lock_id, &lease_id, metadata)).await??;
        }

        Ok(Some(LockHandle::new(
            account.map(str::to_string),
            lock_id,
            lease_id,
        )))
    }

    async fn renew(&self, handle: &LockHandle, cancel: &CancellationToken) -> JobHostResult<bool> {
        let store = self.lock_directory(handle.account()).await?;

        match cancellable(cancel, store.renew_lease(handle.lock_id(), handle.lease_id())).await? {
            Ok(()) => Ok(true),
            Err(e) if e.is_lease_lost() => {
                debug!(lock_id = %handle.lock_id(), error = %e, "Lease is no longer held");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, handle: LockHandle, cancel: &CancellationToken) -> JobHostResult<()> {
        let store = self.lock_directory(handle.account()).await?;

        match cancellable(cancel, store.release_lease(handle.lock_id(), handle.lease_id())).await?
        {
            Ok(()) => Ok(()),
            // Already gone, expired, or taken over by another holder.
            Err(e) if e.is_not_found() || e.is_conflict() || e.is_precondition_failed() => {
                debug!(lock_id = %handle.lock_id(), error = %e, "Lease already released");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_lock_owner(
        &self,
        account: Option<&str>,
        lock_id: &str,
        cancel: &CancellationToken,
    ) -> JobHostResult<Option<String>> {
        let store = self.lock_directory(account).await?;

        match cancellable(cancel, store.fetch_properties(lock_id)).await? {
            Ok(properties) if properties.is_leased() => Ok(properties
                .metadata
                .get(FUNCTION_INSTANCE_METADATA_KEY)
                .cloned()),
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "blob_lease_tests.rs"]
mod tests;
