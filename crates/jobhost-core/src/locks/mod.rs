//! Distributed locks and host identity.
//!
//! A distributed lock is a named, time-limited, exclusive lease. At most
//! one holder can have a valid lease for a lock id at any time; holders
//! must renew before the lease period elapses or lose the lock.

mod blob_lease;

pub use blob_lease::{
    BlobLeaseDistributedLockManager, FUNCTION_INSTANCE_METADATA_KEY, HOSTS_CONTAINER_NAME,
    SINGLETON_LOCK_DIRECTORY,
};

use crate::error::{ConfigurationError, JobHostResult};
use async_trait::async_trait;
use jobhost_storage::LeaseId;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Longest host id accepted by [`FixedHostIdProvider`]
pub const MAX_HOST_ID_LENGTH: usize = 32;

// ============================================================================
// Lock handles
// ============================================================================

/// Proof of holding a distributed lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    account: Option<String>,
    lock_id: String,
    lease_id: LeaseId,
}

impl LockHandle {
    pub fn new(account: Option<String>, lock_id: impl Into<String>, lease_id: LeaseId) -> Self {
        Self {
            account,
            lock_id: lock_id.into(),
            lease_id,
        }
    }

    /// Storage account the lock lives in; `None` for the default account
    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn lease_id(&self) -> &LeaseId {
        &self.lease_id
    }
}

/// Acquires, renews and releases named leases
#[async_trait]
pub trait DistributedLockManager: Send + Sync {
    /// Try once to acquire a lock.
    ///
    /// # Arguments
    ///
    /// * `account` - Storage account, `None` for the default
    /// * `lock_id` - Name of the lock
    /// * `lock_owner_id` - Recorded with the lease so other hosts can see who holds it
    /// * `proposed_lease_id` - Lease id to request instead of a generated one
    /// * `lock_period` - Lease duration
    ///
    /// # Returns
    ///
    /// `Some(handle)` when acquired, `None` when another holder has it.
    async fn try_lock(
        &self,
        account: Option<&str>,
        lock_id: &str,
        lock_owner_id: Option<&str>,
        proposed_lease_id: Option<&str>,
        lock_period: Duration,
        cancel: &CancellationToken,
    ) -> JobHostResult<Option<LockHandle>>;

    /// Renew a held lock.
    ///
    /// # Returns
    ///
    /// `false` when the lease is no longer ours: it was taken over after
    /// expiring, broken, or deleted.
    ///
    /// # Errors
    ///
    /// Storage failures that say nothing about ownership, such as server
    /// errors, are returned so the caller can retry sooner.
    async fn renew(&self, handle: &LockHandle, cancel: &CancellationToken) -> JobHostResult<bool>;

    /// Release a held lock. Tolerates the lock being already gone or held by
    /// someone else.
    async fn release(&self, handle: LockHandle, cancel: &CancellationToken) -> JobHostResult<()>;

    /// Owner recorded on the lock, or `None` when no lease is active
    async fn get_lock_owner(
        &self,
        account: Option<&str>,
        lock_id: &str,
        cancel: &CancellationToken,
    ) -> JobHostResult<Option<String>>;
}

// ============================================================================
// Host identity
// ============================================================================

/// Supplies the id shared by every instance of one logical host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostIdProvider: Send + Sync {
    async fn get_host_id(&self) -> JobHostResult<String>;
}

/// Host id fixed at construction
#[derive(Debug, Clone)]
pub struct FixedHostIdProvider {
    host_id: String,
}

impl FixedHostIdProvider {
    /// Use a configured host id.
    ///
    /// # Errors
    ///
    /// Host ids must be 1-32 characters of lowercase letters, digits and
    /// dashes, and must not start or end with a dash.
    pub fn new(host_id: impl Into<String>) -> Result<Self, ConfigurationError> {
        let host_id = host_id.into();
        if !is_valid_host_id(&host_id) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "Invalid host id '{}'. Host ids must be 1-{} characters of lowercase letters, digits and dashes, and must not start or end with a dash.",
                    host_id, MAX_HOST_ID_LENGTH
                ),
            });
        }

        Ok(Self { host_id })
    }

    /// Generate a random host id
    pub fn generated() -> Self {
        Self {
            host_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }
}

fn is_valid_host_id(host_id: &str) -> bool {
    !host_id.is_empty()
        && host_id.len() <= MAX_HOST_ID_LENGTH
        && host_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !host_id.starts_with('-')
        && !host_id.ends_with('-')
}

#[async_trait]
impl HostIdProvider for FixedHostIdProvider {
    async fn get_host_id(&self) -> JobHostResult<String> {
        Ok(self.host_id.clone())
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
