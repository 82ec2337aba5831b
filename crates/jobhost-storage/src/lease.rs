//! Blob lease abstraction used for distributed locks.
//!
//! A [`LeaseStore`] is scoped to one directory inside one container. Blob
//! names passed to it are relative to that directory.

use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of an active lease
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(String);

impl LeaseId {
    /// Generate a fresh lease id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use a caller-proposed lease id
    pub fn from_proposed(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get lease id as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a blob's lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    /// No lease has been taken, or the last one was released
    Available,
    /// A lease is active
    Leased,
    /// The last lease ran out without renewal
    Expired,
}

/// Whether the blob is currently locked by a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Locked,
    Unlocked,
}

/// Properties fetched from a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub lease_state: LeaseState,
    pub lease_status: LeaseStatus,
    pub metadata: HashMap<String, String>,
}

impl BlobProperties {
    /// Check if an active lease is held by anyone
    pub fn is_leased(&self) -> bool {
        self.lease_state == LeaseState::Leased && self.lease_status == LeaseStatus::Locked
    }
}

/// Lease operations against the blobs of one lock directory
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Container holding the lock directory
    fn container(&self) -> &str;

    /// Directory prefix inside the container
    fn directory(&self) -> &str;

    /// Acquire a lease on an existing blob.
    ///
    /// Acquiring with the id of the currently active lease succeeds and
    /// extends it.
    ///
    /// # Errors
    ///
    /// - 404 when the blob or container does not exist
    /// - 409 ([`StorageError::LeaseAlreadyPresent`]) when another lease is active
    async fn acquire_lease(
        &self,
        blob_name: &str,
        lease_period: Duration,
        proposed_lease_id: Option<LeaseId>,
    ) -> Result<LeaseId, StorageError>;

    /// Renew a lease for another full period.
    ///
    /// An expired lease may still be renewed as long as nobody else has
    /// acquired the blob since.
    async fn renew_lease(&self, blob_name: &str, lease_id: &LeaseId) -> Result<(), StorageError>;

    /// Release a lease, making the blob available immediately
    async fn release_lease(&self, blob_name: &str, lease_id: &LeaseId)
        -> Result<(), StorageError>;

    /// Create the container; returns `true` if it was created by this call
    async fn create_container_if_not_exists(&self) -> Result<bool, StorageError>;

    /// Create an empty blob.
    ///
    /// # Errors
    ///
    /// - 404 when the container does not exist
    /// - 409 when the blob already exists
    async fn create_blob(&self, blob_name: &str) -> Result<(), StorageError>;

    /// Replace the blob metadata under an active lease
    async fn set_metadata(
        &self,
        blob_name: &str,
        lease_id: &LeaseId,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Fetch lease state and metadata
    async fn fetch_properties(&self, blob_name: &str) -> Result<BlobProperties, StorageError>;
}
