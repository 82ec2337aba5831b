//! In-memory storage account for testing and development.
//!
//! This module provides a fully functional in-memory storage substrate that:
//! - Implements queues with visibility timeouts, dequeue counts and pop receipts
//! - Implements blob leases with expiry, renewal and metadata
//! - Implements paged blob listings with monotonic last-modified times
//! - Supports one-shot fault injection for exercising error paths
//! - Provides thread-safe concurrent access
//!
//! Visibility and lease expiry are measured with [`tokio::time::Instant`], so
//! tests running on a paused runtime clock observe them deterministically.

use crate::account::{StorageAccount, StorageAccountProvider};
use crate::blob::{BlobContainer, BlobItem, BlobListing};
use crate::error::{StorageError, ValidationError};
use crate::lease::{BlobProperties, LeaseId, LeaseState, LeaseStatus, LeaseStore};
use crate::message::{MessageId, PopReceipt, QueueMessage, QueueName, Timestamp};
use crate::queue::{StorageQueue, MAX_BATCH_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Time-to-live given to every message added to an in-memory queue
const MESSAGE_TIME_TO_LIVE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Operations that accept injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    AddMessage,
    GetMessages,
    UpdateVisibility,
    DeleteMessage,
    AcquireLease,
    RenewLease,
    ReleaseLease,
    CreateBlob,
    SetMetadata,
    FetchProperties,
    ListBlobs,
    UploadBlob,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in a queue
#[derive(Clone)]
struct StoredMessage {
    id: MessageId,
    body: Bytes,
    causality_id: Option<Uuid>,
    dequeue_count: u32,
    pop_receipt: Option<PopReceipt>,
    insertion_time: Timestamp,
    expiration_time: Timestamp,
    visible_at: Instant,
    next_visible_time: Timestamp,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }

    fn to_message(&self) -> QueueMessage {
        QueueMessage {
            id: self.id.clone(),
            body: self.body.clone(),
            dequeue_count: self.dequeue_count,
            pop_receipt: self.pop_receipt.clone(),
            insertion_time: Some(self.insertion_time),
            expiration_time: Some(self.expiration_time),
            next_visible_time: Some(self.next_visible_time),
            causality_id: self.causality_id,
        }
    }

    fn hide_for(&mut self, visibility_timeout: Duration) {
        self.pop_receipt = Some(PopReceipt::new());
        self.visible_at = Instant::now() + visibility_timeout;
        self.next_visible_time = Timestamp::now().add(visibility_timeout);
    }
}

/// State of one queue, messages in insertion order
#[derive(Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
}

impl QueueState {
    fn find_for_receipt(
        &mut self,
        queue_name: &QueueName,
        message: &QueueMessage,
    ) -> Result<usize, StorageError> {
        let index = self
            .messages
            .iter()
            .position(|stored| stored.id == message.id)
            .ok_or_else(|| StorageError::MessageNotFound {
                queue_name: queue_name.to_string(),
                message_id: message.id.to_string(),
            })?;

        if message.pop_receipt.is_none() || self.messages[index].pop_receipt != message.pop_receipt
        {
            return Err(StorageError::PopReceiptMismatch {
                message_id: message.id.to_string(),
            });
        }

        Ok(index)
    }
}

/// An active or lapsed lease on a blob
#[derive(Clone)]
struct BlobLease {
    id: LeaseId,
    period: Duration,
    expires_at: Instant,
}

impl BlobLease {
    fn is_active(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A blob with its content, lease and metadata
struct BlobState {
    content: Bytes,
    last_modified: Timestamp,
    lease: Option<BlobLease>,
    metadata: HashMap<String, String>,
}

impl BlobState {
    fn new(content: Bytes, last_modified: Timestamp) -> Self {
        Self {
            content,
            last_modified,
            lease: None,
            metadata: HashMap::new(),
        }
    }

    fn to_item(&self, container: &str, name: &str) -> BlobItem {
        BlobItem {
            container: container.to_string(),
            name: name.to_string(),
            last_modified: self.last_modified,
            content_length: self.content.len() as u64,
        }
    }
}

/// Blobs of one container, keyed by full path (`directory/name`)
#[derive(Default)]
struct ContainerState {
    blobs: HashMap<String, BlobState>,
}

/// Shared state behind every handle of one account
#[derive(Default)]
struct AccountState {
    queues: Mutex<HashMap<QueueName, QueueState>>,
    containers: Mutex<HashMap<String, ContainerState>>,
    faults: Mutex<HashMap<FaultPoint, VecDeque<StorageError>>>,
    last_write: Mutex<Option<Timestamp>>,
}

impl AccountState {
    /// Wall-clock write time, strictly later than every earlier write
    fn next_write_time(&self) -> Timestamp {
        let mut last = lock(&self.last_write);
        let mut now = Timestamp::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous.add(Duration::from_millis(1));
            }
        }
        *last = Some(now);
        now
    }

    fn take_fault(&self, point: FaultPoint) -> Result<(), StorageError> {
        match lock(&self.faults).get_mut(&point).and_then(|f| f.pop_front()) {
            Some(error) => {
                debug!(fault_point = ?point, error = %error, "Injected storage fault");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

// ============================================================================
// InMemoryStorageAccount
// ============================================================================

/// In-memory storage account. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryStorageAccount {
    name: String,
    state: Arc<AccountState>,
}

impl InMemoryStorageAccount {
    /// Create an empty account
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(AccountState::default()),
        }
    }

    /// Queue `error` to be returned by the next call at `point`.
    ///
    /// Faults are consumed in the order they were injected.
    pub fn inject_fault(&self, point: FaultPoint, error: StorageError) {
        lock(&self.state.faults)
            .entry(point)
            .or_default()
            .push_back(error);
    }

    /// Queue the same fault `count` times
    pub fn inject_faults(&self, point: FaultPoint, error: StorageError, count: usize) {
        for _ in 0..count {
            self.inject_fault(point, error.clone());
        }
    }

    /// Concrete queue handle
    pub fn in_memory_queue(&self, name: &QueueName) -> InMemoryQueue {
        InMemoryQueue {
            name: name.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Concrete lease store handle
    pub fn in_memory_lease_store(&self, container: &str, directory: &str) -> InMemoryLeaseStore {
        InMemoryLeaseStore {
            container: container.to_string(),
            directory: directory.trim_end_matches('/').to_string(),
            state: Arc::clone(&self.state),
        }
    }

    /// Snapshot of every message in a queue, visible or not
    pub fn peek_all(&self, name: &QueueName) -> Vec<QueueMessage> {
        lock(&self.state.queues)
            .get(name)
            .map(|q| q.messages.iter().map(StoredMessage::to_message).collect())
            .unwrap_or_default()
    }

    /// Number of currently visible messages in a queue
    pub fn visible_count(&self, name: &QueueName) -> usize {
        let now = Instant::now();
        lock(&self.state.queues)
            .get(name)
            .map(|q| q.messages.iter().filter(|m| m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// Check whether a queue exists
    pub fn queue_exists(&self, name: &QueueName) -> bool {
        lock(&self.state.queues).contains_key(name)
    }

    /// Delete a queue and all of its messages
    pub fn delete_queue(&self, name: &QueueName) -> bool {
        lock(&self.state.queues).remove(name).is_some()
    }

    /// Concrete blob container handle
    pub fn in_memory_container(&self, container: &str) -> InMemoryBlobContainer {
        InMemoryBlobContainer {
            container: container.to_string(),
            state: Arc::clone(&self.state),
        }
    }

    /// Remove a blob, ignoring any lease on it
    pub fn delete_blob(&self, container: &str, blob_path: &str) -> bool {
        lock(&self.state.containers)
            .get_mut(container)
            .and_then(|c| c.blobs.remove(blob_path))
            .is_some()
    }

    /// Drop the lease on a blob without the holder's involvement, as if it
    /// had been broken by an operator.
    pub fn break_lease(&self, container: &str, blob_path: &str) -> bool {
        lock(&self.state.containers)
            .get_mut(container)
            .and_then(|c| c.blobs.get_mut(blob_path))
            .and_then(|b| b.lease.take())
            .is_some()
    }
}

impl StorageAccount for InMemoryStorageAccount {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self, name: &QueueName) -> Arc<dyn StorageQueue> {
        Arc::new(self.in_memory_queue(name))
    }

    fn lease_store(&self, container: &str, directory: &str) -> Arc<dyn LeaseStore> {
        Arc::new(self.in_memory_lease_store(container, directory))
    }

    fn blob_container(&self, container: &str) -> Arc<dyn BlobContainer> {
        Arc::new(self.in_memory_container(container))
    }
}

// ============================================================================
// InMemoryQueue
// ============================================================================

/// Handle to one queue of an [`InMemoryStorageAccount`]
#[derive(Clone)]
pub struct InMemoryQueue {
    name: QueueName,
    state: Arc<AccountState>,
}

impl InMemoryQueue {
    fn not_found(&self) -> StorageError {
        StorageError::QueueNotFound {
            queue_name: self.name.to_string(),
        }
    }
}

#[async_trait]
impl StorageQueue for InMemoryQueue {
    fn name(&self) -> &QueueName {
        &self.name
    }

    async fn exists(&self) -> Result<bool, StorageError> {
        Ok(lock(&self.state.queues).contains_key(&self.name))
    }

    async fn create_if_not_exists(&self) -> Result<bool, StorageError> {
        let mut queues = lock(&self.state.queues);
        if queues.contains_key(&self.name) {
            return Ok(false);
        }

        queues.insert(self.name.clone(), QueueState::default());
        debug!(queue = %self.name, "Created queue");
        Ok(true)
    }

    async fn add_message(&self, message: QueueMessage) -> Result<QueueMessage, StorageError> {
        self.state.take_fault(FaultPoint::AddMessage)?;

        let mut queues = lock(&self.state.queues);
        let queue = queues.get_mut(&self.name).ok_or_else(|| self.not_found())?;

        let now = Timestamp::now();
        let stored = StoredMessage {
            id: MessageId::new(),
            body: message.body,
            causality_id: message.causality_id,
            dequeue_count: 0,
            pop_receipt: None,
            insertion_time: now,
            expiration_time: now.add(MESSAGE_TIME_TO_LIVE),
            visible_at: Instant::now(),
            next_visible_time: now,
        };
        let result = stored.to_message();
        queue.messages.push(stored);

        Ok(result)
    }

    async fn get_messages(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, StorageError> {
        if max_messages == 0 || max_messages > MAX_BATCH_SIZE {
            return Err(ValidationError::OutOfRange {
                field: "max_messages".to_string(),
                message: format!("must be between 1 and {}", MAX_BATCH_SIZE),
            }
            .into());
        }

        self.state.take_fault(FaultPoint::GetMessages)?;

        let mut queues = lock(&self.state.queues);
        let queue = queues.get_mut(&self.name).ok_or_else(|| self.not_found())?;

        let now = Instant::now();
        let batch = queue
            .messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(max_messages as usize)
            .map(|stored| {
                stored.dequeue_count += 1;
                stored.hide_for(visibility_timeout);
                stored.to_message()
            })
            .collect();

        Ok(batch)
    }

    async fn update_message_visibility(
        &self,
        message: &QueueMessage,
        visibility_timeout: Duration,
    ) -> Result<QueueMessage, StorageError> {
        self.state.take_fault(FaultPoint::UpdateVisibility)?;

        let mut queues = lock(&self.state.queues);
        let queue = queues.get_mut(&self.name).ok_or_else(|| self.not_found())?;
        let index = queue.find_for_receipt(&self.name, message)?;

        let stored = &mut queue.messages[index];
        stored.hide_for(visibility_timeout);
        Ok(stored.to_message())
    }

    async fn delete_message(&self, message: &QueueMessage) -> Result<(), StorageError> {
        self.state.take_fault(FaultPoint::DeleteMessage)?;

        let mut queues = lock(&self.state.queues);
        let queue = queues.get_mut(&self.name).ok_or_else(|| self.not_found())?;
        let index = queue.find_for_receipt(&self.name, message)?;

        queue.messages.remove(index);
        Ok(())
    }

    async fn approximate_message_count(&self) -> Result<usize, StorageError> {
        lock(&self.state.queues)
            .get(&self.name)
            .map(|q| q.messages.len())
            .ok_or_else(|| self.not_found())
    }
}

// ============================================================================
// InMemoryLeaseStore
// ============================================================================

/// Handle to one lock directory of an [`InMemoryStorageAccount`]
#[derive(Clone)]
pub struct InMemoryLeaseStore {
    container: String,
    directory: String,
    state: Arc<AccountState>,
}

impl InMemoryLeaseStore {
    fn blob_path(&self, blob_name: &str) -> String {
        if self.directory.is_empty() {
            blob_name.to_string()
        } else {
            format!("{}/{}", self.directory, blob_name)
        }
    }

    /// Run `f` against an existing blob, mapping missing container or blob
    /// to 404 errors.
    fn with_blob<R>(
        &self,
        blob_name: &str,
        f: impl FnOnce(&mut BlobState, String) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let path = self.blob_path(blob_name);
        let mut containers = lock(&self.state.containers);
        let container = containers.get_mut(&self.container).ok_or_else(|| {
            StorageError::ContainerNotFound {
                container: self.container.clone(),
            }
        })?;
        let blob = container
            .blobs
            .get_mut(&path)
            .ok_or_else(|| StorageError::BlobNotFound {
                blob_name: path.clone(),
            })?;

        f(blob, path)
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    fn container(&self) -> &str {
        &self.container
    }

    fn directory(&self) -> &str {
        &self.directory
    }

    async fn acquire_lease(
        &self,
        blob_name: &str,
        lease_period: Duration,
        proposed_lease_id: Option<LeaseId>,
    ) -> Result<LeaseId, StorageError> {
        self.state.take_fault(FaultPoint::AcquireLease)?;

        self.with_blob(blob_name, |blob, path| {
            let now = Instant::now();
            let proposed = proposed_lease_id.unwrap_or_default();

            if let Some(lease) = blob.lease.as_ref().filter(|l| l.is_active(now)) {
                if lease.id != proposed {
                    return Err(StorageError::LeaseAlreadyPresent { blob_name: path });
                }
            }

            blob.lease = Some(BlobLease {
                id: proposed.clone(),
                period: lease_period,
                expires_at: now + lease_period,
            });
            debug!(blob = %path, lease_id = %proposed, "Lease acquired");
            Ok(proposed)
        })
    }

    async fn renew_lease(&self, blob_name: &str, lease_id: &LeaseId) -> Result<(), StorageError> {
        self.state.take_fault(FaultPoint::RenewLease)?;

        self.with_blob(blob_name, |blob, path| match blob.lease.as_mut() {
            Some(lease) if lease.id == *lease_id => {
                lease.expires_at = Instant::now() + lease.period;
                Ok(())
            }
            Some(_) => Err(StorageError::LeaseIdMismatch { blob_name: path }),
            None => Err(StorageError::LeaseNotPresent { blob_name: path }),
        })
    }

    async fn release_lease(
        &self,
        blob_name: &str,
        lease_id: &LeaseId,
    ) -> Result<(), StorageError> {
        self.state.take_fault(FaultPoint::ReleaseLease)?;

        self.with_blob(blob_name, |blob, path| match blob.lease.as_ref() {
            Some(lease) if lease.id == *lease_id => {
                blob.lease = None;
                debug!(blob = %path, lease_id = %lease_id, "Lease released");
                Ok(())
            }
            Some(_) => Err(StorageError::LeaseIdMismatch { blob_name: path }),
            None => Err(StorageError::LeaseNotPresent { blob_name: path }),
        })
    }

    async fn create_container_if_not_exists(&self) -> Result<bool, StorageError> {
        let mut containers = lock(&self.state.containers);
        if containers.contains_key(&self.container) {
            return Ok(false);
        }

        containers.insert(self.container.clone(), ContainerState::default());
        Ok(true)
    }

    async fn create_blob(&self, blob_name: &str) -> Result<(), StorageError> {
        self.state.take_fault(FaultPoint::CreateBlob)?;

        let path = self.blob_path(blob_name);
        let mut containers = lock(&self.state.containers);
        let container = containers.get_mut(&self.container).ok_or_else(|| {
            StorageError::ContainerNotFound {
                container: self.container.clone(),
            }
        })?;

        if container.blobs.contains_key(&path) {
            return Err(StorageError::BlobAlreadyExists { blob_name: path });
        }

        let written = self.state.next_write_time();
        container
            .blobs
            .insert(path, BlobState::new(Bytes::new(), written));
        Ok(())
    }

    async fn set_metadata(
        &self,
        blob_name: &str,
        lease_id: &LeaseId,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.state.take_fault(FaultPoint::SetMetadata)?;

        self.with_blob(blob_name, |blob, path| {
            let now = Instant::now();
            match blob.lease.as_ref().filter(|l| l.is_active(now)) {
                Some(lease) if lease.id == *lease_id => {
                    blob.metadata = metadata;
                    Ok(())
                }
                Some(_) => Err(StorageError::LeaseIdMismatch { blob_name: path }),
                None => Err(StorageError::LeaseNotPresent { blob_name: path }),
            }
        })
    }

    async fn fetch_properties(&self, blob_name: &str) -> Result<BlobProperties, StorageError> {
        self.state.take_fault(FaultPoint::FetchProperties)?;

        self.with_blob(blob_name, |blob, _| {
            let now = Instant::now();
            let (lease_state, lease_status) = match blob.lease.as_ref() {
                Some(lease) if lease.is_active(now) => (LeaseState::Leased, LeaseStatus::Locked),
                Some(_) => (LeaseState::Expired, LeaseStatus::Unlocked),
                None => (LeaseState::Available, LeaseStatus::Unlocked),
            };

            Ok(BlobProperties {
                lease_state,
                lease_status,
                metadata: blob.metadata.clone(),
            })
        })
    }
}

// ============================================================================
// InMemoryBlobContainer
// ============================================================================

/// Handle to one blob container of an [`InMemoryStorageAccount`]
#[derive(Clone)]
pub struct InMemoryBlobContainer {
    container: String,
    state: Arc<AccountState>,
}

impl InMemoryBlobContainer {
    fn not_found(&self) -> StorageError {
        StorageError::ContainerNotFound {
            container: self.container.clone(),
        }
    }
}

#[async_trait]
impl BlobContainer for InMemoryBlobContainer {
    fn name(&self) -> &str {
        &self.container
    }

    async fn create_if_not_exists(&self) -> Result<bool, StorageError> {
        let mut containers = lock(&self.state.containers);
        if containers.contains_key(&self.container) {
            return Ok(false);
        }

        containers.insert(self.container.clone(), ContainerState::default());
        debug!(container = %self.container, "Created container");
        Ok(true)
    }

    async fn list_blobs(
        &self,
        max_results: u32,
        continuation: Option<&str>,
    ) -> Result<BlobListing, StorageError> {
        if max_results == 0 {
            return Err(ValidationError::OutOfRange {
                field: "max_results".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }

        self.state.take_fault(FaultPoint::ListBlobs)?;

        let containers = lock(&self.state.containers);
        let container = containers
            .get(&self.container)
            .ok_or_else(|| self.not_found())?;

        let mut names: Vec<&String> = container
            .blobs
            .keys()
            .filter(|name| continuation.map_or(true, |after| name.as_str() > after))
            .collect();
        names.sort();

        let page = max_results as usize;
        let items: Vec<BlobItem> = names
            .iter()
            .take(page)
            .map(|name| container.blobs[*name].to_item(&self.container, name))
            .collect();
        let continuation = if names.len() > page {
            items.last().map(|item| item.name.clone())
        } else {
            None
        };

        Ok(BlobListing {
            items,
            continuation,
        })
    }

    async fn upload_blob(&self, name: &str, content: Bytes) -> Result<BlobItem, StorageError> {
        self.state.take_fault(FaultPoint::UploadBlob)?;

        let mut containers = lock(&self.state.containers);
        let container = containers
            .get_mut(&self.container)
            .ok_or_else(|| self.not_found())?;

        let now = Instant::now();
        let written = self.state.next_write_time();
        let blob = container
            .blobs
            .entry(name.to_string())
            .or_insert_with(|| BlobState::new(Bytes::new(), written));
        if blob.lease.as_ref().is_some_and(|l| l.is_active(now)) {
            return Err(StorageError::LeaseIdMissing {
                blob_name: name.to_string(),
            });
        }
        blob.content = content;
        blob.last_modified = written;

        debug!(container = %self.container, blob = %name, "Uploaded blob");
        Ok(blob.to_item(&self.container, name))
    }

    async fn download_blob(&self, name: &str) -> Result<Bytes, StorageError> {
        lock(&self.state.containers)
            .get(&self.container)
            .ok_or_else(|| self.not_found())?
            .blobs
            .get(name)
            .map(|blob| blob.content.clone())
            .ok_or_else(|| StorageError::BlobNotFound {
                blob_name: format!("{}/{}", self.container, name),
            })
    }
}

// ============================================================================
// InMemoryAccountProvider
// ============================================================================

/// Account provider over a fixed set of in-memory accounts
#[derive(Clone, Default)]
pub struct InMemoryAccountProvider {
    accounts: HashMap<String, InMemoryStorageAccount>,
}

impl InMemoryAccountProvider {
    /// Create a provider with no accounts
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account under its own name
    pub fn with_account(mut self, account: InMemoryStorageAccount) -> Self {
        self.accounts.insert(account.name.clone(), account);
        self
    }

    /// Look up a registered account
    pub fn account(&self, name: &str) -> Option<&InMemoryStorageAccount> {
        self.accounts.get(name)
    }
}

#[async_trait]
impl StorageAccountProvider for InMemoryAccountProvider {
    async fn get_account(&self, name: &str) -> Result<Arc<dyn StorageAccount>, StorageError> {
        self.accounts
            .get(name)
            .map(|account| Arc::new(account.clone()) as Arc<dyn StorageAccount>)
            .ok_or_else(|| StorageError::AccountNotFound {
                account_name: name.to_string(),
            })
    }
}
