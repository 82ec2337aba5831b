//! # Jobhost Storage
//!
//! Storage substrate for the jobhost runtime: queues with visibility
//! timeouts and pop receipts, and blobs with exclusive leases.
//!
//! The runtime never talks to a storage service directly. Everything goes
//! through the narrow traits defined here:
//! - [`StorageQueue`] - fetch, hide, release and delete queue messages
//! - [`LeaseStore`] - acquire, renew and release blob leases inside one lock directory
//! - [`BlobContainer`] - list, write and read the blobs of one container
//! - [`StorageAccount`] / [`StorageAccountProvider`] - resolve named accounts
//!
//! ## Module Organization
//!
//! - [`error`] - Error types and their classification
//! - [`message`] - Queue names, message identifiers and the message envelope
//! - [`queue`] - The [`StorageQueue`] trait
//! - [`lease`] - The [`LeaseStore`] trait and blob properties
//! - [`blob`] - The [`BlobContainer`] trait and listing pages
//! - [`account`] - Account and account-provider traits
//! - [`memory`] - In-memory implementation used by tests and the demo service

pub mod account;
pub mod blob;
pub mod error;
pub mod lease;
pub mod memory;
pub mod message;
pub mod queue;

pub use account::{StorageAccount, StorageAccountProvider, DEFAULT_STORAGE_ACCOUNT};
pub use blob::{BlobContainer, BlobItem, BlobListing, DEFAULT_LIST_PAGE_SIZE};
pub use error::{StorageError, ValidationError};
pub use lease::{BlobProperties, LeaseId, LeaseState, LeaseStatus, LeaseStore};
pub use memory::{
    FaultPoint, InMemoryAccountProvider, InMemoryBlobContainer, InMemoryLeaseStore, InMemoryQueue,
    InMemoryStorageAccount,
};
pub use message::{MessageId, PopReceipt, QueueMessage, QueueName, Timestamp, POISON_QUEUE_SUFFIX};
pub use queue::{StorageQueue, MAX_BATCH_SIZE};
