//! Blob container abstraction used by blob-triggered listeners.
//!
//! A [`BlobContainer`] lists its blobs in name order, one page at a time,
//! and reports each blob's last-modified time so that scanners can tell new
//! and changed blobs from ones they have already seen.

use crate::error::StorageError;
use crate::message::Timestamp;
use async_trait::async_trait;
use bytes::Bytes;

/// Default page size when listing a container
pub const DEFAULT_LIST_PAGE_SIZE: u32 = 5000;

/// A blob as reported by a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    pub container: String,
    pub name: String,
    pub last_modified: Timestamp,
    pub content_length: u64,
}

impl BlobItem {
    /// `container/name`, the form blob paths take in binding data and logs
    pub fn path(&self) -> String {
        format!("{}/{}", self.container, self.name)
    }
}

/// One page of a container listing
#[derive(Debug, Clone, Default)]
pub struct BlobListing {
    pub items: Vec<BlobItem>,
    /// Token for the next page, `None` when the listing is complete
    pub continuation: Option<String>,
}

/// Listing and content operations against one container
#[async_trait]
pub trait BlobContainer: Send + Sync {
    /// Container name
    fn name(&self) -> &str;

    /// Create the container; returns `true` if it was created by this call
    async fn create_if_not_exists(&self) -> Result<bool, StorageError>;

    /// List up to `max_results` blobs in name order, starting after the
    /// page `continuation` points to.
    ///
    /// # Errors
    ///
    /// [`StorageError::ContainerNotFound`] when the container does not exist.
    async fn list_blobs(
        &self,
        max_results: u32,
        continuation: Option<&str>,
    ) -> Result<BlobListing, StorageError>;

    /// Write a blob, replacing any existing content and bumping its
    /// last-modified time.
    ///
    /// # Errors
    ///
    /// - 404 when the container does not exist
    /// - 412 ([`StorageError::LeaseIdMissing`]) when the blob is leased
    async fn upload_blob(&self, name: &str, content: Bytes) -> Result<BlobItem, StorageError>;

    /// Read a blob's content
    async fn download_blob(&self, name: &str) -> Result<Bytes, StorageError>;
}
