//! Blob-triggered functions.
//!
//! [`BlobListener`] scans registered containers on a fixed interval and
//! runs a function for every new or changed blob through a
//! [`BlobTriggerExecutor`].

pub mod listener;
pub mod trigger;

pub use listener::{
    BlobListener, ScanBlobPollingStrategy, DEFAULT_BLOB_POLLING_INTERVAL,
    DEFAULT_SCAN_BLOB_LIMIT_PER_POLL,
};
pub use trigger::{BlobTriggerExecutor, BLOB_TRIGGER_KEY};
