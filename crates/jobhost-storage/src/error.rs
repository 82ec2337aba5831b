//! Error types for storage operations.
//!
//! Storage errors carry enough information for callers to classify them
//! without string matching: the listener backs off on transient fetch
//! failures, swallows benign completion races and treats lease conflicts as
//! contention rather than failure.

use thiserror::Error;

/// Error returned by queue and blob-lease operations
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue '{queue_name}' is being deleted or is disabled")]
    QueueBeingDeleted { queue_name: String },

    #[error("Message '{message_id}' not found in queue '{queue_name}'")]
    MessageNotFound {
        queue_name: String,
        message_id: String,
    },

    #[error("Pop receipt does not match for message '{message_id}'")]
    PopReceiptMismatch { message_id: String },

    #[error("Container not found: {container}")]
    ContainerNotFound { container: String },

    #[error("Blob not found: {blob_name}")]
    BlobNotFound { blob_name: String },

    #[error("Blob already exists: {blob_name}")]
    BlobAlreadyExists { blob_name: String },

    #[error("There is already a lease present on blob '{blob_name}'")]
    LeaseAlreadyPresent { blob_name: String },

    #[error("The lease id specified did not match the lease on blob '{blob_name}'")]
    LeaseIdMismatch { blob_name: String },

    #[error("There is currently no lease on blob '{blob_name}'")]
    LeaseNotPresent { blob_name: String },

    #[error("There is currently a lease on blob '{blob_name}' and no lease id was specified")]
    LeaseIdMissing { blob_name: String },

    #[error("Storage account not found: {account_name}")]
    AccountNotFound { account_name: String },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl StorageError {
    /// HTTP-style status code for this error.
    ///
    /// Mirrors the codes a blob/queue service returns so callers can reason
    /// about "not found" (404), "conflict" (409) and "precondition failed"
    /// (412) uniformly.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::QueueNotFound { .. }
            | Self::MessageNotFound { .. }
            | Self::ContainerNotFound { .. }
            | Self::BlobNotFound { .. }
            | Self::AccountNotFound { .. } => 404,
            Self::QueueBeingDeleted { .. }
            | Self::BlobAlreadyExists { .. }
            | Self::LeaseAlreadyPresent { .. }
            | Self::LeaseIdMismatch { .. } => 409,
            Self::PopReceiptMismatch { .. }
            | Self::LeaseNotPresent { .. }
            | Self::LeaseIdMissing { .. } => 412,
            Self::ServerError { status, .. } => *status,
            Self::Timeout => 500,
            Self::Cancelled => 499,
            Self::Validation(_) => 400,
        }
    }

    /// Service error code, as reported in storage responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::QueueNotFound { .. } => "QueueNotFound",
            Self::QueueBeingDeleted { .. } => "QueueBeingDeleted",
            Self::MessageNotFound { .. } => "MessageNotFound",
            Self::PopReceiptMismatch { .. } => "PopReceiptMismatch",
            Self::ContainerNotFound { .. } => "ContainerNotFound",
            Self::BlobNotFound { .. } => "BlobNotFound",
            Self::BlobAlreadyExists { .. } => "BlobAlreadyExists",
            Self::LeaseAlreadyPresent { .. } => "LeaseAlreadyPresent",
            Self::LeaseIdMismatch { .. } => "LeaseIdMismatchWithLeaseOperation",
            Self::LeaseNotPresent { .. } => "LeaseNotPresentWithLeaseOperation",
            Self::LeaseIdMissing { .. } => "LeaseIdMissing",
            Self::AccountNotFound { .. } => "AccountNotFound",
            Self::ServerError { .. } => "InternalError",
            Self::Timeout => "OperationTimedOut",
            Self::Cancelled => "OperationCancelled",
            Self::Validation(_) => "InvalidInput",
        }
    }

    /// Check if the error came from the server side (5xx)
    pub fn is_server_side(&self) -> bool {
        (500..600).contains(&self.status_code())
    }

    /// Check if the error is a 404 of any kind
    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }

    /// Check if the error is a 409 of any kind
    pub fn is_conflict(&self) -> bool {
        self.status_code() == 409
    }

    /// Check if the error is a 412 of any kind
    pub fn is_precondition_failed(&self) -> bool {
        self.status_code() == 412
    }

    /// Check if the error means another party holds the lease
    pub fn is_lease_conflict(&self) -> bool {
        matches!(
            self,
            Self::LeaseAlreadyPresent { .. } | Self::LeaseIdMismatch { .. }
        )
    }

    /// Check if the error means our lease is no longer valid
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Self::LeaseIdMismatch { .. }
                | Self::LeaseNotPresent { .. }
                | Self::BlobNotFound { .. }
                | Self::ContainerNotFound { .. }
        )
    }

    /// Check if a failed fetch should be answered with a backoff rather than
    /// surfaced: the queue is missing, being deleted, or the server failed.
    pub fn is_transient_fetch_failure(&self) -> bool {
        matches!(
            self,
            Self::QueueNotFound { .. } | Self::QueueBeingDeleted { .. }
        ) || self.is_server_side()
    }

    /// Check if a failed delete or visibility update lost a benign race:
    /// the message was already deleted, its receipt is stale, or the queue
    /// is gone.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            Self::PopReceiptMismatch { .. }
                | Self::MessageNotFound { .. }
                | Self::QueueNotFound { .. }
                | Self::QueueBeingDeleted { .. }
        )
    }

    /// Check if the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Validation errors for identifiers and arguments
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
