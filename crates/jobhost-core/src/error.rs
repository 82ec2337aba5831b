//! Error types for the job host runtime.

use jobhost_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Standard result type for job host operations
pub type JobHostResult<T> = Result<T, JobHostError>;

/// Error raised by listeners, timers, lock management and executors
#[derive(Debug, Error)]
pub enum JobHostError {
    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Binding error: {0}")]
    Binding(#[from] BindingError),

    /// A singleton declaration that cannot be honoured
    #[error("{message}")]
    NotSupported { message: String },

    /// An operation called in the wrong lifecycle state
    #[error("{message}")]
    InvalidOperation { message: String },

    #[error("Cannot access a disposed object: {object}")]
    Disposed { object: &'static str },

    #[error("Unable to acquire singleton lock blob lease for blob '{lock_id}' (timeout of {timeout:?} exceeded).")]
    LockTimeout { lock_id: String, timeout: Duration },

    #[error("Singleton lock lease lost for '{lock_id}'")]
    LeaseLost { lock_id: String },

    #[error("Background task failed: {message}")]
    TaskFailed { message: String },

    #[error("The operation was cancelled")]
    Cancelled,
}

impl JobHostError {
    /// Create an invalid-operation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a not-supported error
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Check if the error only reports cancellation
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Storage(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Get error category for logging and alerting
    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::Storage(e) if e.is_server_side() => ErrorCategory::Transient,
            Self::Storage(_) => ErrorCategory::Permanent,
            Self::Configuration(_) | Self::NotSupported { .. } => ErrorCategory::Configuration,
            Self::Binding(_) | Self::InvalidOperation { .. } | Self::Disposed { .. } => {
                ErrorCategory::Permanent
            }
            Self::LockTimeout { .. } | Self::LeaseLost { .. } => ErrorCategory::Contention,
            Self::TaskFailed { .. } => ErrorCategory::Permanent,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

/// Error categories for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Configuration,
    Contention,
    Cancelled,
}

/// Invalid configuration values, raised synchronously at setup
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

impl ConfigurationError {
    pub(crate) fn out_of_range(field: &str, message: impl Into<String>) -> Self {
        Self::OutOfRange {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Failures resolving binding expressions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("No value for named parameter '{parameter}'.")]
    MissingParameter { parameter: String },

    #[error("Invalid binding expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("Unable to resolve app setting for '%{name}%'.")]
    UnresolvedSetting { name: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
