//! Channel for errors raised by background work nobody awaits.

use crate::error::JobHostError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Receives errors from timers and processing tasks that have no caller to
/// return them to.
#[async_trait]
pub trait BackgroundExceptionHandler: Send + Sync {
    /// Handle an unhandled background error
    async fn on_unhandled_exception(&self, error: JobHostError);
}

/// Logs background errors, keeps their messages and signals host shutdown.
///
/// Cloning shares the recorded errors and the shutdown token.
#[derive(Clone)]
pub struct HostExceptionHandler {
    shutdown: CancellationToken,
    errors: Arc<Mutex<Vec<String>>>,
}

impl HostExceptionHandler {
    /// Create a handler that cancels `shutdown` on the first error
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Token cancelled once an unhandled error has been seen
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Messages of every error handled so far
    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BackgroundExceptionHandler for HostExceptionHandler {
    async fn on_unhandled_exception(&self, error: JobHostError) {
        error!(
            error = %error,
            category = ?error.error_category(),
            "Unhandled background error; stopping the host"
        );

        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.to_string());
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[path = "exceptions_tests.rs"]
mod tests;
