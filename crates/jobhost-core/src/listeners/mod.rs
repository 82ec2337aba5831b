//! Listener lifecycle.
//!
//! A listener watches a trigger source and invokes functions while it is
//! started. A stopped listener may be started again when its implementation
//! allows it; dispose is final.

use crate::error::JobHostResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Watches a trigger source between `start` and `stop`
#[async_trait]
pub trait Listener: Send + Sync {
    /// Begin listening
    async fn start(&self, cancel: &CancellationToken) -> JobHostResult<()>;

    /// Stop listening, waiting for in-progress work to finish
    async fn stop(&self, cancel: &CancellationToken) -> JobHostResult<()>;

    /// Signal the listener to stop without waiting
    fn cancel(&self);

    /// Release resources. Disposing twice is a no-op.
    async fn dispose(&self);
}

/// Starts and stops several listeners together
pub struct CompositeListener {
    listeners: Vec<Arc<dyn Listener>>,
}

impl CompositeListener {
    pub fn new(listeners: Vec<Arc<dyn Listener>>) -> Self {
        Self { listeners }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[async_trait]
impl Listener for CompositeListener {
    async fn start(&self, cancel: &CancellationToken) -> JobHostResult<()> {
        for listener in &self.listeners {
            listener.start(cancel).await?;
        }
        Ok(())
    }

    async fn stop(&self, cancel: &CancellationToken) -> JobHostResult<()> {
        let results =
            futures::future::join_all(self.listeners.iter().map(|l| l.stop(cancel))).await;
        results.into_iter().collect()
    }

    fn cancel(&self) {
        for listener in &self.listeners {
            listener.cancel();
        }
    }

    async fn dispose(&self) {
        for listener in &self.listeners {
            listener.dispose().await;
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
