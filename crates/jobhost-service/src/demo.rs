//! The demo function run for each queue message.

use async_trait::async_trait;
use jobhost_core::{DelayedException, FunctionExecutor, FunctionInstance};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Body marker the demo function refuses to process
pub const POISON_MARKER: &str = "poison";

/// Logs each message after a simulated amount of work.
///
/// Bodies containing [`POISON_MARKER`] always fail, so they end up in the
/// poison queue after the configured number of attempts.
#[derive(Clone)]
pub struct DemoFunction {
    work: Duration,
    processed: Arc<Mutex<Vec<String>>>,
}

impl DemoFunction {
    pub fn new(work: Duration) -> Self {
        Self {
            work,
            processed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bodies processed successfully so far
    pub fn processed(&self) -> Vec<String> {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl FunctionExecutor for DemoFunction {
    async fn try_execute(
        &self,
        instance: FunctionInstance,
        cancel: CancellationToken,
    ) -> Option<DelayedException> {
        let body = String::from_utf8_lossy(&instance.trigger_value).into_owned();
        let dequeue_count = instance
            .binding_data
            .get("DequeueCount")
            .cloned()
            .unwrap_or_default();

        if body.contains(POISON_MARKER) {
            warn!(
                function = %instance.function.short_name,
                instance_id = %instance.id,
                dequeue_count = %dequeue_count,
                "Refusing to process message"
            );
            return Some(DelayedException::new(anyhow::anyhow!(
                "message '{}' cannot be processed",
                body
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Some(DelayedException::new(anyhow::anyhow!("processing was cancelled")));
            }
            _ = tokio::time::sleep(self.work) => {}
        }

        info!(
            function = %instance.function.short_name,
            instance_id = %instance.id,
            dequeue_count = %dequeue_count,
            body = %body,
            "Processed message"
        );
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(body);
        None
    }
}

#[cfg(test)]
#[path = "demo_tests.rs"]
mod tests;
