//! Turns a new or changed blob into a function invocation.

use crate::error::JobHostResult;
use crate::executors::{
    BindingData, FunctionDescriptor, FunctionExecutor, FunctionInstance, FunctionResult,
    TriggerExecutor,
};
use async_trait::async_trait;
use jobhost_storage::{BlobContainer, BlobItem};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Binding data key holding the `container/name` path of the blob
pub const BLOB_TRIGGER_KEY: &str = "BlobTrigger";

/// Runs a function once per detected blob, with the blob content as its
/// trigger value
pub struct BlobTriggerExecutor {
    function: Arc<FunctionDescriptor>,
    executor: Arc<dyn FunctionExecutor>,
    container: Arc<dyn BlobContainer>,
}

impl BlobTriggerExecutor {
    pub fn new(
        function: Arc<FunctionDescriptor>,
        executor: Arc<dyn FunctionExecutor>,
        container: Arc<dyn BlobContainer>,
    ) -> Self {
        Self {
            function,
            executor,
            container,
        }
    }

    pub fn function(&self) -> &Arc<FunctionDescriptor> {
        &self.function
    }

    /// Binding data exposed for a blob
    pub fn binding_data(blob: &BlobItem) -> BindingData {
        BindingData::from([
            (BLOB_TRIGGER_KEY.to_string(), blob.path()),
            ("Name".to_string(), blob.name.clone()),
            ("LastModified".to_string(), blob.last_modified.to_rfc3339()),
            ("Length".to_string(), blob.content_length.to_string()),
        ])
    }
}

#[async_trait]
impl TriggerExecutor<BlobItem> for BlobTriggerExecutor {
    /// Download the blob and run the function.
    ///
    /// A blob deleted since it was listed counts as handled.
    async fn execute(&self, value: &BlobItem, cancel: CancellationToken) -> JobHostResult<FunctionResult> {
        let content = match self.container.download_blob(&value.name).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => {
                debug!(blob = %value.path(), "Blob no longer exists; skipping");
                return Ok(FunctionResult::success());
            }
            Err(e) => return Err(e.into()),
        };

        let mut instance =
            FunctionInstance::new(Arc::clone(&self.function), content, Self::binding_data(value));
        instance.reason = format!("New blob detected: {}", value.path());

        Ok(self.executor.try_execute(instance, cancel).await.into())
    }
}

#[cfg(test)]
#[path = "trigger_tests.rs"]
mod tests;
