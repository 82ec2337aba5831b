//! Turns a queue message into a function invocation.

use crate::error::JobHostResult;
use crate::executors::{
    BindingData, FunctionDescriptor, FunctionExecutor, FunctionInstance, FunctionResult,
    TriggerExecutor,
};
use async_trait::async_trait;
use jobhost_storage::{QueueMessage, QueueName};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Binding data key holding the message body
pub const QUEUE_TRIGGER_KEY: &str = "QueueTrigger";

/// Runs a function once per queue message
pub struct QueueTriggerExecutor {
    function: Arc<FunctionDescriptor>,
    executor: Arc<dyn FunctionExecutor>,
    queue_name: QueueName,
}

impl QueueTriggerExecutor {
    pub fn new(
        function: Arc<FunctionDescriptor>,
        executor: Arc<dyn FunctionExecutor>,
        queue_name: QueueName,
    ) -> Self {
        Self {
            function,
            executor,
            queue_name,
        }
    }

    pub fn function(&self) -> &Arc<FunctionDescriptor> {
        &self.function
    }

    /// Binding data exposed for a message.
    ///
    /// When the body is a JSON object its scalar top-level properties are
    /// added too, so binding expressions like `{region}` can refer to them.
    /// Message properties win over body properties of the same name.
    pub fn binding_data(message: &QueueMessage) -> BindingData {
        let mut data = BindingData::new();

        if let Ok(serde_json::Value::Object(properties)) =
            serde_json::from_slice::<serde_json::Value>(&message.body)
        {
            for (name, value) in properties {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                data.insert(name, text);
            }
        }

        data.insert(QUEUE_TRIGGER_KEY.to_string(), message.body_as_string());
        data.insert(
            "DequeueCount".to_string(),
            message.dequeue_count.to_string(),
        );
        data.insert("Id".to_string(), message.id.as_str().to_string());

        if let Some(receipt) = &message.pop_receipt {
            data.insert("PopReceipt".to_string(), receipt.as_str().to_string());
        }
        if let Some(time) = &message.insertion_time {
            data.insert("InsertionTime".to_string(), time.to_rfc3339());
        }
        if let Some(time) = &message.next_visible_time {
            data.insert("NextVisibleTime".to_string(), time.to_rfc3339());
        }

        data
    }
}

#[async_trait]
impl TriggerExecutor<QueueMessage> for QueueTriggerExecutor {
    async fn execute(
        &self,
        value: &QueueMessage,
        cancel: CancellationToken,
    ) -> JobHostResult<FunctionResult> {
        let mut instance = FunctionInstance::new(
            Arc::clone(&self.function),
            value.body.clone(),
            Self::binding_data(value),
        );
        instance.parent_id = value.causality_id;
        instance.reason = format!("New queue message detected on '{}'.", self.queue_name);

        Ok(self.executor.try_execute(instance, cancel).await.into())
    }
}

#[cfg(test)]
#[path = "trigger_tests.rs"]
mod tests;
