//! Wires storage, locks and listeners into a running host.

use crate::demo::DemoFunction;
use crate::settings::ServiceSettings;
use anyhow::Context;
use jobhost_core::{
    BlobLeaseDistributedLockManager, FunctionDescriptor, HostExceptionHandler, Listener,
    QueueListenerBuilder, QueueTriggerExecutor, SharedQueueWatcher, SingletonAttribute,
    SingletonFunctionExecutor, SingletonListener, SingletonManager, TracingLogSink,
};
use jobhost_storage::{InMemoryAccountProvider, InMemoryStorageAccount, QueueMessage, StorageAccount, StorageQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One host instance: a queue listener for the demo function, optionally
/// gated by a singleton listener lock
pub struct JobHost {
    listener: Arc<dyn Listener>,
    singleton: Option<Arc<SingletonListener>>,
    queue: Arc<dyn StorageQueue>,
    function: DemoFunction,
    exception_handler: HostExceptionHandler,
}

impl JobHost {
    /// Build a host over `account`.
    ///
    /// Background errors cancel `shutdown`.
    pub async fn build(
        settings: &ServiceSettings,
        account: InMemoryStorageAccount,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let queue_name = settings.queue_name()?;
        let exception_handler = HostExceptionHandler::new(shutdown);

        let provider = InMemoryAccountProvider::new().with_account(account.clone());
        let lock_manager = Arc::new(BlobLeaseDistributedLockManager::new(Arc::new(provider)));
        let manager = Arc::new(SingletonManager::new(
            lock_manager,
            settings.host.singleton_config()?,
            Arc::new(exception_handler.clone()),
            Arc::new(settings.host.host_id_provider()?),
        ));
        let host_id = manager.host_id().await?;

        let mut descriptor = FunctionDescriptor::new(settings.demo.function_name.as_str());
        if settings.demo.singleton_listener {
            descriptor = descriptor.with_singleton(SingletonAttribute::listener());
        }
        let descriptor = Arc::new(descriptor);

        let function = DemoFunction::new(Duration::from_millis(settings.demo.work_ms));
        let executor = SingletonFunctionExecutor::new(function.clone(), Arc::clone(&manager));
        let trigger = QueueTriggerExecutor::new(
            Arc::clone(&descriptor),
            Arc::new(executor),
            queue_name.clone(),
        );

        let queue = account.queue(&queue_name);
        let queue_listener = QueueListenerBuilder::new(
            Arc::clone(&queue),
            Arc::new(trigger),
            Arc::new(exception_handler.clone()),
        )
        .poison_queue(account.queue(&queue_name.poison_queue_name()))
        .watcher(Arc::new(SharedQueueWatcher::new()))
        .config(settings.host.queues.clone())
        .log_sink(Arc::new(TracingLogSink))
        .build()
        .context("failed to build the queue listener")?;

        let queue_listener: Arc<dyn Listener> = Arc::new(queue_listener);
        let singleton = SingletonManager::get_listener_singleton_or_none(None, &descriptor)?.map(
            |attribute| {
                Arc::new(SingletonListener::new(
                    Some(Arc::clone(&descriptor)),
                    attribute,
                    Arc::clone(&manager),
                    Arc::clone(&queue_listener),
                ))
            },
        );
        let listener: Arc<dyn Listener> = match &singleton {
            Some(singleton) => singleton.clone(),
            None => queue_listener,
        };

        info!(
            host_id = %host_id,
            queue = %queue_name,
            function = %descriptor.short_name,
            singleton_listener = singleton.is_some(),
            "Job host built"
        );

        Ok(Self {
            listener,
            singleton,
            queue,
            function,
            exception_handler,
        })
    }

    /// Create the queue if needed and add `bodies` to it
    pub async fn seed(&self, bodies: &[String]) -> anyhow::Result<()> {
        self.queue.create_if_not_exists().await?;
        for body in bodies {
            self.queue.add_message(QueueMessage::new(body.clone())).await?;
        }
        if !bodies.is_empty() {
            info!(queue = %self.queue.name(), count = bodies.len(), "Seeded queue");
        }
        Ok(())
    }

    pub async fn start(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.listener.start(cancel).await?;
        Ok(())
    }

    /// Stop gracefully, then release everything
    pub async fn stop(&self) {
        if let Err(e) = self.listener.stop(&CancellationToken::new()).await {
            warn!(error = %e, "Listener did not stop cleanly");
        }
        self.listener.dispose().await;
        info!("Job host stopped");
    }

    /// Whether this instance is the one processing messages
    pub async fn is_listening(&self) -> bool {
        match &self.singleton {
            Some(singleton) => singleton.is_listening().await,
            None => true,
        }
    }

    pub fn function(&self) -> &DemoFunction {
        &self.function
    }

    /// Background errors seen so far
    pub fn errors(&self) -> Vec<String> {
        self.exception_handler.errors()
    }
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
