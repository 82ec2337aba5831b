//! Shared test doubles for unit tests across modules.

use crate::error::{JobHostError, JobHostResult};
use crate::executors::{DelayedException, FunctionExecutor, FunctionInstance};
use crate::timers::{BackgroundExceptionHandler, TaskSeriesCommand, TaskSeriesCommandResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Let every ready task run, then advance the paused clock by a millisecond.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Exception handler that records error messages
#[derive(Clone, Default)]
pub(crate) struct RecordingExceptionHandler {
    errors: Arc<Mutex<Vec<String>>>,
}

impl RecordingExceptionHandler {
    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackgroundExceptionHandler for RecordingExceptionHandler {
    async fn on_unhandled_exception(&self, error: JobHostError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

type CommandFn =
    dyn Fn(u32, CancellationToken) -> BoxFuture<'static, JobHostResult<TaskSeriesCommandResult>>
        + Send
        + Sync;

/// Command that delegates to a closure and counts calls
pub(crate) struct FnCommand {
    calls: Arc<AtomicU32>,
    f: Box<CommandFn>,
}

impl FnCommand {
    pub(crate) fn new<F>(f: F) -> (Arc<Self>, Arc<AtomicU32>)
    where
        F: Fn(u32, CancellationToken) -> BoxFuture<'static, JobHostResult<TaskSeriesCommandResult>>
            + Send
            + Sync
            + 'static,
    {
        let calls = Arc::new(AtomicU32::new(0));
        let command = Arc::new(Self {
            calls: Arc::clone(&calls),
            f: Box::new(f),
        });
        (command, calls)
    }
}

#[async_trait]
impl TaskSeriesCommand for FnCommand {
    async fn execute(&self, cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.f)(call, cancel).await
    }
}

/// Function executor that records instances and fails bodies it is told to
#[derive(Clone, Default)]
pub(crate) struct RecordingFunctionExecutor {
    instances: Arc<Mutex<Vec<FunctionInstance>>>,
    fail_all: Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingFunctionExecutor {
    pub(crate) fn failing() -> Self {
        let executor = Self::default();
        executor
            .fail_all
            .store(true, std::sync::atomic::Ordering::SeqCst);
        executor
    }

    pub(crate) fn instances(&self) -> Vec<FunctionInstance> {
        self.instances.lock().unwrap().clone()
    }
}

#[async_trait]
impl FunctionExecutor for RecordingFunctionExecutor {
    async fn try_execute(
        &self,
        instance: FunctionInstance,
        _cancel: CancellationToken,
    ) -> Option<DelayedException> {
        self.instances.lock().unwrap().push(instance);
        if self.fail_all.load(std::sync::atomic::Ordering::SeqCst) {
            Some(DelayedException::new(anyhow::anyhow!("function failed")))
        } else {
            None
        }
    }
}

/// Singleton manager over an in-memory account, with a recording handler
pub(crate) fn singleton_manager(
    account: &jobhost_storage::InMemoryStorageAccount,
    host_id: &str,
    config: crate::singleton::SingletonConfig,
) -> (Arc<crate::singleton::SingletonManager>, RecordingExceptionHandler) {
    let provider = jobhost_storage::InMemoryAccountProvider::new().with_account(account.clone());
    let lock_manager = Arc::new(crate::locks::BlobLeaseDistributedLockManager::new(Arc::new(
        provider,
    )));
    let handler = RecordingExceptionHandler::default();
    let manager = crate::singleton::SingletonManager::new(
        lock_manager,
        config,
        Arc::new(handler.clone()),
        Arc::new(crate::locks::FixedHostIdProvider::new(host_id).unwrap()),
    );
    (Arc::new(manager), handler)
}

/// Listener that records lifecycle calls
#[derive(Clone, Default)]
pub(crate) struct RecordingListener {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_start: Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingListener {
    pub(crate) fn failing_start() -> Self {
        let listener = Self::default();
        listener
            .fail_start
            .store(true, std::sync::atomic::Ordering::SeqCst);
        listener
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        let calls = self.calls();
        calls.iter().filter(|c| **c == "start").count()
            > calls.iter().filter(|c| **c == "stop").count()
    }
}

#[async_trait]
impl crate::listeners::Listener for RecordingListener {
    async fn start(&self, _cancel: &CancellationToken) -> JobHostResult<()> {
        self.calls.lock().unwrap().push("start");
        if self.fail_start.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(JobHostError::invalid_operation("start failed"));
        }
        Ok(())
    }

    async fn stop(&self, _cancel: &CancellationToken) -> JobHostResult<()> {
        self.calls.lock().unwrap().push("stop");
        Ok(())
    }

    fn cancel(&self) {
        self.calls.lock().unwrap().push("cancel");
    }

    async fn dispose(&self) {
        self.calls.lock().unwrap().push("dispose");
    }
}
