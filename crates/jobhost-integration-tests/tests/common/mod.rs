//! Common utilities for jobhost integration tests
//!
//! This module provides:
//! - A recording background-exception handler
//! - A function executor that tracks attempts, completions and overlaps
//! - Builders for singleton managers and queue listeners over one shared
//!   in-memory storage account

use async_trait::async_trait;
use jobhost_core::singleton::SingletonConfig;
use jobhost_core::{
    BackgroundExceptionHandler, BlobLeaseDistributedLockManager, DelayedException,
    FixedHostIdProvider, FunctionDescriptor, FunctionExecutor, FunctionInstance, JobHostError,
    QueueListener, QueueListenerBuilder, QueueTriggerExecutor, QueuesConfig, SingletonManager,
};
use jobhost_storage::{
    InMemoryAccountProvider, InMemoryStorageAccount, QueueMessage, QueueName, StorageAccount,
    DEFAULT_STORAGE_ACCOUNT,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Exception handler
// ============================================================================

/// Records background errors instead of stopping anything
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingExceptionHandler {
    errors: Arc<Mutex<Vec<String>>>,
}

impl RecordingExceptionHandler {
    #[allow(dead_code)]
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackgroundExceptionHandler for RecordingExceptionHandler {
    async fn on_unhandled_exception(&self, error: JobHostError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

// ============================================================================
// Tracking function
// ============================================================================

#[derive(Default)]
struct TrackerState {
    attempts: HashMap<String, u32>,
    completed: Vec<String>,
    active: HashSet<String>,
    overlaps: u32,
    running: usize,
    max_running: usize,
}

/// Function that takes `work` per message, fails bodies starting with
/// `fail`, and records everything it sees.
///
/// Clones share their records, so several listeners can report into one
/// tracker.
#[derive(Clone)]
#[allow(dead_code)]
pub struct TrackingFunction {
    work: Duration,
    state: Arc<Mutex<TrackerState>>,
}

#[allow(dead_code)]
impl TrackingFunction {
    pub fn new(work: Duration) -> Self {
        Self {
            work,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    /// Times each body was attempted
    pub fn attempts(&self, body: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(body)
            .copied()
            .unwrap_or(0)
    }

    /// Bodies that succeeded, in completion order
    pub fn completed(&self) -> Vec<String> {
        self.state.lock().unwrap().completed.clone()
    }

    /// Times a body started while another attempt at it was still running
    pub fn overlaps(&self) -> u32 {
        self.state.lock().unwrap().overlaps
    }

    /// Most attempts of any body running at once
    pub fn max_running(&self) -> usize {
        self.state.lock().unwrap().max_running
    }
}

#[async_trait]
impl FunctionExecutor for TrackingFunction {
    async fn try_execute(
        &self,
        instance: FunctionInstance,
        _cancel: CancellationToken,
    ) -> Option<DelayedException> {
        let body = String::from_utf8_lossy(&instance.trigger_value).into_owned();
        {
            let mut state = self.state.lock().unwrap();
            *state.attempts.entry(body.clone()).or_default() += 1;
            if !state.active.insert(body.clone()) {
                state.overlaps += 1;
            }
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
        }

        tokio::time::sleep(self.work).await;

        let mut state = self.state.lock().unwrap();
        state.active.remove(&body);
        state.running -= 1;
        if body.starts_with("fail") {
            return Some(DelayedException::new(anyhow::anyhow!("'{}' failed", body)));
        }
        state.completed.push(body);
        None
    }
}

// ============================================================================
// Builders
// ============================================================================

#[allow(dead_code)]
pub fn account() -> InMemoryStorageAccount {
    InMemoryStorageAccount::new(DEFAULT_STORAGE_ACCOUNT)
}

#[allow(dead_code)]
pub fn queue_name(name: &str) -> QueueName {
    name.parse().unwrap()
}

/// Create the queue and add one message per body
#[allow(dead_code)]
pub async fn seed(account: &InMemoryStorageAccount, name: &QueueName, bodies: &[&str]) {
    let queue = account.queue(name);
    queue.create_if_not_exists().await.unwrap();
    for body in bodies {
        queue
            .add_message(QueueMessage::new(body.to_string()))
            .await
            .unwrap();
    }
}

/// One host instance's singleton manager over the shared account
#[allow(dead_code)]
pub fn singleton_manager(
    account: &InMemoryStorageAccount,
    host_id: &str,
    config: SingletonConfig,
    handler: &RecordingExceptionHandler,
) -> Arc<SingletonManager> {
    let provider = InMemoryAccountProvider::new().with_account(account.clone());
    Arc::new(SingletonManager::new(
        Arc::new(BlobLeaseDistributedLockManager::new(Arc::new(provider))),
        config,
        Arc::new(handler.clone()),
        Arc::new(FixedHostIdProvider::new(host_id).unwrap()),
    ))
}

/// Queue listener builder running `function` for each message
#[allow(dead_code)]
pub fn listener_builder(
    account: &InMemoryStorageAccount,
    name: &QueueName,
    function: Arc<dyn FunctionExecutor>,
    handler: &RecordingExceptionHandler,
) -> QueueListenerBuilder {
    let trigger = QueueTriggerExecutor::new(
        Arc::new(FunctionDescriptor::new("Jobs.Queue.Process")),
        function,
        name.clone(),
    );
    QueueListenerBuilder::new(account.queue(name), Arc::new(trigger), Arc::new(handler.clone()))
}

/// Queue listener with a poison queue and the given batch settings
#[allow(dead_code)]
pub fn poisoning_listener(
    account: &InMemoryStorageAccount,
    name: &QueueName,
    function: &TrackingFunction,
    handler: &RecordingExceptionHandler,
    batch_size: u32,
    max_dequeue_count: u32,
) -> QueueListener {
    listener_builder(account, name, Arc::new(function.clone()), handler)
        .poison_queue(account.queue(&name.poison_queue_name()))
        .config(QueuesConfig {
            batch_size,
            max_dequeue_count,
            ..QueuesConfig::default()
        })
        .build()
        .unwrap()
}
