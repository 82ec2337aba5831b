//! Scanning listener for blob containers.
//!
//! A [`BlobListener`] runs a [`ScanBlobPollingStrategy`] on a
//! [`TaskSeriesTimer`]. Every cycle the strategy first retries blobs whose
//! functions failed last time and blobs reported through
//! [`ScanBlobPollingStrategy::notify`], then lists one page of every
//! registered container.
//!
//! Each container keeps a last-modified watermark. A full sweep may span
//! several cycles when a container holds more blobs than its share of the
//! per-cycle listing budget; blobs modified after the watermark of the
//! previous complete sweep are treated as new. The watermark only advances
//! once a sweep reaches the end of the listing.

use crate::error::{JobHostError, JobHostResult};
use crate::executors::TriggerExecutor;
use crate::listeners::Listener;
use crate::timers::{
    BackgroundExceptionHandler, TaskSeriesCommand, TaskSeriesCommandResult, TaskSeriesTimer,
};
use async_trait::async_trait;
use jobhost_storage::{BlobContainer, BlobItem, Timestamp};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay between scan cycles
pub const DEFAULT_BLOB_POLLING_INTERVAL: Duration = Duration::from_secs(10);

/// Blobs listed per cycle, shared evenly between registered containers
pub const DEFAULT_SCAN_BLOB_LIMIT_PER_POLL: u32 = 10_000;

type BlobTrigger = Arc<dyn TriggerExecutor<BlobItem>>;

// ============================================================================
// Strategy
// ============================================================================

/// Sweep position and registrations of one container
struct ContainerScan {
    container: Arc<dyn BlobContainer>,
    registrations: Vec<BlobTrigger>,
    /// Newest blob seen by the last complete sweep
    last_sweep_latest_modified: Option<Timestamp>,
    /// Newest blob seen so far by the sweep in progress
    current_sweep_latest_modified: Option<Timestamp>,
    continuation: Option<String>,
}

/// Finds new and changed blobs by listing containers
pub struct ScanBlobPollingStrategy {
    containers: Mutex<BTreeMap<String, ContainerScan>>,
    pending: Mutex<VecDeque<BlobItem>>,
    scan_blob_limit_per_poll: u32,
    polling_interval: Duration,
}

impl Default for ScanBlobPollingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanBlobPollingStrategy {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(VecDeque::new()),
            scan_blob_limit_per_poll: DEFAULT_SCAN_BLOB_LIMIT_PER_POLL,
            polling_interval: DEFAULT_BLOB_POLLING_INTERVAL,
        }
    }

    /// Change the per-cycle listing budget
    pub fn with_scan_blob_limit_per_poll(mut self, limit: u32) -> Self {
        self.scan_blob_limit_per_poll = limit.max(1);
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Run `trigger` for new and changed blobs in `container`.
    ///
    /// A container registered more than once is listed once per cycle and
    /// each blob goes to every registration.
    pub fn register(&self, container: Arc<dyn BlobContainer>, trigger: BlobTrigger) {
        let name = container.name().to_string();
        debug!(container = %name, "Registering blob container");
        self.containers()
            .entry(name)
            .or_insert_with(|| ContainerScan {
                container,
                registrations: Vec::new(),
                last_sweep_latest_modified: None,
                current_sweep_latest_modified: None,
                continuation: None,
            })
            .registrations
            .push(trigger);
    }

    /// Report a blob written by this host so it runs on the next cycle
    /// without waiting for a sweep to reach it.
    ///
    /// Blobs outside the registered containers are ignored.
    pub fn notify(&self, blob: BlobItem) {
        self.pending().push_back(blob);
    }

    /// Blobs waiting for the next cycle, including failed ones
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn containers(&self) -> MutexGuard<'_, BTreeMap<String, ContainerScan>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<BlobItem>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        failed: &mut Vec<BlobItem>,
    ) -> JobHostResult<()> {
        let queued: Vec<BlobItem> = self.pending().drain(..).collect();
        self.notify_all(queued, failed, cancel).await?;

        let names: Vec<String> = self.containers().keys().cloned().collect();
        for name in names {
            let found = self.poll_new_blobs(&name, cancel).await?;
            if !found.is_empty() {
                debug!(container = %name, count = found.len(), "Found new blobs");
            }
            self.notify_all(found, failed, cancel).await?;
        }

        Ok(())
    }

    /// Notify each blob in turn. On error, the blobs not yet notified are
    /// kept in `failed` with the rest.
    async fn notify_all(
        &self,
        blobs: Vec<BlobItem>,
        failed: &mut Vec<BlobItem>,
        cancel: &CancellationToken,
    ) -> JobHostResult<()> {
        let mut blobs = blobs.into_iter();
        while let Some(blob) = blobs.next() {
            match self.notify_registrations(&blob, cancel).await {
                Ok(true) => {}
                Ok(false) => failed.push(blob),
                Err(e) => {
                    failed.push(blob);
                    failed.extend(blobs);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Run every registration of the blob's container.
    ///
    /// Returns `false` if any of them failed.
    async fn notify_registrations(
        &self,
        blob: &BlobItem,
        cancel: &CancellationToken,
    ) -> JobHostResult<bool> {
        let registrations = match self.containers().get(&blob.container) {
            Some(scan) => scan.registrations.clone(),
            None => return Ok(true),
        };

        let mut succeeded = true;
        for registration in registrations {
            if cancel.is_cancelled() {
                return Err(JobHostError::Cancelled);
            }

            match registration.execute(blob, cancel.clone()).await {
                Ok(result) if result.succeeded() => {}
                Ok(_) => {
                    debug!(blob = %blob.path(), "Blob function failed; retrying next cycle");
                    succeeded = false;
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(blob = %blob.path(), error = %e, "Blob trigger failed; retrying next cycle");
                    succeeded = false;
                }
            }
        }

        Ok(succeeded)
    }

    /// List the next page of a container and return the blobs modified
    /// since the last complete sweep
    async fn poll_new_blobs(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> JobHostResult<Vec<BlobItem>> {
        let (container, continuation, limit) = {
            let containers = self.containers();
            let Some(scan) = containers.get(name) else {
                return Ok(Vec::new());
            };
            let limit = (self.scan_blob_limit_per_poll / containers.len() as u32).max(1);
            (Arc::clone(&scan.container), scan.continuation.clone(), limit)
        };

        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobHostError::Cancelled),
            listed = container.list_blobs(limit, continuation.as_deref()) => listed,
        };
        let listing = match listed {
            Ok(listing) => listing,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) if e.is_server_side() => {
                warn!(container = %name, error = %e, "Blob listing failed; retrying next cycle");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut containers = self.containers();
        let Some(scan) = containers.get_mut(name) else {
            return Ok(Vec::new());
        };

        if continuation.is_none() {
            scan.current_sweep_latest_modified = None;
        }

        let mut found = Vec::new();
        for blob in listing.items {
            let modified = Some(blob.last_modified);
            if modified > scan.current_sweep_latest_modified {
                scan.current_sweep_latest_modified = modified;
            }
            if modified > scan.last_sweep_latest_modified {
                found.push(blob);
            }
        }

        scan.continuation = listing.continuation;
        if scan.continuation.is_none() {
            scan.last_sweep_latest_modified = scan.current_sweep_latest_modified;
        }

        Ok(found)
    }
}

#[async_trait]
impl TaskSeriesCommand for ScanBlobPollingStrategy {
    async fn execute(&self, cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult> {
        let mut failed = Vec::new();
        let cycle = self.run_cycle(&cancel, &mut failed).await;

        if !failed.is_empty() {
            self.pending().extend(failed);
        }
        cycle?;

        Ok(TaskSeriesCommandResult::delay(self.polling_interval))
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Polls blob containers and runs functions for new and changed blobs.
///
/// Like the queue listener, a stopped blob listener can be started again.
pub struct BlobListener {
    strategy: Arc<ScanBlobPollingStrategy>,
    exception_handler: Arc<dyn BackgroundExceptionHandler>,
    timer: Mutex<Option<TaskSeriesTimer>>,
    disposed: AtomicBool,
}

impl BlobListener {
    pub fn new(
        strategy: Arc<ScanBlobPollingStrategy>,
        exception_handler: Arc<dyn BackgroundExceptionHandler>,
    ) -> Self {
        Self {
            strategy,
            exception_handler,
            timer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// The strategy this listener runs, for registering containers and
    /// reporting written blobs
    pub fn strategy(&self) -> &Arc<ScanBlobPollingStrategy> {
        &self.strategy
    }

    fn timer(&self) -> MutexGuard<'_, Option<TaskSeriesTimer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_disposed(&self) -> JobHostResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(JobHostError::Disposed {
                object: "BlobListener",
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Listener for BlobListener {
    async fn start(&self, _cancel: &CancellationToken) -> JobHostResult<()> {
        self.check_disposed()?;

        let mut timer = self.timer();
        if timer.is_some() {
            return Err(JobHostError::invalid_operation(
                "The listener has already been started.",
            ));
        }

        let series = TaskSeriesTimer::new(
            Arc::clone(&self.strategy) as Arc<dyn TaskSeriesCommand>,
            Arc::clone(&self.exception_handler),
            futures::future::ready(()),
        );
        series.start()?;
        *timer = Some(series);

        info!(
            containers = self.strategy.containers().len(),
            "Blob listener started"
        );
        Ok(())
    }

    async fn stop(&self, _cancel: &CancellationToken) -> JobHostResult<()> {
        self.check_disposed()?;

        let timer = self.timer().take().ok_or_else(|| {
            JobHostError::invalid_operation("The listener has not been started.")
        })?;
        timer.stop().await?;

        info!(
            pending = self.strategy.pending_count(),
            "Blob listener stopped"
        );
        Ok(())
    }

    fn cancel(&self) {
        if let Some(timer) = self.timer().as_ref() {
            timer.cancel();
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel();

        let timer = self.timer().take();
        if let Some(timer) = timer {
            timer.dispose().await;
        }
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
