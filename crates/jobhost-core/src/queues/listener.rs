//! Polling listener for a storage queue.
//!
//! A [`QueueListener`] drives a serial polling loop on a [`TaskSeriesTimer`].
//! Each start runs a fresh timer, so a stopped listener can be started
//! again; only dispose is final.
//! Each poll fetches a batch, hands every message to its own processing
//! task and waits until the number of messages in flight drops to the new
//! batch threshold before polling again. Empty polls back off with a
//! randomized exponential delay that [`QueueListener::notify`] cuts short.
//!
//! While a message is being processed a per-message timer keeps extending
//! its visibility timeout, so long-running functions do not see their
//! message delivered to another listener.

use crate::error::{ConfigurationError, JobHostError, JobHostResult};
use crate::executors::TriggerExecutor;
use crate::listeners::Listener;
use crate::logging::{HostLogSink, LogRow};
use crate::queues::config::{QueuesConfig, MINIMUM_POLLING_INTERVAL};
use crate::queues::processor::{
    DefaultQueueProcessorFactory, QueueProcessor, QueueProcessorContext, QueueProcessorFactory,
};
use crate::queues::visibility::{snapshot, SharedMessage, UpdateQueueMessageVisibilityCommand};
use crate::queues::watcher::{MessageEnqueuedWatcher, NotificationCommand, SharedQueueWatcher};
use crate::timers::{
    BackgroundExceptionHandler, DelayStrategy, LinearSpeedupStrategy,
    RandomizedExponentialBackoffStrategy, TaskSeriesCommand, TaskSeriesCommandResult,
    TaskSeriesTimer,
};
use async_trait::async_trait;
use jobhost_storage::{QueueMessage, StorageQueue};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a fetched message stays hidden between visibility updates
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Floor for the visibility update interval after repeated failures
pub const DEFAULT_MINIMUM_VISIBILITY_RENEWAL_INTERVAL: Duration = Duration::from_secs(60);

const LOG_ROLE: &str = "QueueListener";

// ============================================================================
// Builder
// ============================================================================

/// Configures and creates a [`QueueListener`]
pub struct QueueListenerBuilder {
    queue: Arc<dyn StorageQueue>,
    poison_queue: Option<Arc<dyn StorageQueue>>,
    trigger_executor: Arc<dyn TriggerExecutor<QueueMessage>>,
    exception_handler: Arc<dyn BackgroundExceptionHandler>,
    watcher: Option<Arc<SharedQueueWatcher>>,
    config: QueuesConfig,
    log_sink: Option<Arc<dyn HostLogSink>>,
    visibility_timeout: Duration,
    minimum_visibility_renewal_interval: Duration,
    max_polling_interval: Option<Duration>,
}

impl QueueListenerBuilder {
    /// Start configuring a listener.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue to poll
    /// * `trigger_executor` - Runs the function for each message
    /// * `exception_handler` - Receives processing errors that are not
    ///   function failures
    pub fn new(
        queue: Arc<dyn StorageQueue>,
        trigger_executor: Arc<dyn TriggerExecutor<QueueMessage>>,
        exception_handler: Arc<dyn BackgroundExceptionHandler>,
    ) -> Self {
        Self {
            queue,
            poison_queue: None,
            trigger_executor,
            exception_handler,
            watcher: None,
            config: QueuesConfig::default(),
            log_sink: None,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            minimum_visibility_renewal_interval: DEFAULT_MINIMUM_VISIBILITY_RENEWAL_INTERVAL,
            max_polling_interval: None,
        }
    }

    /// Move messages that keep failing to this queue
    pub fn poison_queue(mut self, poison_queue: Arc<dyn StorageQueue>) -> Self {
        self.poison_queue = Some(poison_queue);
        self
    }

    /// Wake when the watcher reports a message on this queue, and report
    /// poisoned messages to it
    pub fn watcher(mut self, watcher: Arc<SharedQueueWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn config(mut self, config: QueuesConfig) -> Self {
        self.config = config;
        self
    }

    /// Write a status row after each non-empty poll
    pub fn log_sink(mut self, log_sink: Arc<dyn HostLogSink>) -> Self {
        self.log_sink = Some(log_sink);
        self
    }

    /// Visibility timeout used when fetching and extending messages
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    #[doc(hidden)]
    pub fn minimum_visibility_renewal_interval(mut self, interval: Duration) -> Self {
        self.minimum_visibility_renewal_interval = interval;
        self
    }

    /// Lower the polling backoff ceiling below the processor's
    pub fn max_polling_interval(mut self, interval: Duration) -> Self {
        self.max_polling_interval = Some(interval);
        self
    }

    /// Validate the configuration and create the listener.
    ///
    /// # Errors
    ///
    /// [`JobHostError::Configuration`] when the configuration or the
    /// processor it produces is out of range.
    pub fn build(self) -> JobHostResult<QueueListener> {
        self.config.validate()?;

        if self.visibility_timeout.is_zero() {
            return Err(ConfigurationError::out_of_range(
                "visibility_timeout",
                "must be greater than zero",
            )
            .into());
        }

        let poison_watcher = self
            .watcher
            .clone()
            .map(|w| w as Arc<dyn MessageEnqueuedWatcher>);
        let context = QueueProcessorContext {
            queue: Arc::clone(&self.queue),
            poison_queue: self.poison_queue.clone(),
            config: self.config.clone(),
            poison_watcher,
        };
        let processor = match &self.config.processor_factory {
            Some(factory) => factory.create(context),
            None => DefaultQueueProcessorFactory.create(context),
        };

        if processor.batch_size() == 0 {
            return Err(invalid("BatchSize must be greater than zero."));
        }
        if processor.max_dequeue_count() == 0 {
            return Err(invalid("MaxDequeueCount must be greater than zero."));
        }

        let max_polling_interval = match self.max_polling_interval {
            Some(limit) => limit.min(processor.max_polling_interval()),
            None => processor.max_polling_interval(),
        };
        let delay_strategy = RandomizedExponentialBackoffStrategy::new(
            MINIMUM_POLLING_INTERVAL,
            max_polling_interval,
        )?;

        let (in_flight, _) = watch::channel(0usize);
        let core = Arc::new(QueueListenerCore {
            queue: self.queue,
            processor,
            trigger_executor: self.trigger_executor,
            exception_handler: Arc::clone(&self.exception_handler),
            log_sink: self.log_sink,
            visibility_timeout: self.visibility_timeout,
            minimum_visibility_renewal_interval: self.minimum_visibility_renewal_interval,
            in_flight,
            stop_waiting: Notify::new(),
            polling: Mutex::new(PollingState {
                found_message_since_last_delay: false,
                delay_strategy,
            }),
            processing_cancel: Mutex::new(CancellationToken::new()),
            processed: AtomicU64::new(0),
        });

        if let Some(watcher) = &self.watcher {
            let weak: Weak<dyn NotificationCommand> = Arc::downgrade(&core) as _;
            watcher.register(core.queue.name(), weak);
        }

        Ok(QueueListener {
            core,
            exception_handler: self.exception_handler,
            timer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }
}

fn invalid(message: &str) -> JobHostError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
    .into()
}

// ============================================================================
// Listener
// ============================================================================

/// Polls a queue and runs a function for each message
pub struct QueueListener {
    core: Arc<QueueListenerCore>,
    exception_handler: Arc<dyn BackgroundExceptionHandler>,
    timer: Mutex<Option<TaskSeriesTimer>>,
    disposed: AtomicBool,
}

impl QueueListener {
    /// Cut the current backoff short and poll right away
    pub fn notify(&self) {
        self.core.notify();
    }

    /// Messages currently being processed
    pub fn in_flight_count(&self) -> usize {
        *self.core.in_flight.borrow()
    }

    /// Messages processed to completion since the listener was built
    pub fn processed_count(&self) -> u64 {
        self.core.processed.load(Ordering::SeqCst)
    }

    fn timer(&self) -> MutexGuard<'_, Option<TaskSeriesTimer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_disposed(&self) -> JobHostResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(JobHostError::Disposed {
                object: "QueueListener",
            });
        }
        Ok(())
    }

    async fn drain_in_flight(&self, cancel: &CancellationToken) {
        let mut in_flight = self.core.in_flight.subscribe();
        let drained = async move {
            let _ = in_flight.wait_for(|n| *n == 0).await;
        };
        tokio::select! {
            _ = drained => {}
            _ = cancel.cancelled() => {
                warn!(
                    queue = %self.core.queue.name(),
                    in_flight = self.in_flight_count(),
                    "Stop cancelled; abandoning in-flight messages"
                );
                self.core.cancel_processing();
            }
        }
    }
}

#[async_trait]
impl Listener for QueueListener {
    async fn start(&self, _cancel: &CancellationToken) -> JobHostResult<()> {
        self.check_disposed()?;

        let mut timer = self.timer();
        if timer.is_some() {
            return Err(JobHostError::invalid_operation(
                "The listener has already been started.",
            ));
        }

        self.core.reset_processing();
        let series = TaskSeriesTimer::new(
            Arc::new(QueuePollCommand(Arc::clone(&self.core))),
            Arc::clone(&self.exception_handler),
            futures::future::ready(()),
        );
        series.start()?;
        *timer = Some(series);

        info!(queue = %self.core.queue.name(), "Queue listener started");
        Ok(())
    }

    /// Stop polling, then let in-flight messages finish.
    ///
    /// Functions keep their own cancellation token during a graceful stop;
    /// cancelling `cancel` cancels them and stops waiting.
    async fn stop(&self, cancel: &CancellationToken) -> JobHostResult<()> {
        self.check_disposed()?;

        let timer = self.timer().take().ok_or_else(|| {
            JobHostError::invalid_operation("The listener has not been started.")
        })?;
        timer.stop().await?;

        self.drain_in_flight(cancel).await;
        info!(
            queue = %self.core.queue.name(),
            processed = self.processed_count(),
            "Queue listener stopped"
        );
        Ok(())
    }

    fn cancel(&self) {
        if let Some(timer) = self.timer().as_ref() {
            timer.cancel();
        }
        self.core.cancel_processing();
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

// ============================================================================
// Core
// ============================================================================

struct PollingState {
    found_message_since_last_delay: bool,
    delay_strategy: RandomizedExponentialBackoffStrategy,
}

struct QueueListenerCore {
    queue: Arc<dyn StorageQueue>,
    processor: Arc<dyn QueueProcessor>,
    trigger_executor: Arc<dyn TriggerExecutor<QueueMessage>>,
    exception_handler: Arc<dyn BackgroundExceptionHandler>,
    log_sink: Option<Arc<dyn HostLogSink>>,
    visibility_timeout: Duration,
    minimum_visibility_renewal_interval: Duration,
    in_flight: watch::Sender<usize>,
    stop_waiting: Notify,
    polling: Mutex<PollingState>,
    processing_cancel: Mutex<CancellationToken>,
    processed: AtomicU64,
}

impl NotificationCommand for QueueListenerCore {
    /// Wakes a poll that is currently backing off; a notification while
    /// no backoff is pending is dropped.
    fn notify(&self) {
        self.stop_waiting.notify_waiters();
    }
}

impl QueueListenerCore {
    fn polling(&self) -> MutexGuard<'_, PollingState> {
        self.polling.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processing_token(&self) -> CancellationToken {
        self.processing_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    fn cancel_processing(&self) {
        self.processing_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Replace a cancelled processing token before a restart
    fn reset_processing(&self) {
        let mut token = self
            .processing_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    async fn poll(self: &Arc<Self>, cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobHostError::Cancelled),
            fetched = self.queue.get_messages(self.processor.batch_size(), self.visibility_timeout) => fetched,
        };

        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) if e.is_transient_fetch_failure() => {
                debug!(queue = %self.queue.name(), error = %e, "Queue unavailable; backing off");
                return Ok(self.backoff_result());
            }
            Err(e) => return Err(e.into()),
        };

        if messages.is_empty() {
            return Ok(self.backoff_result());
        }

        debug!(queue = %self.queue.name(), count = messages.len(), "Fetched messages");
        self.polling().found_message_since_last_delay = true;
        for message in messages {
            self.spawn_processing(message);
        }
        self.write_log_row();

        let threshold = self.processor.new_batch_threshold() as usize;
        let mut in_flight = self.in_flight.subscribe();
        Ok(TaskSeriesCommandResult::new(async move {
            let _ = in_flight.wait_for(|n| *n <= threshold).await;
        }))
    }

    fn backoff_result(self: &Arc<Self>) -> TaskSeriesCommandResult {
        let delay = {
            let mut polling = self.polling();
            let found = std::mem::take(&mut polling.found_message_since_last_delay);
            polling.delay_strategy.get_next_delay(found)
        };

        let core = Arc::clone(self);
        TaskSeriesCommandResult::new(async move {
            tokio::select! {
                _ = core.stop_waiting.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        })
    }

    fn spawn_processing(self: &Arc<Self>, message: QueueMessage) {
        let guard = InFlightGuard::new(Arc::clone(self));
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.process_message(message).await;
            drop(guard);
        });
    }

    async fn process_message(&self, message: QueueMessage) {
        let cancel = self.processing_token();
        let message_id = message.id.clone();

        match self.try_process_message(message, &cancel).await {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => {
                debug!(queue = %self.queue.name(), message_id = %message_id, "Message processing cancelled");
            }
            Err(e) => {
                warn!(queue = %self.queue.name(), message_id = %message_id, error = %e, "Message processing failed");
                self.exception_handler.on_unhandled_exception(e).await;
            }
        }
    }

    async fn try_process_message(
        &self,
        message: QueueMessage,
        cancel: &CancellationToken,
    ) -> JobHostResult<()> {
        if !self.processor.begin_processing(&message, cancel).await? {
            debug!(queue = %self.queue.name(), message_id = %message.id, "Processor skipped message");
            return Ok(());
        }

        let shared: SharedMessage = Arc::new(Mutex::new(message));
        let timer = self.create_update_message_visibility_timer(&shared)?;
        timer.start()?;

        let executed = self
            .trigger_executor
            .execute(&snapshot(&shared), cancel.clone())
            .await;
        timer.stop().await?;
        let result = executed?;

        self.processor
            .complete_processing(&snapshot(&shared), &result, cancel)
            .await?;
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_update_message_visibility_timer(
        &self,
        message: &SharedMessage,
    ) -> JobHostResult<TaskSeriesTimer> {
        let normal_interval = self.visibility_timeout / 2;
        let minimum_interval = self
            .minimum_visibility_renewal_interval
            .min(normal_interval);
        let strategy = LinearSpeedupStrategy::new(normal_interval, minimum_interval)?;

        let command = Arc::new(UpdateQueueMessageVisibilityCommand::new(
            Arc::clone(&self.queue),
            Arc::clone(message),
            self.visibility_timeout,
            strategy,
        ));

        Ok(TaskSeriesTimer::new(
            command,
            Arc::clone(&self.exception_handler),
            tokio::time::sleep(normal_interval),
        ))
    }

    fn write_log_row(&self) {
        let Some(sink) = self.log_sink.clone() else {
            return;
        };
        let queue = Arc::clone(&self.queue);
        let processed = self.processed.load(Ordering::SeqCst);

        tokio::spawn(async move {
            let depth = queue.approximate_message_count().await.ok();
            let row = LogRow::new(LOG_ROLE, queue.name().as_str())
                .with_queue_depth(depth)
                .with_processed_count(processed);
            if let Err(e) = sink.add(row).await {
                warn!(queue = %queue.name(), error = %e, "Failed to write host status row");
            }
        });
    }
}

/// Counts a message as in flight until dropped
struct InFlightGuard {
    core: Arc<QueueListenerCore>,
}

impl InFlightGuard {
    fn new(core: Arc<QueueListenerCore>) -> Self {
        core.in_flight.send_modify(|n| *n += 1);
        Self { core }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.core.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct QueuePollCommand(Arc<QueueListenerCore>);

#[async_trait]
impl TaskSeriesCommand for QueuePollCommand {
    async fn execute(&self, cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult> {
        self.0.poll(cancel).await
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
