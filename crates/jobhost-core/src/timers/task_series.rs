//! Serial, self-rescheduling background loop.
//!
//! A [`TaskSeriesTimer`] runs a [`TaskSeriesCommand`] over and over: it waits
//! an initial wait, executes the command, waits whatever the command
//! returned, and executes again. Executions never overlap. Every polling
//! loop and renewal loop in the runtime is one of these.

use crate::error::{JobHostError, JobHostResult};
use crate::timers::exceptions::BackgroundExceptionHandler;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Future the timer awaits between executions
pub type WaitFuture = BoxFuture<'static, ()>;

/// Outcome of one command execution: what to wait for before the next one
pub struct TaskSeriesCommandResult {
    wait: Option<WaitFuture>,
}

impl TaskSeriesCommandResult {
    /// Wait for `wait` before executing again
    pub fn new<F>(wait: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            wait: Some(wait.boxed()),
        }
    }

    /// Wait a fixed duration before executing again
    pub fn delay(duration: Duration) -> Self {
        Self::new(tokio::time::sleep(duration))
    }

    /// Execute again right away
    pub fn immediate() -> Self {
        Self::new(future::ready(()))
    }

    /// End the series; the command will not be executed again
    pub fn completed() -> Self {
        Self { wait: None }
    }

    /// Check if this result ends the series
    pub fn is_completed(&self) -> bool {
        self.wait.is_none()
    }

    /// Take the wait future, if the series continues
    pub fn into_wait(self) -> Option<WaitFuture> {
        self.wait
    }
}

impl std::fmt::Debug for TaskSeriesCommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSeriesCommandResult")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// One step of a task series.
///
/// The cancellation token is cancelled when the owning timer is cancelled,
/// stopped or disposed; long-running commands should observe it.
#[async_trait]
pub trait TaskSeriesCommand: Send + Sync {
    async fn execute(&self, cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult>;
}

#[derive(Default)]
struct TimerState {
    started: bool,
    stopped: bool,
    disposed: bool,
    initial_wait: Option<WaitFuture>,
    run: Option<JoinHandle<()>>,
}

/// Runs a command in a serial loop on a background task.
///
/// Errors returned by the command, other than cancellation, are handed to
/// the background exception handler and end the series. A command
/// reporting cancellation while the timer is still running is executed
/// again.
pub struct TaskSeriesTimer {
    command: Arc<dyn TaskSeriesCommand>,
    exception_handler: Arc<dyn BackgroundExceptionHandler>,
    cancellation: CancellationToken,
    state: Mutex<TimerState>,
}

impl TaskSeriesTimer {
    /// Create a timer that waits `initial_wait` before the first execution.
    ///
    /// # Arguments
    ///
    /// * `command` - The command executed on each iteration
    /// * `exception_handler` - Receives errors returned by the command
    /// * `initial_wait` - Future awaited once after [`start`](Self::start)
    pub fn new<F>(
        command: Arc<dyn TaskSeriesCommand>,
        exception_handler: Arc<dyn BackgroundExceptionHandler>,
        initial_wait: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            command,
            exception_handler,
            cancellation: CancellationToken::new(),
            state: Mutex::new(TimerState {
                initial_wait: Some(initial_wait.boxed()),
                ..TimerState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the series on a background task.
    ///
    /// # Errors
    ///
    /// - [`JobHostError::Disposed`] if the timer was disposed
    /// - [`JobHostError::InvalidOperation`] if the timer was already started
    pub fn start(&self) -> JobHostResult<()> {
        let mut state = self.state();
        if state.disposed {
            return Err(JobHostError::Disposed {
                object: "TaskSeriesTimer",
            });
        }

        if state.started {
            return Err(JobHostError::invalid_operation(
                "The timer has already been started; it cannot be restarted.",
            ));
        }

        let initial_wait = state
            .initial_wait
            .take()
            .unwrap_or_else(|| future::ready(()).boxed());

        state.run = Some(tokio::spawn(run_series(
            Arc::clone(&self.command),
            Arc::clone(&self.exception_handler),
            initial_wait,
            self.cancellation.clone(),
        )));
        state.started = true;
        Ok(())
    }

    /// Signal the series to end without waiting for it
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Check if the timer has been started
    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Stop the series: abandon any pending wait, cancel the command's
    /// token and wait for a running execution to return.
    ///
    /// # Errors
    ///
    /// - [`JobHostError::Disposed`] if the timer was disposed
    /// - [`JobHostError::InvalidOperation`] if the timer was never started or
    ///   was already stopped
    pub async fn stop(&self) -> JobHostResult<()> {
        let run = {
            let mut state = self.state();
            if state.disposed {
                return Err(JobHostError::Disposed {
                    object: "TaskSeriesTimer",
                });
            }

            if !state.started {
                return Err(JobHostError::invalid_operation(
                    "The timer has not yet been started.",
                ));
            }

            if state.stopped {
                return Err(JobHostError::invalid_operation(
                    "The timer has already been stopped.",
                ));
            }

            state.stopped = true;
            state.run.take()
        };

        self.cancellation.cancel();
        if let Some(run) = run {
            join_series(run).await;
        }

        Ok(())
    }

    /// Release the timer, draining a running series like [`stop`](Self::stop).
    ///
    /// Disposing twice is a no-op.
    pub async fn dispose(&self) {
        let run = {
            let mut state = self.state();
            if state.disposed {
                return;
            }

            state.disposed = true;
            if state.started && !state.stopped {
                state.run.take()
            } else {
                None
            }
        };

        self.cancellation.cancel();
        if let Some(run) = run {
            join_series(run).await;
        }
    }
}

impl Drop for TaskSeriesTimer {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn join_series(run: JoinHandle<()>) {
    if let Err(join_error) = run.await {
        if join_error.is_panic() {
            error!(error = %join_error, "Task series panicked");
        }
    }
}

async fn run_series(
    command: Arc<dyn TaskSeriesCommand>,
    exception_handler: Arc<dyn BackgroundExceptionHandler>,
    initial_wait: WaitFuture,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = initial_wait => {}
    }

    while !cancel.is_cancelled() {
        let wait = match command.execute(cancel.clone()).await {
            Ok(result) => match result.into_wait() {
                Some(wait) => wait,
                None => {
                    debug!("Task series completed");
                    return;
                }
            },
            Err(e) if e.is_cancellation() => {
                tokio::task::yield_now().boxed()
            }
            Err(e) => {
                exception_handler.on_unhandled_exception(e).await;
                return;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = wait => {}
        }
    }
}

#[cfg(test)]
#[path = "task_series_tests.rs"]
mod tests;
