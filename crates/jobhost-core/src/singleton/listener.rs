//! Listener decorator that only runs its inner listener while holding a
//! singleton lock.

use crate::error::{JobHostError, JobHostResult};
use crate::executors::FunctionDescriptor;
use crate::listeners::Listener;
use crate::singleton::attribute::SingletonAttribute;
use crate::singleton::manager::{RenewableLockHandle, SingletonManager};
use crate::timers::{
    DelayStrategy, FixedDelayStrategy, TaskSeriesCommand, TaskSeriesCommandResult,
    TaskSeriesTimer,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Suffix distinguishing listener locks from function locks
pub const LISTENER_LOCK_SUFFIX: &str = ".Listener";

/// The listener lock plus the guard ending its lease watch
struct HeldLock {
    lock: RenewableLockHandle,
    _watch: DropGuard,
}

#[derive(Default)]
struct ListenerState {
    lock: Option<HeldLock>,
    is_listening: bool,
    started: bool,
    stopped: bool,
    disposed: bool,
}

struct ListenerCore {
    function: Option<Arc<FunctionDescriptor>>,
    attribute: SingletonAttribute,
    manager: Arc<SingletonManager>,
    inner: Arc<dyn Listener>,
    lock_id: OnceCell<String>,
    state: tokio::sync::Mutex<ListenerState>,
    recovery_timer: Mutex<Option<TaskSeriesTimer>>,
}

impl ListenerCore {
    async fn lock_id(&self) -> JobHostResult<String> {
        self.lock_id
            .get_or_try_init(|| async {
                let scope_id = self
                    .manager
                    .get_bound_scope_id(self.attribute.scope_id_or_empty(), None)?;
                let base = self
                    .manager
                    .format_lock_id_for_host(
                        self.function.as_deref(),
                        self.attribute.scope,
                        &scope_id,
                    )
                    .await?;
                Ok::<_, JobHostError>(format!("{}{}", base, LISTENER_LOCK_SUFFIX))
            })
            .await
            .cloned()
    }

    /// Try once for the lock and start the inner listener if acquired.
    ///
    /// Returns whether the inner listener is now running.
    async fn try_start_listening(
        self: &Arc<Self>,
        state: &mut ListenerState,
        cancel: &CancellationToken,
        retry: bool,
    ) -> JobHostResult<bool> {
        let lock_id = self.lock_id().await?;
        let Some(lock) = self
            .manager
            .try_lock(&lock_id, "", &self.attribute, cancel, retry)
            .await?
        else {
            return Ok(false);
        };

        if let Err(e) = self.inner.start(cancel).await {
            self.manager.release_lock(lock, cancel).await?;
            return Err(e);
        }

        let released = CancellationToken::new();
        self.watch_lease(lock.lease_lost(), released.clone());
        state.lock = Some(HeldLock {
            lock,
            _watch: released.drop_guard(),
        });
        state.is_listening = true;
        Ok(true)
    }

    /// Stop listening if the lease is lost before `released` fires
    fn watch_lease(self: &Arc<Self>, lease_lost: CancellationToken, released: CancellationToken) {
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = released.cancelled() => return,
                _ = lease_lost.cancelled() => {}
            }
            if let Some(core) = core.upgrade() {
                core.on_lease_lost(&released).await;
            }
        });
    }

    async fn on_lease_lost(self: &Arc<Self>, released: &CancellationToken) {
        let mut state = self.state.lock().await;
        if released.is_cancelled() || state.stopped || state.disposed {
            return;
        }

        let lock_id = self.lock_id().await.unwrap_or_default();
        warn!(lock_id = %lock_id, "Singleton lock lease lost ({}). Stopping listener.", lock_id);

        // The renewal series has already ended; there is nothing to release.
        state.lock = None;
        if state.is_listening {
            state.is_listening = false;
            self.inner.cancel();
            let abandon = CancellationToken::new();
            abandon.cancel();
            if let Err(e) = self.inner.stop(&abandon).await {
                warn!(lock_id = %lock_id, error = %e, "Inner listener did not stop cleanly");
            }
        }
        drop(state);

        if let Some(interval) = self.manager.config().listener_lock_recovery_polling_interval() {
            if let Err(e) = self.start_recovery_timer(interval) {
                warn!(lock_id = %lock_id, error = %e, "Unable to restart singleton lock recovery");
            }
        }
    }

    fn recovery_timer(&self) -> std::sync::MutexGuard<'_, Option<TaskSeriesTimer>> {
        self.recovery_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn start_recovery_timer(self: &Arc<Self>, interval: Duration) -> JobHostResult<()> {
        let command = Arc::new(LockRecoveryCommand {
            core: Arc::downgrade(self),
            strategy: Mutex::new(FixedDelayStrategy::new(interval)),
        });
        let timer = TaskSeriesTimer::new(
            command,
            self.manager.exception_handler(),
            tokio::time::sleep(interval),
        );
        timer.start()?;

        *self.recovery_timer() = Some(timer);
        Ok(())
    }
}

/// Runs the inner listener only on the host holding the listener lock.
///
/// When the lock is held elsewhere at startup and recovery is enabled, a
/// recovery timer keeps trying for it in the background and starts the
/// inner listener once it is acquired. If the lease is later lost, the
/// inner listener is stopped and recovery starts over.
pub struct SingletonListener {
    core: Arc<ListenerCore>,
}

impl SingletonListener {
    /// Wrap `inner`.
    ///
    /// # Arguments
    ///
    /// * `function` - Function whose listener this is; `None` for host-scoped listeners
    /// * `attribute` - Listener-mode singleton declaration
    /// * `manager` - Acquires and renews the lock
    /// * `inner` - Listener to run while the lock is held
    pub fn new(
        function: Option<Arc<FunctionDescriptor>>,
        attribute: SingletonAttribute,
        manager: Arc<SingletonManager>,
        inner: Arc<dyn Listener>,
    ) -> Self {
        Self {
            core: Arc::new(ListenerCore {
                function,
                attribute,
                manager,
                inner,
                lock_id: OnceCell::new(),
                state: tokio::sync::Mutex::new(ListenerState::default()),
                recovery_timer: Mutex::new(None),
            }),
        }
    }

    /// Lock id guarding the inner listener
    pub async fn lock_id(&self) -> JobHostResult<String> {
        self.core.lock_id().await
    }

    /// Check if the inner listener is running on this host
    pub async fn is_listening(&self) -> bool {
        self.core.state.lock().await.is_listening
    }

    /// Check if a recovery timer was started
    pub fn is_recovering(&self) -> bool {
        self.core.recovery_timer().is_some()
    }
}

#[async_trait]
impl Listener for SingletonListener {
    async fn start(&self, cancel: &CancellationToken) -> JobHostResult<()> {
        let recovery_interval = self
            .core
            .manager
            .config()
            .listener_lock_recovery_polling_interval();

        let mut state = self.core.state.lock().await;
        if state.disposed {
            return Err(JobHostError::Disposed {
                object: "SingletonListener",
            });
        }

        if state.started {
            return Err(JobHostError::invalid_operation(
                "The listener has already been started.",
            ));
        }
        state.started = true;

        let lock_id = self.core.lock_id().await?;
        if self
            .core
            .try_start_listening(&mut state, cancel, recovery_interval.is_none())
            .await?
        {
            info!(lock_id = %lock_id, "Singleton listener started");
            return Ok(());
        }

        match recovery_interval {
            Some(interval) => {
                info!(
                    lock_id = %lock_id,
                    retry_secs = interval.as_secs(),
                    "Unable to acquire Singleton lock ({}). Will retry in {:?}.",
                    lock_id,
                    interval
                );
                self.core.start_recovery_timer(interval)?;
            }
            None => {
                info!(
                    lock_id = %lock_id,
                    "Unable to acquire Singleton lock ({}). Listener will not be started.",
                    lock_id
                );
            }
        }

        Ok(())
    }

    /// Stop recovery, release the lock and stop the inner listener.
    ///
    /// The inner listener is stopped even when releasing the lock fails;
    /// the first error is returned.
    async fn stop(&self, cancel: &CancellationToken) -> JobHostResult<()> {
        self.core.state.lock().await.stopped = true;

        let recovery = self.core.recovery_timer().take();
        if let Some(timer) = recovery {
            timer.stop().await?;
        }

        let mut state = self.core.state.lock().await;
        let released = match state.lock.take() {
            Some(held) => self.core.manager.release_lock(held.lock, cancel).await,
            None => Ok(()),
        };

        let stopped = if state.is_listening {
            state.is_listening = false;
            self.core.inner.stop(cancel).await
        } else {
            Ok(())
        };

        released.and(stopped)
    }

    fn cancel(&self) {
        if let Some(timer) = self.core.recovery_timer().as_ref() {
            timer.cancel();
        }

        self.core.inner.cancel();
    }

    async fn dispose(&self) {
        let recovery = self.core.recovery_timer().take();
        if let Some(timer) = recovery {
            timer.dispose().await;
        }

        let mut state = self.core.state.lock().await;
        if state.disposed {
            return;
        }
        state.disposed = true;

        if let Some(held) = state.lock.take() {
            let lock_id = held.lock.lock_id().to_string();
            if let Err(e) = self
                .core
                .manager
                .release_lock(held.lock, &CancellationToken::new())
                .await
            {
                warn!(lock_id = %lock_id, error = %e, "Failed to release singleton listener lock");
            }
        }

        state.is_listening = false;
        self.core.inner.dispose().await;
    }
}

/// Retries the listener lock until acquired, then starts the inner listener
struct LockRecoveryCommand {
    core: Weak<ListenerCore>,
    strategy: Mutex<FixedDelayStrategy>,
}

impl LockRecoveryCommand {
    fn next_delay(&self, succeeded: bool) -> Duration {
        self.strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_next_delay(succeeded)
    }
}

#[async_trait]
impl TaskSeriesCommand for LockRecoveryCommand {
    async fn execute(&self, cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult> {
        let Some(core) = self.core.upgrade() else {
            return Ok(TaskSeriesCommandResult::completed());
        };

        let mut state = core.state.lock().await;
        if state.is_listening || state.stopped || state.disposed {
            return Ok(TaskSeriesCommandResult::completed());
        }

        let lock_id = core.lock_id().await?;
        match core.try_start_listening(&mut state, &cancel, false).await {
            Ok(true) => {
                info!(lock_id = %lock_id, "Singleton lock acquired ({}). Listener started.", lock_id);
                Ok(TaskSeriesCommandResult::completed())
            }
            Ok(false) => {
                debug!(lock_id = %lock_id, "Singleton listener lock still held elsewhere");
                Ok(TaskSeriesCommandResult::delay(self.next_delay(false)))
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                warn!(lock_id = %lock_id, error = %e, "Singleton listener lock recovery attempt failed");
                Ok(TaskSeriesCommandResult::delay(self.next_delay(false)))
            }
        }
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
