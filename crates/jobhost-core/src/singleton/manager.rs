//! Acquisition, renewal and naming of singleton locks.

use crate::error::{JobHostError, JobHostResult};
use crate::executors::{BindingData, FunctionDescriptor};
use crate::listeners::Listener;
use crate::locks::{DistributedLockManager, HostIdProvider, LockHandle};
use crate::singleton::attribute::{SingletonAttribute, SingletonMode, SingletonScope};
use crate::singleton::binding::{resolve_settings, BindingTemplate, NameResolver};
use crate::singleton::config::SingletonConfig;
use crate::singleton::listener::SingletonListener;
use crate::timers::{
    BackgroundExceptionHandler, DelayStrategy, LinearSpeedupStrategy, TaskSeriesCommand,
    TaskSeriesCommandResult, TaskSeriesTimer,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Floor for the renewal interval after repeated renewal failures
pub const DEFAULT_MINIMUM_LEASE_RENEWAL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Lock handle
// ============================================================================

/// A held singleton lock together with the timer keeping its lease alive
pub struct RenewableLockHandle {
    handle: LockHandle,
    renewal_timer: TaskSeriesTimer,
    lease_lost: CancellationToken,
}

impl RenewableLockHandle {
    pub fn lock_id(&self) -> &str {
        self.handle.lock_id()
    }

    /// The underlying distributed lock handle
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Token cancelled when renewal finds the lease is no longer held.
    ///
    /// Holders that must stay exclusive watch this and stop their work
    /// once it fires.
    pub fn lease_lost(&self) -> CancellationToken {
        self.lease_lost.clone()
    }
}

impl std::fmt::Debug for RenewableLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewableLockHandle")
            .field("handle", &self.handle)
            .finish()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Manages singleton locks on top of a [`DistributedLockManager`].
///
/// Acquired locks are renewed in the background at half their lease
/// period until released. Losing a lease is reported through the
/// background exception handler and cancels the handle's
/// [`lease_lost`](RenewableLockHandle::lease_lost) token.
pub struct SingletonManager {
    lock_manager: Arc<dyn DistributedLockManager>,
    config: SingletonConfig,
    exception_handler: Arc<dyn BackgroundExceptionHandler>,
    host_id_provider: Arc<dyn HostIdProvider>,
    host_id: OnceCell<String>,
    name_resolver: Option<Arc<dyn NameResolver>>,
    minimum_lease_renewal_interval: Duration,
}

impl SingletonManager {
    /// Create a manager.
    ///
    /// # Arguments
    ///
    /// * `lock_manager` - Store of the underlying leases
    /// * `config` - Lock periods and acquisition timing
    /// * `exception_handler` - Receives lease-loss errors from renewal
    /// * `host_id_provider` - Supplies the prefix of every lock id
    pub fn new(
        lock_manager: Arc<dyn DistributedLockManager>,
        config: SingletonConfig,
        exception_handler: Arc<dyn BackgroundExceptionHandler>,
        host_id_provider: Arc<dyn HostIdProvider>,
    ) -> Self {
        Self {
            lock_manager,
            config,
            exception_handler,
            host_id_provider,
            host_id: OnceCell::new(),
            name_resolver: None,
            minimum_lease_renewal_interval: DEFAULT_MINIMUM_LEASE_RENEWAL_INTERVAL,
        }
    }

    /// Resolve `%name%` references in scope ids through `resolver`
    pub fn with_name_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.name_resolver = Some(resolver);
        self
    }

    /// Override the renewal interval floor
    #[doc(hidden)]
    pub fn with_minimum_lease_renewal_interval(mut self, interval: Duration) -> Self {
        self.minimum_lease_renewal_interval = interval;
        self
    }

    pub fn config(&self) -> &SingletonConfig {
        &self.config
    }

    pub(crate) fn exception_handler(&self) -> Arc<dyn BackgroundExceptionHandler> {
        Arc::clone(&self.exception_handler)
    }

    /// Host id, fetched from the provider on first use and cached
    pub async fn host_id(&self) -> JobHostResult<String> {
        self.host_id
            .get_or_try_init(|| self.host_id_provider.get_host_id())
            .await
            .cloned()
    }

    /// Lease period for locks declared by `attribute`
    pub fn get_lock_period(&self, attribute: &SingletonAttribute) -> Duration {
        match attribute.mode {
            SingletonMode::Listener => self.config.listener_lock_period(),
            SingletonMode::Function => self.config.lock_period(),
        }
    }

    fn acquisition_timeout(&self, attribute: &SingletonAttribute) -> Duration {
        attribute
            .lock_acquisition_timeout
            .unwrap_or_else(|| self.config.lock_acquisition_timeout())
    }

    /// Acquire a lock, failing if it cannot be had within the acquisition
    /// timeout.
    ///
    /// # Errors
    ///
    /// [`JobHostError::LockTimeout`] when the timeout elapses, plus any
    /// error from [`try_lock`](Self::try_lock).
    pub async fn lock(
        &self,
        lock_id: &str,
        function_instance_id: &str,
        attribute: &SingletonAttribute,
        cancel: &CancellationToken,
    ) -> JobHostResult<RenewableLockHandle> {
        match self
            .try_lock(lock_id, function_instance_id, attribute, cancel, true)
            .await?
        {
            Some(handle) => Ok(handle),
            None => Err(JobHostError::LockTimeout {
                lock_id: lock_id.to_string(),
                timeout: self.acquisition_timeout(attribute),
            }),
        }
    }

    /// Try to acquire a lock and start renewing it.
    ///
    /// With `retry`, a failed first attempt is repeated every polling
    /// interval until the acquisition timeout elapses.
    ///
    /// # Arguments
    ///
    /// * `lock_id` - Fully formatted lock id
    /// * `function_instance_id` - Recorded as the lock owner
    /// * `attribute` - Supplies the account, mode and timeout override
    /// * `cancel` - Aborts waiting between attempts
    /// * `retry` - Whether to keep trying after the first attempt
    ///
    /// # Returns
    ///
    /// `None` when the lock is held elsewhere.
    pub async fn try_lock(
        &self,
        lock_id: &str,
        function_instance_id: &str,
        attribute: &SingletonAttribute,
        cancel: &CancellationToken,
        retry: bool,
    ) -> JobHostResult<Option<RenewableLockHandle>> {
        let account = attribute.account.as_deref();
        let lock_period = self.get_lock_period(attribute);
        let owner = (!function_instance_id.is_empty()).then_some(function_instance_id);

        let mut handle = self
            .lock_manager
            .try_lock(account, lock_id, owner, None, lock_period, cancel)
            .await?;

        if handle.is_none() && retry {
            let timeout = self.acquisition_timeout(attribute);
            let polling_interval = self.config.lock_acquisition_polling_interval();
            let mut waited = Duration::ZERO;

            while handle.is_none() && waited < timeout {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(JobHostError::Cancelled),
                    _ = tokio::time::sleep(polling_interval) => {}
                }
                waited += polling_interval;

                handle = self
                    .lock_manager
                    .try_lock(account, lock_id, owner, None, lock_period, cancel)
                    .await?;
            }
        }

        let Some(handle) = handle else {
            return Ok(None);
        };

        debug!(lock_id = %lock_id, "Singleton lock acquired ({})", lock_id);

        let lease_lost = CancellationToken::new();
        let renewal_timer =
            self.create_lease_renewal_timer(handle.clone(), lock_period, lease_lost.clone())?;
        renewal_timer.start()?;

        Ok(Some(RenewableLockHandle {
            handle,
            renewal_timer,
            lease_lost,
        }))
    }

    /// Stop renewing a lock and release it
    pub async fn release_lock(
        &self,
        lock: RenewableLockHandle,
        cancel: &CancellationToken,
    ) -> JobHostResult<()> {
        let RenewableLockHandle {
            handle,
            renewal_timer,
            ..
        } = lock;

        renewal_timer.stop().await?;

        let lock_id = handle.lock_id().to_string();
        self.lock_manager.release(handle, cancel).await?;

        debug!(lock_id = %lock_id, "Singleton lock released ({})", lock_id);
        Ok(())
    }

    /// Owner recorded on a lock, or `None` when nobody holds it
    pub async fn get_lock_owner(
        &self,
        attribute: &SingletonAttribute,
        lock_id: &str,
        cancel: &CancellationToken,
    ) -> JobHostResult<Option<String>> {
        self.lock_manager
            .get_lock_owner(attribute.account.as_deref(), lock_id, cancel)
            .await
    }

    fn create_lease_renewal_timer(
        &self,
        handle: LockHandle,
        lease_period: Duration,
        lease_lost: CancellationToken,
    ) -> JobHostResult<TaskSeriesTimer> {
        let normal_interval = lease_period / 2;
        let minimum_interval = self.minimum_lease_renewal_interval.min(normal_interval);
        let strategy = LinearSpeedupStrategy::new(normal_interval, minimum_interval)?;

        let command = Arc::new(RenewLeaseCommand::new(
            Arc::clone(&self.lock_manager),
            handle,
            Box::new(strategy),
            lease_period,
            lease_lost,
        ));

        Ok(TaskSeriesTimer::new(
            command,
            Arc::clone(&self.exception_handler),
            tokio::time::sleep(normal_interval),
        ))
    }

    // ------------------------------------------------------------------------
    // Lock ids
    // ------------------------------------------------------------------------

    /// Format a lock id using this manager's host id
    pub async fn format_lock_id_for_host(
        &self,
        function: Option<&FunctionDescriptor>,
        scope: SingletonScope,
        scope_id: &str,
    ) -> JobHostResult<String> {
        let host_id = self.host_id().await?;
        Self::format_lock_id(function, scope, &host_id, scope_id)
    }

    /// Format a lock id.
    ///
    /// Function scope yields `{host_id}/{function}[.{scope_id}]`; Host
    /// scope yields `{host_id}/{scope_id}`.
    ///
    /// # Errors
    ///
    /// [`JobHostError::InvalidOperation`] when the host id is empty, when
    /// Function scope has no function, or when Host scope has no scope id.
    pub fn format_lock_id(
        function: Option<&FunctionDescriptor>,
        scope: SingletonScope,
        host_id: &str,
        scope_id: &str,
    ) -> JobHostResult<String> {
        if host_id.is_empty() {
            return Err(JobHostError::invalid_operation(
                "A host id is required to format a lock id.",
            ));
        }

        let mut lock_id = String::new();
        match scope {
            SingletonScope::Function => {
                let function = function.ok_or_else(|| {
                    JobHostError::invalid_operation(
                        "A function is required to format a lock id with scope 'Function'.",
                    )
                })?;
                lock_id.push_str(&function.full_name);
            }
            SingletonScope::Host => {
                if scope_id.is_empty() {
                    return Err(JobHostError::invalid_operation(
                        "A ScopeId value must be provided when using scope 'Host'.",
                    ));
                }
            }
        }

        if !scope_id.is_empty() {
            if !lock_id.is_empty() {
                lock_id.push('.');
            }
            lock_id.push_str(scope_id);
        }

        Ok(format!("{}/{}", host_id, lock_id))
    }

    /// Resolve a declared scope id.
    ///
    /// `%name%` settings are resolved first; `{param}` tokens are then
    /// bound from `binding_data` when it is given.
    pub fn get_bound_scope_id(
        &self,
        scope_id: &str,
        binding_data: Option<&BindingData>,
    ) -> JobHostResult<String> {
        let resolved = match &self.name_resolver {
            Some(resolver) => resolve_settings(scope_id, resolver.as_ref())?,
            None => scope_id.to_string(),
        };

        match binding_data {
            Some(data) => Ok(BindingTemplate::parse(&resolved)?.bind(data)?),
            None => Ok(resolved),
        }
    }

    // ------------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------------

    /// The function-mode singleton declared on `function`, if any.
    ///
    /// # Errors
    ///
    /// [`JobHostError::NotSupported`] for a listener singleton on a
    /// non-triggered function or more than one function-mode singleton, and
    /// any validation error.
    pub fn get_function_singleton_or_none(
        function: &FunctionDescriptor,
    ) -> JobHostResult<Option<SingletonAttribute>> {
        if !function.is_triggered
            && function
                .singletons
                .iter()
                .any(|s| s.mode == SingletonMode::Listener)
        {
            return Err(JobHostError::not_supported(
                "SingletonAttribute using mode 'Listener' cannot be applied to non-triggered functions.",
            ));
        }

        let declared: Vec<&SingletonAttribute> = function
            .singletons
            .iter()
            .filter(|s| s.mode == SingletonMode::Function)
            .collect();

        match declared.as_slice() {
            [] => Ok(None),
            [attribute] => {
                Self::validate_singleton_attribute(attribute, SingletonMode::Function)?;
                Ok(Some((*attribute).clone()))
            }
            _ => Err(JobHostError::not_supported(
                "Only one SingletonAttribute using mode 'Function' is allowed.",
            )),
        }
    }

    /// The listener-mode singleton for a function's listener, if any.
    ///
    /// A listener singleton declared on the function wins over one declared
    /// by the listener type.
    pub fn get_listener_singleton_or_none(
        listener_singleton: Option<&SingletonAttribute>,
        function: &FunctionDescriptor,
    ) -> JobHostResult<Option<SingletonAttribute>> {
        let declared: Vec<&SingletonAttribute> = function
            .singletons
            .iter()
            .filter(|s| s.mode == SingletonMode::Listener)
            .collect();

        let attribute = match declared.as_slice() {
            [] => listener_singleton
                .filter(|s| s.mode == SingletonMode::Listener)
                .cloned(),
            [attribute] => Some((*attribute).clone()),
            _ => {
                return Err(JobHostError::not_supported(
                    "Only one SingletonAttribute using mode 'Listener' is allowed.",
                ))
            }
        };

        if let Some(attribute) = &attribute {
            Self::validate_singleton_attribute(attribute, SingletonMode::Listener)?;
        }

        Ok(attribute)
    }

    /// Reject declarations that cannot be honoured in `mode`
    pub fn validate_singleton_attribute(
        attribute: &SingletonAttribute,
        mode: SingletonMode,
    ) -> JobHostResult<()> {
        if attribute.scope == SingletonScope::Host && attribute.scope_id_or_empty().is_empty() {
            return Err(JobHostError::invalid_operation(
                "A ScopeId value must be provided when using scope 'Host'.",
            ));
        }

        if mode == SingletonMode::Listener && attribute.scope == SingletonScope::Host {
            return Err(JobHostError::invalid_operation(
                "Scope 'Host' cannot be used when the mode is set to 'Listener'.",
            ));
        }

        Ok(())
    }

    /// Wrap `inner` so it only runs on the host holding the lock for
    /// `scope_id`
    pub fn create_host_singleton_listener(
        self: &Arc<Self>,
        inner: Arc<dyn Listener>,
        scope_id: impl Into<String>,
    ) -> SingletonListener {
        let attribute = SingletonAttribute::with_scope_id(scope_id)
            .scope(SingletonScope::Host)
            .mode(SingletonMode::Listener);
        SingletonListener::new(None, attribute, Arc::clone(self), inner)
    }
}

// ============================================================================
// Renewal
// ============================================================================

struct RenewalState {
    strategy: Box<dyn DelayStrategy + Send>,
    last_renewal: DateTime<Utc>,
    last_renewal_instant: Instant,
    last_renewal_latency: Duration,
}

/// Renews one lease each time it runs
struct RenewLeaseCommand {
    lock_manager: Arc<dyn DistributedLockManager>,
    handle: LockHandle,
    lease_period: Duration,
    lease_lost: CancellationToken,
    state: Mutex<RenewalState>,
}

impl RenewLeaseCommand {
    fn new(
        lock_manager: Arc<dyn DistributedLockManager>,
        handle: LockHandle,
        strategy: Box<dyn DelayStrategy + Send>,
        lease_period: Duration,
        lease_lost: CancellationToken,
    ) -> Self {
        Self {
            lock_manager,
            handle,
            lease_period,
            lease_lost,
            state: Mutex::new(RenewalState {
                strategy,
                last_renewal: Utc::now(),
                last_renewal_instant: Instant::now(),
                last_renewal_latency: Duration::ZERO,
            }),
        }
    }

    fn next_delay(&self, succeeded: bool) -> Duration {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .strategy
            .get_next_delay(succeeded)
    }

    fn report_lease_lost(&self, reason: &str) {
        self.lease_lost.cancel();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let since_last_renewal = state.last_renewal_instant.elapsed();
        error!(
            lock_id = %self.handle.lock_id(),
            reason = %reason,
            last_renewal = %state.last_renewal.to_rfc3339(),
            ms_since_last_renewal = since_last_renewal.as_millis() as u64,
            last_renewal_latency_ms = state.last_renewal_latency.as_millis() as u64,
            lease_period_ms = self.lease_period.as_millis() as u64,
            "Singleton lock renewal failed for blob '{}'. The last successful renewal completed at {} ({} milliseconds ago) with a duration of {} milliseconds. The lease period was {} milliseconds.",
            self.handle.lock_id(),
            state.last_renewal.to_rfc3339(),
            since_last_renewal.as_millis(),
            state.last_renewal_latency.as_millis(),
            self.lease_period.as_millis()
        );
    }
}

#[async_trait]
impl TaskSeriesCommand for RenewLeaseCommand {
    async fn execute(&self, cancel: CancellationToken) -> JobHostResult<TaskSeriesCommandResult> {
        let request_start = Instant::now();
        let delay = match self.lock_manager.renew(&self.handle, &cancel).await {
            Ok(true) => {
                {
                    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.last_renewal = Utc::now();
                    state.last_renewal_instant = Instant::now();
                    state.last_renewal_latency = request_start.elapsed();
                }
                self.next_delay(true)
            }
            Ok(false) => {
                self.report_lease_lost("lease no longer held");
                return Err(JobHostError::LeaseLost {
                    lock_id: self.handle.lock_id().to_string(),
                });
            }
            Err(e) if e.is_cancellation() => return Err(e),
            Err(JobHostError::Storage(e)) if e.is_server_side() => {
                let delay = self.next_delay(false);
                warn!(
                    lock_id = %self.handle.lock_id(),
                    status = e.status_code(),
                    error_code = %e.error_code(),
                    retry_ms = delay.as_millis() as u64,
                    "Singleton lock renewal failed for blob '{}' with error code {}: {}. Retry renewal in {} milliseconds.",
                    self.handle.lock_id(),
                    e.status_code(),
                    e.error_code(),
                    delay.as_millis()
                );
                delay
            }
            Err(e) => {
                self.report_lease_lost(&e.to_string());
                return Err(e);
            }
        };

        Ok(TaskSeriesCommandResult::delay(delay))
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
