//! Tests for the singleton manager.

use super::*;
use crate::locks::{MockHostIdProvider, HOSTS_CONTAINER_NAME};
use crate::singleton::binding::MapNameResolver;
use crate::test_support::{settle, singleton_manager};
use jobhost_storage::{FaultPoint, InMemoryStorageAccount, StorageError, DEFAULT_STORAGE_ACCOUNT};
use std::collections::HashMap;

const HOST_ID: &str = "testhost";

fn account() -> InMemoryStorageAccount {
    InMemoryStorageAccount::new(DEFAULT_STORAGE_ACCOUNT)
}

fn fast_config() -> SingletonConfig {
    SingletonConfig::unchecked(
        Duration::from_secs(15),
        Duration::from_secs(60),
        Duration::from_secs(3),
        Duration::from_secs(1),
        Some(Duration::from_secs(15)),
    )
}

fn function() -> FunctionDescriptor {
    FunctionDescriptor::new("Jobs.Functions.Process")
}

mod lock_ids {
    use super::*;

    /// Verify function scope ids with and without a scope id.
    #[test]
    fn test_function_scope() {
        let f = function();

        assert_eq!(
            SingletonManager::format_lock_id(Some(&f), SingletonScope::Function, "host", "")
                .unwrap(),
            "host/Jobs.Functions.Process"
        );
        assert_eq!(
            SingletonManager::format_lock_id(Some(&f), SingletonScope::Function, "host", "eu")
                .unwrap(),
            "host/Jobs.Functions.Process.eu"
        );
    }

    /// Verify host scope ids use only the scope id.
    #[test]
    fn test_host_scope() {
        assert_eq!(
            SingletonManager::format_lock_id(None, SingletonScope::Host, "host", "shared")
                .unwrap(),
            "host/shared"
        );
    }

    /// Verify that missing pieces are rejected.
    #[test]
    fn test_invalid_inputs() {
        let f = function();

        assert!(SingletonManager::format_lock_id(Some(&f), SingletonScope::Function, "", "")
            .is_err());
        assert!(SingletonManager::format_lock_id(None, SingletonScope::Function, "h", "").is_err());
        assert!(SingletonManager::format_lock_id(None, SingletonScope::Host, "h", "").is_err());
    }

    /// Verify that the host id comes from the provider once.
    #[tokio::test]
    async fn test_host_id_is_cached() {
        let mut provider = MockHostIdProvider::new();
        provider
            .expect_get_host_id()
            .times(1)
            .returning(|| Ok("cachedhost".to_string()));

        let account = account();
        let (reference, _) = singleton_manager(&account, HOST_ID, fast_config());
        let manager = SingletonManager::new(
            Arc::clone(&reference.lock_manager),
            fast_config(),
            Arc::clone(&reference.exception_handler),
            Arc::new(provider),
        );

        assert_eq!(manager.host_id().await.unwrap(), "cachedhost");
        assert_eq!(manager.host_id().await.unwrap(), "cachedhost");
        assert_eq!(
            manager
                .format_lock_id_for_host(Some(&function()), SingletonScope::Function, "")
                .await
                .unwrap(),
            "cachedhost/Jobs.Functions.Process"
        );
    }

    /// Verify that settings resolve before parameters are bound.
    #[test]
    fn test_bound_scope_id() {
        let account = account();
        let (manager, _) = singleton_manager(&account, HOST_ID, fast_config());
        let manager = Arc::try_unwrap(manager)
            .ok()
            .unwrap()
            .with_name_resolver(Arc::new(MapNameResolver::new(HashMap::from([(
                "Region".to_string(),
                "westus".to_string(),
            )]))));

        let data = BindingData::from([("Id".to_string(), "42".to_string())]);

        assert_eq!(
            manager
                .get_bound_scope_id("%Region%/{Id}", Some(&data))
                .unwrap(),
            "westus/42"
        );
        assert_eq!(
            manager.get_bound_scope_id("%Region%/{Id}", None).unwrap(),
            "westus/{Id}"
        );
        assert!(matches!(
            manager.get_bound_scope_id("{Missing}", Some(&data)),
            Err(JobHostError::Binding(_))
        ));
    }
}

mod declarations {
    use super::*;

    /// Verify that a single function singleton is returned.
    #[test]
    fn test_function_singleton() {
        let f = function().with_singleton(SingletonAttribute::with_scope_id("{Id}"));

        let attribute = SingletonManager::get_function_singleton_or_none(&f)
            .unwrap()
            .unwrap();
        assert_eq!(attribute.scope_id.as_deref(), Some("{Id}"));

        assert!(SingletonManager::get_function_singleton_or_none(&function())
            .unwrap()
            .is_none());
    }

    /// Verify that two function singletons are rejected.
    #[test]
    fn test_two_function_singletons() {
        let f = function()
            .with_singleton(SingletonAttribute::new())
            .with_singleton(SingletonAttribute::new());

        let error = SingletonManager::get_function_singleton_or_none(&f).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Only one SingletonAttribute using mode 'Function' is allowed."
        );
    }

    /// Verify that listener singletons need a triggered function.
    #[test]
    fn test_listener_on_non_triggered() {
        let f = function()
            .triggered(false)
            .with_singleton(SingletonAttribute::listener());

        let error = SingletonManager::get_function_singleton_or_none(&f).unwrap_err();
        assert_eq!(
            error.to_string(),
            "SingletonAttribute using mode 'Listener' cannot be applied to non-triggered functions."
        );
    }

    /// Verify that a function-level listener singleton overrides the listener's.
    #[test]
    fn test_listener_singleton_override() {
        let listener_default = SingletonAttribute::listener().account("other");
        let method_level = SingletonAttribute::listener();
        let f = function().with_singleton(method_level.clone());

        assert_eq!(
            SingletonManager::get_listener_singleton_or_none(Some(&listener_default), &f)
                .unwrap(),
            Some(method_level)
        );
        assert_eq!(
            SingletonManager::get_listener_singleton_or_none(Some(&listener_default), &function())
                .unwrap(),
            Some(listener_default)
        );
        assert_eq!(
            SingletonManager::get_listener_singleton_or_none(None, &function()).unwrap(),
            None
        );
    }

    /// Verify that two listener singletons are rejected.
    #[test]
    fn test_two_listener_singletons() {
        let f = function()
            .with_singleton(SingletonAttribute::listener())
            .with_singleton(SingletonAttribute::listener());

        assert!(matches!(
            SingletonManager::get_listener_singleton_or_none(None, &f),
            Err(JobHostError::NotSupported { .. })
        ));
    }

    /// Verify the host scope validation rules.
    #[test]
    fn test_validate_host_scope() {
        let no_scope_id = SingletonAttribute::new().scope(SingletonScope::Host);
        let error =
            SingletonManager::validate_singleton_attribute(&no_scope_id, SingletonMode::Function)
                .unwrap_err();
        assert_eq!(
            error.to_string(),
            "A ScopeId value must be provided when using scope 'Host'."
        );

        let host_listener = SingletonAttribute::with_scope_id("x").scope(SingletonScope::Host);
        let error =
            SingletonManager::validate_singleton_attribute(&host_listener, SingletonMode::Listener)
                .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Scope 'Host' cannot be used when the mode is set to 'Listener'."
        );

        assert!(SingletonManager::validate_singleton_attribute(
            &host_listener,
            SingletonMode::Function
        )
        .is_ok());
    }

    /// Verify lock periods by mode.
    #[test]
    fn test_lock_period_by_mode() {
        let account = account();
        let (manager, _) = singleton_manager(&account, HOST_ID, SingletonConfig::default());

        assert_eq!(
            manager.get_lock_period(&SingletonAttribute::new()),
            Duration::from_secs(15)
        );
        assert_eq!(
            manager.get_lock_period(&SingletonAttribute::listener()),
            Duration::from_secs(60)
        );
    }
}

mod locking {
    use super::*;

    /// Verify that a held lock is renewed past its lease period.
    #[tokio::test(start_paused = true)]
    async fn test_lock_is_renewed() {
        let account = account();
        let (first, handler) = singleton_manager(&account, HOST_ID, fast_config());
        let (second, _) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();
        let attribute = SingletonAttribute::new();

        let handle = first
            .try_lock("testhost/lock", "instance-1", &attribute, &cancel, false)
            .await
            .unwrap()
            .expect("lock should be acquired");

        tokio::time::sleep(Duration::from_secs(45)).await;

        let contender = second
            .try_lock("testhost/lock", "instance-2", &attribute, &cancel, false)
            .await
            .unwrap();
        assert!(contender.is_none());
        assert_eq!(
            first
                .get_lock_owner(&attribute, "testhost/lock", &cancel)
                .await
                .unwrap()
                .as_deref(),
            Some("instance-1")
        );

        first.release_lock(handle, &cancel).await.unwrap();
        assert!(handler.errors().is_empty());
    }

    /// Verify that blocking acquisition times out with the documented message.
    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out() {
        let account = account();
        let (holder, _) = singleton_manager(&account, HOST_ID, fast_config());
        let (waiter, _) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();
        let attribute = SingletonAttribute::new();

        let _held = holder
            .lock("testhost/lock", "holder", &attribute, &cancel)
            .await
            .unwrap();

        let started = Instant::now();
        let error = waiter
            .lock("testhost/lock", "waiter", &attribute, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(error, JobHostError::LockTimeout { .. }));
        assert_eq!(
            error.to_string(),
            "Unable to acquire singleton lock blob lease for blob 'testhost/lock' (timeout of 3s exceeded)."
        );
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    /// Verify that the attribute timeout overrides the configured one.
    #[tokio::test(start_paused = true)]
    async fn test_attribute_timeout_override() {
        let account = account();
        let (holder, _) = singleton_manager(&account, HOST_ID, fast_config());
        let (waiter, _) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();

        let _held = holder
            .lock("testhost/lock", "holder", &SingletonAttribute::new(), &cancel)
            .await
            .unwrap();

        let started = Instant::now();
        let attribute = SingletonAttribute::new().lock_acquisition_timeout(Duration::from_secs(1));
        let result = waiter
            .try_lock("testhost/lock", "waiter", &attribute, &cancel, true)
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    /// Verify that a waiting caller gets the lock once it is released.
    #[tokio::test(start_paused = true)]
    async fn test_retry_acquires_after_release() {
        let account = account();
        let (holder, _) = singleton_manager(&account, HOST_ID, fast_config());
        let (waiter, _) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();
        let attribute = SingletonAttribute::new();

        let held = holder
            .lock("testhost/lock", "holder", &attribute, &cancel)
            .await
            .unwrap();

        let waiting = {
            let waiter = Arc::clone(&waiter);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                waiter
                    .try_lock("testhost/lock", "waiter", &SingletonAttribute::new(), &cancel, true)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        holder.release_lock(held, &cancel).await.unwrap();

        let acquired = waiting.await.unwrap().unwrap();
        assert!(acquired.is_some());
        assert_eq!(
            waiter
                .get_lock_owner(&attribute, "testhost/lock", &cancel)
                .await
                .unwrap()
                .as_deref(),
            Some("waiter")
        );
    }

    /// Verify that waiting for a lock observes cancellation.
    #[tokio::test(start_paused = true)]
    async fn test_retry_is_cancellable() {
        let account = account();
        let (holder, _) = singleton_manager(&account, HOST_ID, fast_config());
        let (waiter, _) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();
        let attribute = SingletonAttribute::new();

        let _held = holder
            .lock("testhost/lock", "holder", &attribute, &cancel)
            .await
            .unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiting = {
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move {
                waiter
                    .try_lock("testhost/lock", "waiter", &SingletonAttribute::new(), &waiter_cancel, true)
                    .await
            })
        };

        settle().await;
        waiter_cancel.cancel();

        assert!(matches!(
            waiting.await.unwrap(),
            Err(JobHostError::Cancelled)
        ));
    }

    /// Verify that a released lock has no owner.
    #[tokio::test(start_paused = true)]
    async fn test_release_clears_owner() {
        let account = account();
        let (manager, _) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();
        let attribute = SingletonAttribute::new();

        let handle = manager
            .lock("testhost/lock", "owner", &attribute, &cancel)
            .await
            .unwrap();
        assert_eq!(handle.lock_id(), "testhost/lock");

        manager.release_lock(handle, &cancel).await.unwrap();

        assert_eq!(
            manager
                .get_lock_owner(&attribute, "testhost/lock", &cancel)
                .await
                .unwrap(),
            None
        );
    }
}

mod renewal {
    use super::*;

    /// Verify that a broken lease is reported as lost.
    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_is_reported() {
        let account = account();
        let (manager, handler) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();

        let handle = manager
            .lock("testhost/lock", "owner", &SingletonAttribute::new(), &cancel)
            .await
            .unwrap();
        let lease_lost = handle.lease_lost();

        assert!(account.break_lease(HOSTS_CONTAINER_NAME, "locks/testhost/lock"));

        tokio::time::sleep(Duration::from_secs(8)).await;

        let errors = handler.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("testhost/lock"));
        assert!(lease_lost.is_cancelled());
    }

    /// Verify that a released lock never signals lease loss.
    #[tokio::test(start_paused = true)]
    async fn test_release_does_not_signal_lease_lost() {
        let account = account();
        let (manager, handler) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();

        let handle = manager
            .lock("testhost/lock", "owner", &SingletonAttribute::new(), &cancel)
            .await
            .unwrap();
        let lease_lost = handle.lease_lost();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!lease_lost.is_cancelled());

        manager.release_lock(handle, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(!lease_lost.is_cancelled());
        assert!(handler.errors().is_empty());
    }

    /// Verify that a server error is retried sooner without losing the lock.
    #[tokio::test(start_paused = true)]
    async fn test_server_error_retries_sooner() {
        let account = account();
        let (manager, handler) = singleton_manager(&account, HOST_ID, fast_config());
        let (contender, _) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();
        let attribute = SingletonAttribute::new();

        let _handle = manager
            .lock("testhost/lock", "owner", &attribute, &cancel)
            .await
            .unwrap();

        account.inject_faults(
            FaultPoint::RenewLease,
            StorageError::ServerError {
                status: 503,
                message: "busy".to_string(),
            },
            2,
        );

        // First renewal at 7.5s fails, retries at 3.75s and 1.875s intervals
        tokio::time::sleep(Duration::from_secs(14)).await;

        let stolen = contender
            .try_lock("testhost/lock", "contender", &attribute, &cancel, false)
            .await
            .unwrap();
        assert!(stolen.is_none());
        assert!(handler.errors().is_empty());
    }

    /// Verify that a non-transient renewal error is reported.
    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_reported() {
        let account = account();
        let (manager, handler) = singleton_manager(&account, HOST_ID, fast_config());
        let cancel = CancellationToken::new();

        let _handle = manager
            .lock("testhost/lock", "owner", &SingletonAttribute::new(), &cancel)
            .await
            .unwrap();

        account.inject_fault(
            FaultPoint::RenewLease,
            StorageError::ServerError {
                status: 403,
                message: "forbidden".to_string(),
            },
        );

        tokio::time::sleep(Duration::from_secs(8)).await;

        assert_eq!(handler.errors().len(), 1);
    }
}
