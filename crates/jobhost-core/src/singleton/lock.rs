//! Function-mode singleton locks held around each invocation.

use crate::error::{JobHostError, JobHostResult};
use crate::executors::{DelayedException, FunctionExecutor, FunctionInstance};
use crate::singleton::attribute::SingletonAttribute;
use crate::singleton::manager::{RenewableLockHandle, SingletonManager};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One named singleton lock owned by one function instance
pub struct SingletonLock {
    id: String,
    function_instance_id: String,
    attribute: SingletonAttribute,
    manager: Arc<SingletonManager>,
    handle: Mutex<Option<RenewableLockHandle>>,
}

impl SingletonLock {
    pub fn new(
        id: impl Into<String>,
        function_instance_id: impl Into<String>,
        attribute: SingletonAttribute,
        manager: Arc<SingletonManager>,
    ) -> Self {
        Self {
            id: id.into(),
            function_instance_id: function_instance_id.into(),
            attribute,
            manager,
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn function_instance_id(&self) -> &str {
        &self.function_instance_id
    }

    /// Check if this lock is currently held
    pub async fn is_held(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Acquire the lock, waiting up to the acquisition timeout.
    ///
    /// # Errors
    ///
    /// - [`JobHostError::InvalidOperation`] if the lock is already held
    /// - [`JobHostError::LockTimeout`] if it cannot be acquired in time
    pub async fn acquire(&self, cancel: &CancellationToken) -> JobHostResult<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(JobHostError::invalid_operation(format!(
                "Singleton lock '{}' is already held.",
                self.id
            )));
        }

        *handle = Some(
            self.manager
                .lock(&self.id, &self.function_instance_id, &self.attribute, cancel)
                .await?,
        );
        Ok(())
    }

    /// Release the lock if held
    pub async fn release(&self, cancel: &CancellationToken) -> JobHostResult<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            self.manager.release_lock(handle, cancel).await?;
        }
        Ok(())
    }

    /// Function instance currently holding this lock id, on any host
    pub async fn get_owner(&self, cancel: &CancellationToken) -> JobHostResult<Option<String>> {
        self.manager
            .get_lock_owner(&self.attribute, &self.id, cancel)
            .await
    }
}

/// Runs each invocation of a function-mode singleton function under its lock.
///
/// Functions without a function-mode singleton pass straight through.
pub struct SingletonFunctionExecutor<E> {
    inner: E,
    manager: Arc<SingletonManager>,
}

impl<E> SingletonFunctionExecutor<E>
where
    E: FunctionExecutor,
{
    pub fn new(inner: E, manager: Arc<SingletonManager>) -> Self {
        Self { inner, manager }
    }

    async fn create_lock(&self, instance: &FunctionInstance) -> JobHostResult<Option<SingletonLock>> {
        let Some(attribute) = SingletonManager::get_function_singleton_or_none(&instance.function)?
        else {
            return Ok(None);
        };

        let scope_id = self
            .manager
            .get_bound_scope_id(attribute.scope_id_or_empty(), Some(&instance.binding_data))?;
        let lock_id = self
            .manager
            .format_lock_id_for_host(Some(instance.function.as_ref()), attribute.scope, &scope_id)
            .await?;

        Ok(Some(SingletonLock::new(
            lock_id,
            instance.id.to_string(),
            attribute,
            Arc::clone(&self.manager),
        )))
    }
}

#[async_trait]
impl<E> FunctionExecutor for SingletonFunctionExecutor<E>
where
    E: FunctionExecutor,
{
    async fn try_execute(
        &self,
        instance: FunctionInstance,
        cancel: CancellationToken,
    ) -> Option<DelayedException> {
        let lock = match self.create_lock(&instance).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return self.inner.try_execute(instance, cancel).await,
            Err(e) => return Some(DelayedException::new(e)),
        };

        if let Err(e) = lock.acquire(&cancel).await {
            return Some(DelayedException::new(e));
        }
        debug!(lock_id = %lock.id(), function_instance = %instance.id, "Running function under singleton lock");

        let outcome = self.inner.try_execute(instance, cancel.clone()).await;

        // Release even when the invocation was cancelled.
        if let Err(e) = lock.release(&CancellationToken::new()).await {
            warn!(lock_id = %lock.id(), error = %e, "Failed to release singleton lock");
        }

        outcome
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
