//! Function invocation seams.
//!
//! Listeners hand trigger values to a [`TriggerExecutor`], which turns them
//! into a [`FunctionInstance`] and runs it through a [`FunctionExecutor`].
//! Function failures come back as a [`DelayedException`] inside a
//! [`FunctionResult`]; infrastructure failures are returned as errors.

use crate::error::JobHostResult;
use crate::singleton::SingletonAttribute;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Named values exposed to binding expressions such as `{region}`
pub type BindingData = HashMap<String, String>;

// ============================================================================
// Function metadata
// ============================================================================

/// Static description of a bindable function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    /// Fully qualified `Type.Method` name, used in lock ids
    pub full_name: String,
    /// Name shown in logs
    pub short_name: String,
    /// Whether the function is started by a trigger (as opposed to called manually)
    pub is_triggered: bool,
    /// Singleton declarations on the function itself
    pub singletons: Vec<SingletonAttribute>,
}

impl FunctionDescriptor {
    /// Describe a triggered function with no singleton declarations.
    ///
    /// The short name is the last two dot-separated segments of `full_name`.
    pub fn new(full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        let segments: Vec<&str> = full_name.rsplitn(3, '.').collect();
        let short_name = match segments.as_slice() {
            [method, type_name, ..] => format!("{}.{}", type_name, method),
            _ => full_name.clone(),
        };

        Self {
            full_name,
            short_name,
            is_triggered: true,
            singletons: Vec::new(),
        }
    }

    /// Mark whether the function has a trigger
    pub fn triggered(mut self, is_triggered: bool) -> Self {
        self.is_triggered = is_triggered;
        self
    }

    /// Add a singleton declaration
    pub fn with_singleton(mut self, attribute: SingletonAttribute) -> Self {
        self.singletons.push(attribute);
        self
    }
}

/// One invocation of a function
#[derive(Debug, Clone)]
pub struct FunctionInstance {
    pub id: Uuid,
    /// Instance that caused this one, e.g. the producer of a queue message
    pub parent_id: Option<Uuid>,
    pub reason: String,
    pub function: Arc<FunctionDescriptor>,
    /// Raw trigger payload
    pub trigger_value: Bytes,
    pub binding_data: BindingData,
}

impl FunctionInstance {
    /// Create an instance with a fresh id
    pub fn new(
        function: Arc<FunctionDescriptor>,
        trigger_value: Bytes,
        binding_data: BindingData,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            reason: String::new(),
            function,
            trigger_value,
            binding_data,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// A function failure captured for the caller to inspect later
#[derive(Debug, Clone)]
pub struct DelayedException {
    error: Arc<anyhow::Error>,
}

impl DelayedException {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: Arc::new(error.into()),
        }
    }

    /// The captured error
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }
}

impl std::fmt::Display for DelayedException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

/// Outcome of running a function for a trigger value
#[derive(Debug, Clone)]
pub struct FunctionResult {
    succeeded: bool,
    exception: Option<DelayedException>,
}

impl FunctionResult {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            exception: None,
        }
    }

    pub fn failure(exception: DelayedException) -> Self {
        Self {
            succeeded: false,
            exception: Some(exception),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn exception(&self) -> Option<&DelayedException> {
        self.exception.as_ref()
    }
}

impl From<Option<DelayedException>> for FunctionResult {
    fn from(exception: Option<DelayedException>) -> Self {
        match exception {
            Some(e) => Self::failure(e),
            None => Self::success(),
        }
    }
}

// ============================================================================
// Executor traits
// ============================================================================

/// Runs the bound function for a trigger value of type `T`
#[async_trait]
pub trait TriggerExecutor<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn execute(&self, value: &T, cancel: CancellationToken) -> JobHostResult<FunctionResult>;
}

/// Runs a prepared function instance.
///
/// # Returns
///
/// `None` when the function succeeded, otherwise the captured failure.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn try_execute(
        &self,
        instance: FunctionInstance,
        cancel: CancellationToken,
    ) -> Option<DelayedException>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
