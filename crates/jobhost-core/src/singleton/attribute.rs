//! Singleton declarations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a singleton lock is shared across
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SingletonScope {
    /// One lock per function (optionally per bound scope id)
    #[default]
    Function,
    /// One lock per scope id, shared by every function declaring it
    Host,
}

/// What a singleton lock guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SingletonMode {
    /// Each invocation runs under the lock
    #[default]
    Function,
    /// Only the trigger listener runs under the lock
    Listener,
}

/// Declares that a function or listener must run as a singleton
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SingletonAttribute {
    /// Scope id, possibly containing `{param}` or `%setting%` expressions
    pub scope_id: Option<String>,
    pub scope: SingletonScope,
    pub mode: SingletonMode,
    /// Storage account holding the lock; `None` for the default
    pub account: Option<String>,
    /// Overrides the configured acquisition timeout
    pub lock_acquisition_timeout: Option<Duration>,
}

impl SingletonAttribute {
    /// Function-scope, function-mode singleton
    pub fn new() -> Self {
        Self::default()
    }

    /// Function-scope singleton with a scope id
    pub fn with_scope_id(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: Some(scope_id.into()),
            ..Self::default()
        }
    }

    /// Listener-mode singleton
    pub fn listener() -> Self {
        Self {
            mode: SingletonMode::Listener,
            ..Self::default()
        }
    }

    pub fn scope(mut self, scope: SingletonScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn mode(mut self, mode: SingletonMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = Some(timeout);
        self
    }

    /// Scope id, or an empty string when none was declared
    pub fn scope_id_or_empty(&self) -> &str {
        self.scope_id.as_deref().unwrap_or("")
    }
}
