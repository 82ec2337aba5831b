//! Singleton execution.
//!
//! A function or listener declared singleton runs on at most one host at a
//! time. Exclusivity comes from a distributed lock whose id is derived from
//! the host id, the function name and an optional scope id:
//!
//! - Function scope: `{host_id}/{Type.Method}[.{scope_id}]`
//! - Host scope: `{host_id}/{scope_id}`
//! - Listener locks append `.Listener`
//!
//! [`SingletonManager`] acquires and renews these locks,
//! [`SingletonListener`] gates a listener on one, and
//! [`SingletonFunctionExecutor`] holds one around each invocation.

mod attribute;
mod binding;
mod config;
mod listener;
mod lock;
mod manager;

pub use attribute::{SingletonAttribute, SingletonMode, SingletonScope};
pub use binding::{
    resolve_settings, BindingTemplate, EnvironmentNameResolver, MapNameResolver, NameResolver,
};
pub use config::{
    SingletonConfig, SingletonSettings, MAXIMUM_LEASE_PERIOD, MINIMUM_LEASE_PERIOD,
    MINIMUM_POLLING_INTERVAL,
};
pub use listener::{SingletonListener, LISTENER_LOCK_SUFFIX};
pub use lock::{SingletonFunctionExecutor, SingletonLock};
pub use manager::{RenewableLockHandle, SingletonManager, DEFAULT_MINIMUM_LEASE_RENEWAL_INTERVAL};
