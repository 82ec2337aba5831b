//! # Jobhost Core
//!
//! Runtime for queue-triggered, blob-triggered and singleton functions.
//!
//! A host polls storage queues and runs a function for each message, and
//! scans blob containers for new and changed blobs. Any function or
//! listener can be declared singleton, in which case it only runs on the
//! host instance currently holding a distributed lock.
//!
//! ## Architecture
//!
//! - Every background loop is a [`TaskSeriesTimer`] driving a
//!   [`TaskSeriesCommand`]: queue polling, blob scanning, lease renewal,
//!   message visibility renewal and listener lock recovery
//! - Storage is reached only through the `jobhost-storage` traits, and
//!   everything else is injected; there is no process-wide state
//! - Errors from background work go to a [`BackgroundExceptionHandler`]
//!
//! ## Module Organization
//!
//! - [`timers`] - Task series timers and delay strategies
//! - [`locks`] - Distributed lock manager over blob leases and host identity
//! - [`singleton`] - Singleton manager, singleton listener and per-invocation locks
//! - [`queues`] - Queue listener, processor, trigger executor and watcher
//! - [`blobs`] - Blob scan listener and trigger executor
//! - [`listeners`] - The listener lifecycle trait
//! - [`executors`] - Function descriptors, instances and results
//! - [`config`] - Host configuration
//! - [`logging`] - Host status rows

pub mod blobs;
pub mod config;
pub mod error;
pub mod executors;
pub mod listeners;
pub mod locks;
pub mod logging;
pub mod queues;
pub mod singleton;
pub mod timers;

#[cfg(test)]
mod test_support;

pub use blobs::{BlobListener, BlobTriggerExecutor, ScanBlobPollingStrategy};
pub use config::JobHostConfig;
pub use error::{BindingError, ConfigurationError, ErrorCategory, JobHostError, JobHostResult};
pub use executors::{
    BindingData, DelayedException, FunctionDescriptor, FunctionExecutor, FunctionInstance,
    FunctionResult, TriggerExecutor,
};
pub use listeners::{CompositeListener, Listener};
pub use locks::{
    BlobLeaseDistributedLockManager, DistributedLockManager, FixedHostIdProvider, HostIdProvider,
    LockHandle,
};
pub use logging::{HostLogSink, LogRow, TracingLogSink};
pub use queues::{
    QueueListener, QueueListenerBuilder, QueueProcessor, QueueProcessorFactory, QueuesConfig,
    QueueTriggerExecutor, SharedQueueWatcher,
};
pub use singleton::{
    SingletonAttribute, SingletonConfig, SingletonFunctionExecutor, SingletonListener,
    SingletonManager, SingletonMode, SingletonScope,
};
pub use timers::{
    BackgroundExceptionHandler, DelayStrategy, HostExceptionHandler, TaskSeriesCommand,
    TaskSeriesCommandResult, TaskSeriesTimer,
};
