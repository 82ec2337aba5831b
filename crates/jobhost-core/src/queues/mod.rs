//! Queue-triggered functions.
//!
//! [`QueueListener`] polls a queue and runs a function per message through a
//! [`QueueTriggerExecutor`]. A [`QueueProcessor`] decides what happens to a
//! message once its function returns: delete on success, release or move to
//! the poison queue on failure.

pub mod config;
pub mod listener;
pub mod processor;
pub mod trigger;
mod visibility;
pub mod watcher;

pub use config::{QueuesConfig, DEFAULT_MAX_POLLING_INTERVAL, MINIMUM_POLLING_INTERVAL};
pub use listener::{
    QueueListener, QueueListenerBuilder, DEFAULT_MINIMUM_VISIBILITY_RENEWAL_INTERVAL,
    DEFAULT_VISIBILITY_TIMEOUT,
};
pub use processor::{
    DefaultQueueProcessor, DefaultQueueProcessorFactory, QueueProcessor, QueueProcessorContext,
    QueueProcessorFactory,
};
pub use trigger::{QueueTriggerExecutor, QUEUE_TRIGGER_KEY};
pub use watcher::{MessageEnqueuedWatcher, NotificationCommand, SharedQueueWatcher};
