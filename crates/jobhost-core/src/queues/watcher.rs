//! Wake-up notifications for queue listeners.

use jobhost_storage::QueueName;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

/// Something that can be told new work may be available
pub trait NotificationCommand: Send + Sync {
    fn notify(&self);
}

/// Told whenever a message is added to a queue
pub trait MessageEnqueuedWatcher: Send + Sync {
    fn notify(&self, queue_name: &QueueName);
}

/// Routes "message enqueued" notifications to the listeners on that queue.
///
/// Registrations are weak, so a dropped listener is forgotten on the next
/// notification.
#[derive(Default)]
pub struct SharedQueueWatcher {
    registrations: Mutex<HashMap<String, Vec<Weak<dyn NotificationCommand>>>>,
}

impl SharedQueueWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<String, Vec<Weak<dyn NotificationCommand>>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Call `notification` whenever a message is added to `queue_name`
    pub fn register(&self, queue_name: &QueueName, notification: Weak<dyn NotificationCommand>) {
        self.registrations()
            .entry(queue_name.as_str().to_string())
            .or_default()
            .push(notification);
    }

    /// Number of live registrations for a queue
    pub fn registration_count(&self, queue_name: &QueueName) -> usize {
        self.registrations()
            .get(queue_name.as_str())
            .map(|r| r.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

impl MessageEnqueuedWatcher for SharedQueueWatcher {
    fn notify(&self, queue_name: &QueueName) {
        let targets: Vec<_> = {
            let mut registrations = self.registrations();
            let Some(entries) = registrations.get_mut(queue_name.as_str()) else {
                return;
            };
            entries.retain(|w| w.strong_count() > 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };

        trace!(queue = %queue_name, listeners = targets.len(), "Notifying queue listeners");
        for target in targets {
            target.notify();
        }
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;
