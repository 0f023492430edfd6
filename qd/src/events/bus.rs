//! Event Bus - synchronous fan-out of scheduler and bulk events
//!
//! Observers run in registration order on the publisher's thread. A failing or
//! panicking observer is logged and skipped; the publisher never sees it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::types::Event;

/// Handle returned by [`EventBus::register_callback`]
pub type SubscriptionId = u64;

/// Observer callback
pub type Observer = Arc<dyn Fn(&Event) -> eyre::Result<()> + Send + Sync>;

/// Central event bus shared by the scheduler, the bulk aggregator and any
/// logging or UI consumer
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; it sees every event published afterwards
    pub fn register_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscription = id, "EventBus::register_callback: called");
        match self.observers.write() {
            Ok(mut observers) => observers.push((id, Arc::new(callback))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(callback))),
        }
        id
    }

    /// Remove an observer, returning whether it was registered
    pub fn unregister_callback(&self, id: SubscriptionId) -> bool {
        debug!(subscription = id, "EventBus::unregister_callback: called");
        let mut observers = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        match self.observers.read() {
            Ok(observers) => observers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliver an event to every observer registered at the time of the call
    ///
    /// The list is snapshotted before delivery, so observers may publish,
    /// register or unregister without deadlocking.
    pub fn publish(&self, event: Event) {
        let snapshot: Vec<(SubscriptionId, Observer)> = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        debug!(
            event_type = event.event_type(),
            task_id = event.task_id(),
            bulk_id = event.bulk_id(),
            observers = snapshot.len(),
            "EventBus::publish"
        );

        for (id, observer) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = id, event_type = event.event_type(), error = %e, "Observer failed");
                }
                Err(_) => {
                    warn!(subscription = id, event_type = event.event_type(), "Observer panicked");
                }
            }
        }
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::new())
}
