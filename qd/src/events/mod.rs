//! Event Bus for scheduler and bulk observability
//!
//! The bus is the only integration point between the scheduler, the bulk
//! aggregator and any logging or UI consumer. Components publish; consumers
//! register callbacks. No component calls another to report a transition.
//!
//! # Architecture
//!
//! ```text
//!    TaskScheduler                     BulkAggregator
//!    publishes:                        publishes:
//!    - service_*                       - bulk_task_created / updated
//!    - task_added / started            - bulk_task_progress
//!    - task_completed / failed         - bulk_task_paused / resumed
//!    - task_retry_scheduled            - bulk_task_cancelled / retrying
//!    - task_cancelled, batch_started
//!            │                                 │
//!            ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EVENT BUS                            │
//! │        (synchronous, registration order, failure-isolated)   │
//! └─────────────────────────────────────────────────────────────┘
//!            │                 │                   │
//!            ▼                 ▼                   ▼
//!     BulkAggregator      EventLogger         tracing_observer
//!     (counters, ETA)     (events.jsonl)      (debug log)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuedaemon::events::{Event, EventBus};
//!
//! let bus = EventBus::new();
//! let id = bus.register_callback(|event| {
//!     println!("{}", event.event_type());
//!     Ok(())
//! });
//! bus.publish(Event::ServicePaused);
//! bus.unregister_callback(id);
//! ```

mod bus;
mod logger;
mod types;

pub use bus::{EventBus, Observer, SubscriptionId, create_event_bus};
pub use logger::{EVENTS_FILE, EventLogger, read_events, tracing_observer};
pub use types::{Event, EventLogEntry};
