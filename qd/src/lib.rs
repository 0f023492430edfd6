//! QueueDaemon - persistent, prioritized, retrying task scheduler
//!
//! Tasks are units of work keyed by (subject id, operation name). They are
//! persisted through a [`queuestore::TaskStore`], executed by pluggable
//! operation handlers under a concurrency limit, retried with a fixed backoff
//! and demoted in priority on each failure. Bulk operations group many tasks
//! and track them as one progress and pause unit.
//!
//! # Modules
//!
//! - [`scheduler`] - Priority queue, worker loop, retries and crash recovery
//! - [`bulk`] - Bulk operation aggregates kept in sync through events
//! - [`events`] - Event bus, event types and the JSONL event log
//! - [`operations`] - Operation handler trait, dispatcher and built-ins
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod bulk;
pub mod cli;
pub mod config;
pub mod events;
pub mod operations;
pub mod scheduler;

pub use bulk::{BulkAggregator, BulkOperation, BulkStatus};
pub use config::Config;
pub use events::{Event, EventBus};
pub use operations::{OperationDispatcher, OperationHandler};
pub use scheduler::{NewTask, SchedulerConfig, TaskScheduler};
