//! Scheduler for task execution
//!
//! Persistent priority queue with retries, bulk pausing and crash recovery,
//! driven by a single worker loop.

mod config;
mod core;
mod queue;
mod recovery;

pub use config::SchedulerConfig;
pub use self::core::TaskScheduler;
pub use queue::{NewTask, QueueState, QueuedTask, SchedulerStats};
pub use recovery::{RecoveryStats, recover_interrupted};
