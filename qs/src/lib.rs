//! QueueStore - durable state for the queuedaemon scheduler
//!
//! Stores task rows keyed by an opaque id, with an identity constraint on
//! (subject id, operation name) among active rows, plus a generic keyed
//! blob table used by higher layers to persist their own aggregates.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐      ┌───────────────────────┐
//! │  TaskStore   │◄─────┤ SqliteTaskStore       │  tasks, blobs (lazy)
//! │  BlobStore   │◄─────┤ MemoryTaskStore       │  tests, ephemeral runs
//! └──────────────┘      └───────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use queuestore::{SqliteTaskStore, Task, TaskStore};
//!
//! let store = SqliteTaskStore::open("queue.db")?;
//! let outcome = store.add(&Task::new("page-17", "ocr"))?;
//! let pending = store.get_pending(100)?;
//! ```

pub mod cli;
mod error;
mod memory;
mod sqlite;
mod store;
mod task;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;
pub use store::{BlobStore, InsertOutcome, TaskFilter, TaskStore};
pub use task::{DEFAULT_PRIORITY, Params, Task, TaskId, TaskStatus, TaskUpdate, now_ms};
