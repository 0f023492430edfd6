//! Bulk operations: named groups of tasks tracked as one unit
//!
//! A [`BulkAggregator`] submits member tasks through the scheduler and follows
//! their lifecycle on the event bus. Each [`BulkOperation`] keeps per-status
//! counters, a derived [`BulkStatus`], progress and an ETA, and is snapshotted
//! into the store's blob table after every change.

mod aggregator;
mod config;
mod persistence;
mod types;

pub use aggregator::BulkAggregator;
pub use config::BulkConfig;
pub use persistence::{BULK_NAMESPACE, BulkPersistence};
pub use types::{
    BulkCounters, BulkItem, BulkMember, BulkOperation, BulkOperationType, BulkStatus, StatusMessage,
};
