//! Queue types for the scheduler

use std::cmp::Ordering;

use queuestore::{Params, Task, TaskId};
use serde::Serialize;

/// Request to create a task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub subject_id: String,
    pub operation: String,
    pub params: Params,
    /// Falls back to the configured default priority
    pub priority: Option<i32>,
    pub bulk_id: Option<String>,
}

impl NewTask {
    pub fn new(subject_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_bulk_id(mut self, bulk_id: impl Into<String>) -> Self {
        self.bulk_id = Some(bulk_id.into());
        self
    }
}

/// A task waiting in the in-memory priority queue
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub priority: i32,
    /// Arrival order, breaks priority ties
    pub seq: u64,
    pub task: Task,
}

impl Eq for QueuedTask {}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smaller priority value, then earlier arrival, is "greater"
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Counters since construction
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_added: u64,
    pub total_dispatched: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub total_cancelled: u64,
    pub total_batches: u64,
    pub peak_queue_depth: usize,
    pub peak_concurrent: usize,
}

/// Snapshot of the scheduler for display
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub running: bool,
    pub paused: bool,
    pub queued: usize,
    pub in_progress: usize,
    pub retry_waiting: usize,
    pub paused_bulks: usize,
    pub stats: SchedulerStats,
}

/// Ids of queued tasks in the order they would be dispatched
pub(crate) fn dispatch_order<'a>(queue: impl Iterator<Item = &'a QueuedTask>) -> Vec<TaskId> {
    let mut entries: Vec<&QueuedTask> = queue.collect();
    entries.sort_by(|a, b| b.cmp(a));
    entries.into_iter().map(|q| q.task.id.clone()).collect()
}
