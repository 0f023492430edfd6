//! Event types for scheduler and bulk activity
//!
//! Every state transition the scheduler or the bulk aggregator makes is
//! described by one of these variants:
//! - Service lifecycle (start, stop, pause, resume)
//! - Task lifecycle (added, started, completed, failed, retry, cancelled)
//! - Bulk aggregates (created, progress, status changes, pause/resume/cancel/retry)

use chrono::{DateTime, Utc};
use queuestore::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Core event enum, serialized as `{"type": "<snake_case>", ...}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // === Service Lifecycle ===
    ServiceStarted {
        /// Rows demoted from InProgress by crash recovery
        recovered: usize,
        /// Pending rows loaded into the queue
        loaded: usize,
    },
    ServiceStopped {
        /// In-flight tasks put back to Pending
        demoted: usize,
    },
    ServicePaused,
    ServiceResumed,

    // === Task Lifecycle ===
    TaskAdded {
        task_id: String,
        subject_id: String,
        operation: String,
        priority: i32,
        bulk_id: Option<String>,
    },
    TaskStarted {
        task_id: String,
        subject_id: String,
        operation: String,
        bulk_id: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        subject_id: String,
        operation: String,
        bulk_id: Option<String>,
        /// Handler output
        result: Value,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: String,
        subject_id: String,
        operation: String,
        bulk_id: Option<String>,
        error: String,
        retries: u32,
    },
    TaskRetryScheduled {
        task_id: String,
        subject_id: String,
        operation: String,
        bulk_id: Option<String>,
        error: String,
        retries: u32,
        next_priority: i32,
        delay_ms: u64,
    },
    TaskCancelled {
        task_id: String,
        bulk_id: Option<String>,
        /// True when the handler is still running and only its retry was prevented
        in_flight: bool,
    },
    BatchStarted {
        task_ids: Vec<String>,
    },

    // === Bulk Aggregates ===
    BulkTaskCreated {
        bulk_id: String,
        operation_type: String,
        description: String,
        priority: i32,
    },
    BulkTaskUpdated {
        bulk_id: String,
        old_status: String,
        status: String,
    },
    BulkTaskProgress {
        bulk_id: String,
        total: usize,
        completed: usize,
        failed: usize,
        progress: f64,
        estimated_time_remaining_ms: Option<u64>,
    },
    BulkTaskPaused {
        bulk_id: String,
    },
    BulkTaskResumed {
        bulk_id: String,
    },
    BulkTaskCancelled {
        bulk_id: String,
        cancelled_tasks: usize,
    },
    BulkTaskRetrying {
        bulk_id: String,
        retried: usize,
        new_task_ids: Vec<String>,
    },
}

impl Event {
    /// Wire name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::ServiceStarted { .. } => "service_started",
            Event::ServiceStopped { .. } => "service_stopped",
            Event::ServicePaused => "service_paused",
            Event::ServiceResumed => "service_resumed",
            Event::TaskAdded { .. } => "task_added",
            Event::TaskStarted { .. } => "task_started",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskFailed { .. } => "task_failed",
            Event::TaskRetryScheduled { .. } => "task_retry_scheduled",
            Event::TaskCancelled { .. } => "task_cancelled",
            Event::BatchStarted { .. } => "batch_started",
            Event::BulkTaskCreated { .. } => "bulk_task_created",
            Event::BulkTaskUpdated { .. } => "bulk_task_updated",
            Event::BulkTaskProgress { .. } => "bulk_task_progress",
            Event::BulkTaskPaused { .. } => "bulk_task_paused",
            Event::BulkTaskResumed { .. } => "bulk_task_resumed",
            Event::BulkTaskCancelled { .. } => "bulk_task_cancelled",
            Event::BulkTaskRetrying { .. } => "bulk_task_retrying",
        }
    }

    /// Task this event is about, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskAdded { task_id, .. }
            | Event::TaskStarted { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskRetryScheduled { task_id, .. }
            | Event::TaskCancelled { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Bulk aggregate this event belongs to, if any
    pub fn bulk_id(&self) -> Option<&str> {
        match self {
            Event::TaskAdded { bulk_id, .. }
            | Event::TaskStarted { bulk_id, .. }
            | Event::TaskCompleted { bulk_id, .. }
            | Event::TaskFailed { bulk_id, .. }
            | Event::TaskRetryScheduled { bulk_id, .. }
            | Event::TaskCancelled { bulk_id, .. } => bulk_id.as_deref(),
            Event::BulkTaskCreated { bulk_id, .. }
            | Event::BulkTaskUpdated { bulk_id, .. }
            | Event::BulkTaskProgress { bulk_id, .. }
            | Event::BulkTaskPaused { bulk_id }
            | Event::BulkTaskResumed { bulk_id }
            | Event::BulkTaskCancelled { bulk_id, .. }
            | Event::BulkTaskRetrying { bulk_id, .. } => Some(bulk_id),
            _ => None,
        }
    }

    // === Constructors from task rows ===

    pub fn task_added(task: &Task) -> Self {
        Event::TaskAdded {
            task_id: task.id.clone(),
            subject_id: task.subject_id.clone(),
            operation: task.operation.clone(),
            priority: task.priority,
            bulk_id: task.bulk_id.clone(),
        }
    }

    pub fn task_started(task: &Task) -> Self {
        Event::TaskStarted {
            task_id: task.id.clone(),
            subject_id: task.subject_id.clone(),
            operation: task.operation.clone(),
            bulk_id: task.bulk_id.clone(),
        }
    }

    pub fn task_completed(task: &Task, result: Value, duration_ms: u64) -> Self {
        Event::TaskCompleted {
            task_id: task.id.clone(),
            subject_id: task.subject_id.clone(),
            operation: task.operation.clone(),
            bulk_id: task.bulk_id.clone(),
            result,
            duration_ms,
        }
    }

    pub fn task_failed(task: &Task, error: &str) -> Self {
        Event::TaskFailed {
            task_id: task.id.clone(),
            subject_id: task.subject_id.clone(),
            operation: task.operation.clone(),
            bulk_id: task.bulk_id.clone(),
            error: error.to_string(),
            retries: task.retries,
        }
    }

    pub fn task_retry_scheduled(task: &Task, error: &str, delay_ms: u64) -> Self {
        Event::TaskRetryScheduled {
            task_id: task.id.clone(),
            subject_id: task.subject_id.clone(),
            operation: task.operation.clone(),
            bulk_id: task.bulk_id.clone(),
            error: error.to_string(),
            retries: task.retries,
            next_priority: task.priority,
            delay_ms,
        }
    }
}

/// Event with timestamp for JSONL persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventLogEntry {
    pub fn new(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
