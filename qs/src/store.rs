//! Persistence contracts consumed by the scheduler and the bulk layer

use std::collections::HashMap;

use crate::error::StoreResult;
use crate::task::{Task, TaskId, TaskStatus, TaskUpdate};

/// Result of an insert-if-absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Id of the new row, or of the active row that already holds the identity
    pub id: TaskId,
    /// False when an active row with the same (subject, operation) existed
    pub created: bool,
}

impl InsertOutcome {
    pub fn created(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            created: true,
        }
    }

    pub fn existing(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            created: false,
        }
    }
}

/// Filter for listing task rows
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub operation: Option<String>,
    pub bulk_id: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.operation.as_deref().is_none_or(|op| task.operation == op)
            && self.bulk_id.as_deref().is_none_or(|b| task.bulk_id.as_deref() == Some(b))
    }
}

/// Durable record of tasks
///
/// Implementations must make `add` atomic: two concurrent adds of the same
/// (subject, operation) while a Pending/InProgress row exists yield one row.
pub trait TaskStore: Send + Sync {
    /// Insert a task unless an active row with the same identity exists
    fn add(&self, task: &Task) -> StoreResult<InsertOutcome>;

    /// Pending rows ordered by priority, then creation time
    fn get_pending(&self, limit: usize) -> StoreResult<Vec<Task>>;

    fn get(&self, id: &str) -> StoreResult<Option<Task>>;

    /// Apply a partial update; missing rows are `StoreError::NotFound`
    fn update(&self, id: &str, update: &TaskUpdate) -> StoreResult<()>;

    /// Delete a row, returning whether it existed
    fn remove(&self, id: &str) -> StoreResult<bool>;

    /// List rows matching a filter, oldest first
    fn list(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>>;

    /// Row counts per status
    fn count_by_status(&self) -> StoreResult<HashMap<TaskStatus, usize>>;
}

/// Generic keyed blob table, namespaced
///
/// The backing table is created on first use.
pub trait BlobStore: Send + Sync {
    fn put_blob(&self, namespace: &str, key: &str, data: &[u8]) -> StoreResult<()>;

    fn get_blob(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn delete_blob(&self, namespace: &str, key: &str) -> StoreResult<bool>;

    /// All (key, data) pairs in a namespace, ordered by key
    fn list_blobs(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let task = Task::new("page-1", "ocr").with_bulk_id(Some("bulk-1".to_string()));

        assert!(TaskFilter::default().matches(&task));
        assert!(
            TaskFilter {
                status: Some(TaskStatus::Pending),
                operation: Some("ocr".to_string()),
                bulk_id: Some("bulk-1".to_string()),
                limit: None,
            }
            .matches(&task)
        );
        assert!(
            !TaskFilter {
                operation: Some("segment".to_string()),
                ..Default::default()
            }
            .matches(&task)
        );
        assert!(
            !TaskFilter {
                bulk_id: Some("bulk-2".to_string()),
                ..Default::default()
            }
            .matches(&task)
        );
    }
}
