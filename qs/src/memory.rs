//! In-memory store for tests and ephemeral runs

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{BlobStore, InsertOutcome, TaskFilter, TaskStore};
use crate::task::{Task, TaskStatus, TaskUpdate};

#[derive(Default)]
struct MemoryInner {
    /// Rows in insertion order
    tasks: Vec<Task>,
    blobs: BTreeMap<(String, String), Vec<u8>>,
}

/// Store that keeps everything in a mutex-guarded vector
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| StoreError::Lock)
    }

    /// Number of rows regardless of status
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStore for MemoryTaskStore {
    fn add(&self, task: &Task) -> StoreResult<InsertOutcome> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .tasks
            .iter()
            .find(|t| t.status.is_active() && t.identity() == task.identity())
        {
            debug!(id = %existing.id, subject = %task.subject_id, operation = %task.operation, "MemoryTaskStore::add: identity taken");
            return Ok(InsertOutcome::existing(existing.id.clone()));
        }
        inner.tasks.push(task.clone());
        Ok(InsertOutcome::created(task.id.clone()))
    }

    fn get_pending(&self, limit: usize) -> StoreResult<Vec<Task>> {
        let inner = self.lock()?;
        let mut pending: Vec<Task> = inner
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal keys
        pending.sort_by_key(|t| (t.priority, t.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    fn get(&self, id: &str) -> StoreResult<Option<Task>> {
        let inner = self.lock()?;
        Ok(inner.tasks.iter().find(|t| t.id == id).cloned())
    }

    fn update(&self, id: &str, update: &TaskUpdate) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        update.apply(task);
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let before = inner.tasks.len();
        inner.tasks.retain(|t| t.id != id);
        Ok(inner.tasks.len() != before)
    }

    fn list(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let inner = self.lock()?;
        let mut rows: Vec<Task> = inner.tasks.iter().filter(|t| filter.matches(t)).cloned().collect();
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn count_by_status(&self) -> StoreResult<HashMap<TaskStatus, usize>> {
        let inner = self.lock()?;
        let mut counts = HashMap::new();
        for task in &inner.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

impl BlobStore for MemoryTaskStore {
    fn put_blob(&self, namespace: &str, key: &str, data: &[u8]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .blobs
            .insert((namespace.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn get_blob(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let inner = self.lock()?;
        Ok(inner.blobs.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    fn delete_blob(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .blobs
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    fn list_blobs(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let inner = self.lock()?;
        Ok(inner
            .blobs
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), data)| (key.clone(), data.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_suppresses_active_duplicate() {
        let store = MemoryTaskStore::new();
        let first = store.add(&Task::new("p1", "ocr")).unwrap();
        let second = store.add(&Task::new("p1", "ocr")).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_allows_after_terminal() {
        let store = MemoryTaskStore::new();
        let first = store.add(&Task::new("p1", "ocr")).unwrap();
        store
            .update(&first.id, &TaskUpdate::status(TaskStatus::Failed))
            .unwrap();

        let second = store.add(&Task::new("p1", "ocr")).unwrap();
        assert!(second.created);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_get_pending_ordering() {
        let store = MemoryTaskStore::new();
        let low = Task::new("a", "ocr").with_priority(3);
        let high = Task::new("b", "ocr").with_priority(1);
        let mid = Task::new("c", "ocr").with_priority(2);
        for t in [&low, &high, &mid] {
            store.add(t).unwrap();
        }

        let pending = store.get_pending(10).unwrap();
        let subjects: Vec<_> = pending.iter().map(|t| t.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["b", "c", "a"]);

        assert_eq!(store.get_pending(2).unwrap().len(), 2);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = MemoryTaskStore::new();
        let err = store
            .update("nope", &TaskUpdate::status(TaskStatus::Completed))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_remove() {
        let store = MemoryTaskStore::new();
        let outcome = store.add(&Task::new("p1", "ocr")).unwrap();
        assert!(store.remove(&outcome.id).unwrap());
        assert!(!store.remove(&outcome.id).unwrap());
        assert!(store.get(&outcome.id).unwrap().is_none());
    }

    #[test]
    fn test_blobs_namespaced() {
        let store = MemoryTaskStore::new();
        store.put_blob("bulk", "b1", b"one").unwrap();
        store.put_blob("bulk", "b2", b"two").unwrap();
        store.put_blob("other", "b1", b"x").unwrap();

        assert_eq!(store.get_blob("bulk", "b1").unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(store.list_blobs("bulk").unwrap().len(), 2);
        assert!(store.delete_blob("bulk", "b1").unwrap());
        assert!(store.get_blob("bulk", "b1").unwrap().is_none());
        assert_eq!(store.list_blobs("other").unwrap().len(), 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        proptest! {
            #[test]
            fn prop_one_active_row_per_identity(
                ops in proptest::collection::vec((0usize..3, 0usize..2, any::<bool>()), 1..40)
            ) {
                let store = MemoryTaskStore::new();
                let subjects = ["p1", "p2", "p3"];
                let operations = ["ocr", "segment"];

                for (subject, operation, finish) in ops {
                    let outcome = store.add(&Task::new(subjects[subject], operations[operation])).unwrap();
                    if finish {
                        store.update(&outcome.id, &TaskUpdate::status(TaskStatus::Completed)).unwrap();
                    }

                    let mut seen = HashSet::new();
                    for task in store.list(&TaskFilter::default()).unwrap() {
                        if task.status.is_active() {
                            prop_assert!(seen.insert((task.subject_id.clone(), task.operation.clone())));
                        }
                    }
                }
            }
        }
    }
}
