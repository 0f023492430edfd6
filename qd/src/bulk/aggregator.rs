//! Bulk aggregator - keeps bulk operations in sync with scheduler events
//!
//! Member transitions arrive only through the event-bus subscription made in
//! [`BulkAggregator::new`]. Group-level controls (pause, cancel, retry) call
//! into the scheduler after the aggregator lock is released, because the
//! scheduler publishes synchronously and those events come straight back here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use queuestore::{BlobStore, Params, TaskId, TaskStatus, now_ms};
use tracing::{debug, info, warn};

use super::config::BulkConfig;
use super::persistence::BulkPersistence;
use super::types::{BulkItem, BulkMember, BulkOperation, BulkOperationType, BulkStatus};
use crate::events::{Event, EventBus, SubscriptionId};
use crate::scheduler::{NewTask, TaskScheduler};

#[derive(Default)]
struct BulkState {
    bulks: HashMap<String, BulkOperation>,
    /// task id -> bulk id
    task_index: HashMap<TaskId, String>,
}

/// Groups tasks into bulk operations and tracks their aggregate progress
pub struct BulkAggregator {
    scheduler: Arc<TaskScheduler>,
    events: Arc<EventBus>,
    persistence: Option<BulkPersistence>,
    config: BulkConfig,
    state: Mutex<BulkState>,
    subscription: OnceLock<SubscriptionId>,
}

fn progress_event(bulk: &BulkOperation) -> Event {
    Event::BulkTaskProgress {
        bulk_id: bulk.id.clone(),
        total: bulk.counters.total,
        completed: bulk.counters.completed,
        failed: bulk.counters.failed,
        progress: bulk.progress(),
        estimated_time_remaining_ms: bulk.estimated_time_remaining_ms,
    }
}

/// Lifecycle order of a member status; a retry moves a task back to 0
fn lifecycle_rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::InProgress => 1,
        TaskStatus::Completed | TaskStatus::Failed => 2,
    }
}

fn status_event(bulk: &BulkOperation, old: BulkStatus) -> Option<Event> {
    (old != bulk.status).then(|| Event::BulkTaskUpdated {
        bulk_id: bulk.id.clone(),
        old_status: old.to_string(),
        status: bulk.status.to_string(),
    })
}

impl BulkAggregator {
    /// Create the aggregator, restore persisted bulks and subscribe to the
    /// scheduler's event bus
    ///
    /// `blobs` is normally the same store the scheduler writes tasks to.
    pub fn new(scheduler: Arc<TaskScheduler>, blobs: Option<Arc<dyn BlobStore>>, config: BulkConfig) -> Arc<Self> {
        debug!(?config, persist = blobs.is_some(), "BulkAggregator::new: called");
        let events = scheduler.events().clone();
        let persistence = blobs.filter(|_| config.persist).map(BulkPersistence::new);

        let aggregator = Arc::new(Self {
            scheduler,
            events,
            persistence,
            config,
            state: Mutex::new(BulkState::default()),
            subscription: OnceLock::new(),
        });

        let restored = aggregator.load_persisted();
        if restored > 0 {
            info!(restored, "Restored bulk operations");
        }

        let weak = Arc::downgrade(&aggregator);
        let id = aggregator.events.register_callback(move |event| {
            if let Some(aggregator) = weak.upgrade() {
                aggregator.on_event(event);
            }
            Ok(())
        });
        let _ = aggregator.subscription.set(id);
        aggregator
    }

    fn state(&self) -> MutexGuard<'_, BulkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, bulk: &BulkOperation) {
        if let Some(persistence) = &self.persistence
            && let Err(e) = persistence.save(bulk)
        {
            warn!(bulk_id = %bulk.id, error = %e, "Failed to persist bulk operation");
        }
    }

    fn on_event(&self, event: &Event) {
        match event {
            Event::TaskAdded {
                task_id,
                subject_id,
                operation,
                bulk_id,
                ..
            } => {
                if let Some(bulk_id) = bulk_id {
                    let member = BulkMember {
                        subject_id: subject_id.clone(),
                        operation: operation.clone(),
                        params: Params::new(),
                        status: TaskStatus::Pending,
                        last_error: None,
                    };
                    self.track(bulk_id, task_id, member);
                }
                self.update_task_status(task_id, TaskStatus::Pending, None);
            }
            Event::TaskStarted { task_id, .. } => {
                self.update_task_status(task_id, TaskStatus::InProgress, None);
            }
            Event::TaskCompleted { task_id, .. } => {
                self.update_task_status(task_id, TaskStatus::Completed, None);
            }
            Event::TaskFailed { task_id, error, .. } => {
                self.update_task_status(task_id, TaskStatus::Failed, Some(error));
            }
            Event::TaskRetryScheduled { task_id, error, .. } => {
                self.update_task_status(task_id, TaskStatus::Pending, Some(error));
            }
            Event::TaskCancelled {
                task_id,
                in_flight: false,
                ..
            } => {
                self.update_task_status(task_id, TaskStatus::Failed, Some("cancelled"));
            }
            _ => {}
        }
    }

    /// Register a task under a bulk; false when the bulk is unknown or the
    /// task already belongs to another bulk
    ///
    /// An existing member is moved forward to `member.status` when that status
    /// is later in the task lifecycle than the recorded one.
    fn track(&self, bulk_id: &str, task_id: &str, member: BulkMember) -> bool {
        let status = member.status;
        let (event, behind) = {
            let mut guard = self.state();
            let state = &mut *guard;
            if let Some(owner) = state.task_index.get(task_id)
                && owner != bulk_id
            {
                warn!(task_id, bulk_id, owner = %owner, "Task already belongs to another bulk operation");
                return false;
            }
            let Some(bulk) = state.bulks.get_mut(bulk_id) else {
                return false;
            };

            let behind = bulk
                .members
                .get(task_id)
                .is_some_and(|existing| lifecycle_rank(existing.status) < lifecycle_rank(status));
            let added = bulk.register_member(task_id, member);
            if added {
                bulk.recompute(now_ms());
            }
            self.persist(bulk);
            state.task_index.insert(task_id.to_string(), bulk_id.to_string());
            (added.then(|| progress_event(bulk)), behind)
        };

        if let Some(event) = event {
            self.events.publish(event);
        }
        if behind {
            debug!(task_id, %status, "BulkAggregator::track: catching member up");
            self.update_task_status(task_id, status, None);
        }
        true
    }

    fn submit(&self, bulk_id: &str, priority: i32, subject_id: String, operation: String, params: Params) -> TaskId {
        let new = NewTask::new(subject_id.clone(), operation.clone())
            .with_params(params.clone())
            .with_priority(priority)
            .with_bulk_id(bulk_id);
        let task_id = self.scheduler.add_task(new);

        // A deduplicated add publishes nothing, so take the row's current status
        let status = match self.scheduler.store().get(&task_id) {
            Ok(Some(task)) => task.status,
            Ok(None) => TaskStatus::Pending,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to read task status");
                TaskStatus::Pending
            }
        };
        let member = BulkMember {
            subject_id,
            operation,
            params,
            status,
            last_error: None,
        };
        self.track(bulk_id, &task_id, member);
        task_id
    }

    // === Bulk lifecycle ===

    /// Create an empty bulk operation
    pub fn create_bulk_task(
        &self,
        operation_type: BulkOperationType,
        description: impl Into<String>,
        params: Params,
        priority: i32,
    ) -> String {
        let mut bulk = BulkOperation::new(operation_type, description, params, priority);
        bulk.log(format!("Created {} bulk operation", operation_type), self.config.message_log_limit);
        debug!(bulk_id = %bulk.id, %operation_type, priority, "BulkAggregator::create_bulk_task: called");

        let event = Event::BulkTaskCreated {
            bulk_id: bulk.id.clone(),
            operation_type: operation_type.to_string(),
            description: bulk.description.clone(),
            priority,
        };
        let bulk_id = bulk.id.clone();
        self.persist(&bulk);
        self.state().bulks.insert(bulk_id.clone(), bulk);

        self.events.publish(event);
        bulk_id
    }

    /// Submit one task under a bulk; `None` for an unknown bulk
    pub fn add_task_to_bulk(
        &self,
        bulk_id: &str,
        subject_id: impl Into<String>,
        operation: impl Into<String>,
        params: Params,
    ) -> Option<TaskId> {
        let priority = self.state().bulks.get(bulk_id)?.priority;
        debug!(bulk_id, priority, "BulkAggregator::add_task_to_bulk: called");
        Some(self.submit(bulk_id, priority, subject_id.into(), operation.into(), params))
    }

    /// Submit several tasks under a bulk; empty for an unknown bulk
    pub fn add_tasks_to_bulk(&self, bulk_id: &str, items: Vec<BulkItem>) -> Vec<TaskId> {
        let Some(priority) = self.state().bulks.get(bulk_id).map(|b| b.priority) else {
            return Vec::new();
        };
        debug!(bulk_id, count = items.len(), "BulkAggregator::add_tasks_to_bulk: called");
        items
            .into_iter()
            .map(|item| self.submit(bulk_id, priority, item.subject_id, item.operation, item.params))
            .collect()
    }

    /// Record a member transition; false for a task outside every bulk
    pub fn update_task_status(&self, task_id: &str, status: TaskStatus, error: Option<&str>) -> bool {
        let now = now_ms();
        let limit = self.config.message_log_limit;
        let events = {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(bulk_id) = state.task_index.get(task_id) else {
                return false;
            };
            let Some(bulk) = state.bulks.get_mut(bulk_id) else {
                return false;
            };
            if !bulk.set_member_status(task_id, status, error, now) {
                return true;
            }

            if status == TaskStatus::Failed {
                bulk.log(
                    format!("Task {} failed: {}", task_id, error.unwrap_or("unknown error")),
                    limit,
                );
            }
            let old = bulk.recompute(now);
            if old != bulk.status {
                bulk.log(format!("Status changed: {} -> {}", old, bulk.status), limit);
            }
            self.persist(bulk);

            let mut events = vec![progress_event(bulk)];
            events.extend(status_event(bulk, old));
            events
        };

        for event in events {
            self.events.publish(event);
        }
        true
    }

    /// Hold back the bulk's queued tasks; false if unknown or already paused
    pub fn pause_bulk_task(&self, bulk_id: &str) -> bool {
        debug!(bulk_id, "BulkAggregator::pause_bulk_task: called");
        let updated = {
            let mut state = self.state();
            let Some(bulk) = state.bulks.get_mut(bulk_id) else {
                return false;
            };
            if bulk.is_paused {
                return false;
            }
            bulk.is_paused = true;
            bulk.log("Paused", self.config.message_log_limit);
            let old = bulk.recompute(now_ms());
            self.persist(bulk);
            status_event(bulk, old)
        };

        self.scheduler.pause_bulk(bulk_id);
        self.events.publish(Event::BulkTaskPaused {
            bulk_id: bulk_id.to_string(),
        });
        if let Some(event) = updated {
            self.events.publish(event);
        }
        true
    }

    /// Release a paused bulk; false if unknown or not paused
    pub fn resume_bulk_task(&self, bulk_id: &str) -> bool {
        debug!(bulk_id, "BulkAggregator::resume_bulk_task: called");
        let updated = {
            let mut state = self.state();
            let Some(bulk) = state.bulks.get_mut(bulk_id) else {
                return false;
            };
            if !bulk.is_paused {
                return false;
            }
            bulk.is_paused = false;
            bulk.log("Resumed", self.config.message_log_limit);
            let old = bulk.recompute(now_ms());
            self.persist(bulk);
            status_event(bulk, old)
        };

        self.scheduler.resume_bulk(bulk_id);
        self.events.publish(Event::BulkTaskResumed {
            bulk_id: bulk_id.to_string(),
        });
        if let Some(event) = updated {
            self.events.publish(event);
        }
        true
    }

    /// Cancel every unfinished member and force the bulk to Failed
    pub fn cancel_bulk_task(&self, bulk_id: &str) -> bool {
        debug!(bulk_id, "BulkAggregator::cancel_bulk_task: called");
        let (targets, updated) = {
            let mut state = self.state();
            let Some(bulk) = state.bulks.get_mut(bulk_id) else {
                return false;
            };
            let targets: Vec<TaskId> = bulk
                .members
                .iter()
                .filter(|(_, member)| !member.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();

            bulk.is_cancelled = true;
            bulk.is_paused = false;
            bulk.log(
                format!("Cancelled by user: {} tasks", targets.len()),
                self.config.message_log_limit,
            );
            let old = bulk.recompute(now_ms());
            self.persist(bulk);
            (targets, status_event(bulk, old))
        };

        let mut cancelled = 0;
        for task_id in &targets {
            if self.scheduler.cancel_task(task_id) {
                cancelled += 1;
            } else if self.member_status(task_id) == Some(TaskStatus::Pending) {
                // Row vanished outside the scheduler; nothing will report it
                self.update_task_status(task_id, TaskStatus::Failed, Some("cancelled"));
            }
        }
        self.scheduler.resume_bulk(bulk_id);

        info!(bulk_id, cancelled, "Bulk operation cancelled");
        if let Some(event) = updated {
            self.events.publish(event);
        }
        self.events.publish(Event::BulkTaskCancelled {
            bulk_id: bulk_id.to_string(),
            cancelled_tasks: cancelled,
        });
        true
    }

    /// Resubmit every failed member as a new task; returns how many
    pub fn retry_failed_tasks(&self, bulk_id: &str) -> usize {
        debug!(bulk_id, "BulkAggregator::retry_failed_tasks: called");
        let (stale, priority) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(bulk) = state.bulks.get_mut(bulk_id) else {
                return 0;
            };
            let stale: Vec<(TaskId, BulkMember)> = bulk
                .failed_task_ids
                .iter()
                .filter_map(|id| bulk.members.get(id).map(|m| (id.clone(), m.clone())))
                .collect();
            if stale.is_empty() {
                return 0;
            }

            bulk.is_cancelled = false;
            for (task_id, _) in &stale {
                bulk.remove_member(task_id);
                state.task_index.remove(task_id);
            }
            bulk.log(
                format!("Retrying {} failed tasks", stale.len()),
                self.config.message_log_limit,
            );
            bulk.recompute(now_ms());
            self.persist(bulk);
            (stale, bulk.priority)
        };

        for (task_id, _) in &stale {
            self.scheduler.cancel_task(task_id);
        }
        let new_task_ids: Vec<TaskId> = stale
            .into_iter()
            .map(|(_, member)| self.submit(bulk_id, priority, member.subject_id, member.operation, member.params))
            .collect();

        let retried = new_task_ids.len();
        info!(bulk_id, retried, "Retrying failed bulk tasks");
        self.events.publish(Event::BulkTaskRetrying {
            bulk_id: bulk_id.to_string(),
            retried,
            new_task_ids,
        });
        retried
    }

    /// Forget a bulk operation and its stored snapshot; member tasks are untouched
    pub fn remove_bulk_task(&self, bulk_id: &str) -> bool {
        let removed = {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(bulk) = state.bulks.remove(bulk_id) else {
                return false;
            };
            for task_id in bulk.members.keys() {
                state.task_index.remove(task_id);
            }
            bulk
        };
        self.scheduler.resume_bulk(bulk_id);
        if let Some(persistence) = &self.persistence
            && let Err(e) = persistence.delete(&removed.id)
        {
            warn!(bulk_id, error = %e, "Failed to delete persisted bulk operation");
        }
        true
    }

    // === Queries ===

    pub fn get_bulk_task(&self, bulk_id: &str) -> Option<BulkOperation> {
        self.state().bulks.get(bulk_id).cloned()
    }

    /// All bulk operations, oldest first
    pub fn list_bulk_tasks(&self) -> Vec<BulkOperation> {
        let mut bulks: Vec<BulkOperation> = self.state().bulks.values().cloned().collect();
        bulks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        bulks
    }

    pub fn bulk_id_for_task(&self, task_id: &str) -> Option<String> {
        self.state().task_index.get(task_id).cloned()
    }

    pub fn progress(&self, bulk_id: &str) -> Option<f64> {
        self.state().bulks.get(bulk_id).map(BulkOperation::progress)
    }

    fn member_status(&self, task_id: &str) -> Option<TaskStatus> {
        let state = self.state();
        let bulk_id = state.task_index.get(task_id)?;
        state.bulks.get(bulk_id)?.members.get(task_id).map(|m| m.status)
    }

    // === Persistence ===

    /// Restore bulks from the blob table and rebuild the reverse index
    ///
    /// Member statuses are reconciled against the task store, since recovery
    /// and offline changes publish no events. Returns how many were loaded.
    pub fn load_persisted(&self) -> usize {
        let Some(persistence) = &self.persistence else {
            return 0;
        };
        let bulks = match persistence.load_all() {
            Ok(bulks) => bulks,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted bulk operations");
                return 0;
            }
        };

        let now = now_ms();
        let count = bulks.len();
        let mut paused = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            for mut bulk in bulks {
                let ids: Vec<TaskId> = bulk.members.keys().cloned().collect();
                for task_id in ids {
                    if let Ok(Some(task)) = self.scheduler.store().get(&task_id) {
                        bulk.set_member_status(&task_id, task.status, task.last_error.as_deref(), now);
                    }
                    state.task_index.insert(task_id, bulk.id.clone());
                }
                bulk.recompute(now);
                if bulk.is_paused {
                    paused.push(bulk.id.clone());
                }
                state.bulks.insert(bulk.id.clone(), bulk);
            }
        }

        for bulk_id in paused {
            self.scheduler.pause_bulk(&bulk_id);
        }
        debug!(count, "BulkAggregator::load_persisted: restored");
        count
    }
}

impl Drop for BulkAggregator {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get() {
            self.events.unregister_callback(*id);
        }
    }
}
