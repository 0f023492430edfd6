//! TaskScheduler - persistent, prioritized, retrying worker loop
//!
//! One loop task makes every dequeue/dispatch decision; each dispatched task
//! runs on its own spawned task and reports back through [`TaskScheduler::finish`].
//! All shared state sits behind one coarse mutex that is never held across an
//! `.await` or while publishing.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use eyre::eyre;
use queuestore::{Task, TaskId, TaskStatus, TaskStore, TaskUpdate, now_ms};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventBus};
use crate::operations::OperationDispatcher;

use super::config::SchedulerConfig;
use super::queue::{NewTask, QueueState, QueuedTask, SchedulerStats, dispatch_order};
use super::recovery::recover_interrupted;

/// State protected by the scheduler mutex
#[derive(Default)]
struct SchedulerState {
    running: bool,
    paused: bool,

    /// Waiting tasks, smallest priority then earliest arrival first
    queue: BinaryHeap<QueuedTask>,
    queued_ids: HashSet<TaskId>,

    /// Dispatched tasks whose handler has not reported back
    in_progress: HashMap<TaskId, Dispatch>,

    /// Persisted tasks whose `task_added` has not been published yet
    announcing: HashSet<TaskId>,

    /// Tasks whose next failure (or pending re-enqueue) must be dropped
    cancelled: HashSet<TaskId>,

    /// Tasks sleeping out a retry backoff
    retry_waiting: HashSet<TaskId>,

    paused_bulks: HashSet<String>,

    next_seq: u64,
    next_generation: u64,
    stats: SchedulerStats,
}

/// One execution of a task; a restarted task gets a new generation
#[derive(Clone)]
struct Dispatch {
    generation: u64,
    task: Task,
}

impl SchedulerState {
    fn is_known(&self, id: &str) -> bool {
        self.queued_ids.contains(id)
            || self.in_progress.contains_key(id)
            || self.retry_waiting.contains(id)
            || self.announcing.contains(id)
    }

    fn push(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued_ids.insert(task.id.clone());
        self.queue.push(QueuedTask {
            priority: task.priority,
            seq,
            task,
        });
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(self.queue.len());
    }

    /// Pop up to `limit` tasks whose bulk is not paused
    ///
    /// Skipped entries go back with their original priority and sequence.
    fn pop_dispatchable(&mut self, limit: usize) -> Vec<Task> {
        let mut ready = Vec::new();
        let mut held = Vec::new();

        while ready.len() < limit {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            let paused = entry
                .task
                .bulk_id
                .as_ref()
                .is_some_and(|bulk_id| self.paused_bulks.contains(bulk_id));
            if paused {
                held.push(entry);
            } else {
                self.queued_ids.remove(&entry.task.id);
                ready.push(entry.task);
            }
        }

        self.queue.extend(held);
        ready
    }

    /// Remove a queued task by draining and rebuilding the heap
    fn remove_queued(&mut self, id: &str) -> Option<Task> {
        if !self.queued_ids.remove(id) {
            return None;
        }
        let mut removed = None;
        let kept: Vec<QueuedTask> = self
            .queue
            .drain()
            .filter_map(|entry| {
                if entry.task.id == id {
                    removed = Some(entry.task);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        self.queue = kept.into_iter().collect();
        removed
    }

    /// Find an active in-memory task with the given identity
    fn find_identity(&self, subject_id: &str, operation: &str) -> Option<TaskId> {
        self.queue
            .iter()
            .map(|entry| &entry.task)
            .chain(self.in_progress.values().map(|dispatch| &dispatch.task))
            .find(|task| task.identity() == (subject_id, operation))
            .map(|task| task.id.clone())
    }
}

/// What the loop should do next
enum Step {
    /// Run these tasks; `batch` when dispatched through batch mode
    Dispatch { dispatches: Vec<Dispatch>, batch: bool },
    /// Paused or at the concurrency limit
    Idle,
    /// Nothing dispatchable
    Empty,
    Exit,
}

struct LoopHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

/// The task scheduler
///
/// Created with [`TaskScheduler::new`], which returns an `Arc` because the
/// loop, executions and retry timers all hold a reference.
pub struct TaskScheduler {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<OperationDispatcher>,
    events: Arc<EventBus>,
    state: Mutex<SchedulerState>,
    control: Mutex<Option<LoopHandle>>,
    /// Wakes the loop on enqueue, completion and resume
    wake: Notify,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<OperationDispatcher>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        debug!(?config, operations = ?dispatcher.operations(), "TaskScheduler::new: called");
        Arc::new(Self {
            config,
            store,
            dispatcher,
            events,
            state: Mutex::new(SchedulerState::default()),
            control: Mutex::new(None),
            wake: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, Option<LoopHandle>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    // === Lifecycle ===

    /// Recover, load Pending rows and start the loop
    ///
    /// Returns false if already running. Must be called inside a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        debug!("TaskScheduler::start: called");
        let mut control = self.control();
        if control.is_some() {
            debug!("TaskScheduler::start: already running");
            return false;
        }

        let (recovered, loaded) = {
            let mut state = self.state();

            let in_flight: HashSet<TaskId> = state.in_progress.keys().cloned().collect();
            let recovered = match recover_interrupted(self.store.as_ref(), &in_flight) {
                Ok(stats) => stats.demoted,
                Err(e) => {
                    error!(error = %e, "Crash recovery failed, continuing");
                    0
                }
            };

            let loaded = self.load_pending(&mut state);
            state.running = true;
            (recovered, loaded)
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let scheduler = Arc::clone(self);
        let join = tokio::spawn(async move { scheduler.run_loop(shutdown_rx).await });
        *control = Some(LoopHandle { shutdown_tx, join });
        drop(control);

        info!(recovered, loaded, "Scheduler started");
        self.events.publish(Event::ServiceStarted { recovered, loaded });
        true
    }

    /// Stop the loop and put every in-flight task back to Pending
    ///
    /// Handlers still running are not interrupted; their results are applied
    /// when they finish. Returns false if not running.
    pub async fn stop(&self) -> bool {
        debug!("TaskScheduler::stop: called");
        let Some(handle) = self.control().take() else {
            debug!("TaskScheduler::stop: not running");
            return false;
        };

        self.state().running = false;
        let _ = handle.shutdown_tx.send(()).await;
        self.wake.notify_one();

        let mut join = handle.join;
        match tokio::time::timeout(self.config.stop_timeout(), &mut join).await {
            Ok(Ok(())) => debug!("TaskScheduler::stop: loop exited"),
            Ok(Err(e)) => warn!(error = %e, "Scheduler loop ended abnormally"),
            Err(_) => {
                warn!(timeout_ms = self.config.stop_timeout_ms, "Scheduler loop did not exit in time, aborting");
                join.abort();
            }
        }

        let demoted = {
            let mut state = self.state();
            let in_flight: Vec<Task> = state.in_progress.drain().map(|(_, dispatch)| dispatch.task).collect();
            for task in &in_flight {
                let update = TaskUpdate::status(TaskStatus::Pending).with_started_at(None);
                if let Err(e) = self.store.update(&task.id, &update) {
                    error!(task_id = %task.id, error = %e, "Failed to demote in-flight task");
                }
            }
            state.queue.clear();
            state.queued_ids.clear();
            in_flight.len()
        };

        info!(demoted, "Scheduler stopped");
        self.events.publish(Event::ServiceStopped { demoted });
        true
    }

    /// Stop dispatching new work; returns false if already paused
    pub fn pause(&self) -> bool {
        debug!("TaskScheduler::pause: called");
        {
            let mut state = self.state();
            if state.paused {
                return false;
            }
            state.paused = true;
        }
        info!("Scheduler paused");
        self.events.publish(Event::ServicePaused);
        true
    }

    /// Resume dispatching; returns false if not paused
    pub fn resume(&self) -> bool {
        debug!("TaskScheduler::resume: called");
        {
            let mut state = self.state();
            if !state.paused {
                return false;
            }
            state.paused = false;
        }
        self.wake.notify_one();
        info!("Scheduler resumed");
        self.events.publish(Event::ServiceResumed);
        true
    }

    // === Producers ===

    /// Persist a task and enqueue it if the scheduler is running
    ///
    /// If an active task with the same (subject, operation) exists, its id is
    /// returned and nothing else happens.
    pub fn add_task(&self, new: NewTask) -> TaskId {
        debug!(subject = %new.subject_id, operation = %new.operation, priority = ?new.priority, bulk_id = ?new.bulk_id, "TaskScheduler::add_task: called");
        let task = Task::new(new.subject_id, new.operation)
            .with_params(new.params)
            .with_priority(new.priority.unwrap_or(self.config.default_priority))
            .with_bulk_id(new.bulk_id);

        {
            let mut state = self.state();
            match self.store.add(&task) {
                Ok(outcome) if !outcome.created => {
                    debug!(existing = %outcome.id, "TaskScheduler::add_task: active task exists");
                    return outcome.id;
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(existing) = state.find_identity(&task.subject_id, &task.operation) {
                        warn!(error = %e, %existing, "Store add failed; identity already active in memory");
                        return existing;
                    }
                    error!(task_id = %task.id, error = %e, "Failed to persist task, continuing in memory");
                }
            }

            state.stats.total_added += 1;
            state.announcing.insert(task.id.clone());
        }

        // Observers see the add before the loop can dispatch the task
        self.events.publish(Event::task_added(&task));

        let queued = {
            let mut state = self.state();
            state.announcing.remove(&task.id);
            if state.cancelled.remove(&task.id) {
                debug!(task_id = %task.id, "TaskScheduler::add_task: cancelled before enqueue");
                false
            } else if state.running && !state.is_known(&task.id) {
                state.push(task.clone());
                true
            } else {
                false
            }
        };
        if queued {
            self.wake.notify_one();
        }
        task.id
    }

    /// Cancel a task
    ///
    /// A dispatched task keeps running but will not be retried. A queued or
    /// backoff-waiting task is dropped and its row deleted. Returns false if
    /// the task is unknown or already finished.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        debug!(%task_id, "TaskScheduler::cancel_task: called");
        let (bulk_id, in_flight) = {
            let mut state = self.state();

            if let Some(dispatch) = state.in_progress.get(task_id) {
                let bulk_id = dispatch.task.bulk_id.clone();
                state.cancelled.insert(task_id.to_string());
                (bulk_id, true)
            } else if let Some(task) = state.remove_queued(task_id) {
                self.remove_row(task_id);
                (task.bulk_id, false)
            } else if state.retry_waiting.contains(task_id) {
                state.cancelled.insert(task_id.to_string());
                let bulk_id = self.store.get(task_id).ok().flatten().and_then(|t| t.bulk_id);
                self.remove_row(task_id);
                (bulk_id, false)
            } else {
                match self.store.get(task_id) {
                    Ok(Some(task)) if task.status == TaskStatus::Pending => {
                        if state.announcing.contains(task_id) {
                            state.cancelled.insert(task_id.to_string());
                        }
                        self.remove_row(task_id);
                        (task.bulk_id, false)
                    }
                    Ok(_) => {
                        debug!(%task_id, "TaskScheduler::cancel_task: nothing to cancel");
                        return false;
                    }
                    Err(e) => {
                        warn!(%task_id, error = %e, "Failed to look up task for cancellation");
                        return false;
                    }
                }
            }
        };

        self.state().stats.total_cancelled += 1;
        info!(%task_id, in_flight, "Task cancelled");
        self.events.publish(Event::TaskCancelled {
            task_id: task_id.to_string(),
            bulk_id,
            in_flight,
        });
        true
    }

    fn remove_row(&self, task_id: &str) {
        if let Err(e) = self.store.remove(task_id) {
            error!(%task_id, error = %e, "Failed to delete cancelled task row");
        }
    }

    /// Hold back queued tasks of a bulk; returns false if already paused
    pub fn pause_bulk(&self, bulk_id: &str) -> bool {
        debug!(%bulk_id, "TaskScheduler::pause_bulk: called");
        self.state().paused_bulks.insert(bulk_id.to_string())
    }

    /// Release a paused bulk; returns false if it was not paused
    pub fn resume_bulk(&self, bulk_id: &str) -> bool {
        debug!(%bulk_id, "TaskScheduler::resume_bulk: called");
        let removed = self.state().paused_bulks.remove(bulk_id);
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    // === Introspection ===

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn is_bulk_paused(&self, bulk_id: &str) -> bool {
        self.state().paused_bulks.contains(bulk_id)
    }

    pub fn queue_state(&self) -> QueueState {
        let state = self.state();
        QueueState {
            running: state.running,
            paused: state.paused,
            queued: state.queue.len(),
            in_progress: state.in_progress.len(),
            retry_waiting: state.retry_waiting.len(),
            paused_bulks: state.paused_bulks.len(),
            stats: state.stats.clone(),
        }
    }

    /// Queued task ids in dispatch order
    pub fn queued_ids(&self) -> Vec<TaskId> {
        dispatch_order(self.state().queue.iter())
    }

    /// Ids of tasks currently executing
    pub fn in_progress_ids(&self) -> Vec<TaskId> {
        self.state().in_progress.keys().cloned().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.state().stats.clone()
    }

    // === Worker loop ===

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("Scheduler loop started");

        loop {
            match self.next_step() {
                Step::Exit => break,
                Step::Dispatch { dispatches, batch } => {
                    if batch {
                        self.events.publish(Event::BatchStarted {
                            task_ids: dispatches.iter().map(|d| d.task.id.clone()).collect(),
                        });
                    }
                    for dispatch in dispatches {
                        self.events.publish(Event::task_started(&dispatch.task));
                        self.spawn_execution(dispatch);
                    }
                }
                Step::Idle => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.idle_interval()) => {}
                    }
                }
                Step::Empty => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval()) => {
                            self.rescan_store();
                        }
                    }
                }
            }
        }

        info!("Scheduler loop exited");
    }

    /// Decide the next loop action and mark dispatched tasks InProgress
    fn next_step(&self) -> Step {
        let mut state = self.state();
        if !state.running {
            return Step::Exit;
        }
        if state.paused {
            return Step::Idle;
        }

        let active = state.in_progress.len();
        if active >= self.config.max_concurrency {
            return Step::Idle;
        }

        let batch = self.config.batch_mode && active == 0;
        let limit = if batch { self.config.batch_size.max(1) } else { 1 };
        let tasks = state.pop_dispatchable(limit);
        if tasks.is_empty() {
            return Step::Empty;
        }

        let started_at = now_ms();
        let mut dispatches = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(started_at);
            let update = TaskUpdate::status(TaskStatus::InProgress).with_started_at(Some(started_at));
            if let Err(e) = self.store.update(&task.id, &update) {
                warn!(task_id = %task.id, error = %e, "Failed to mark task in progress, running anyway");
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            let dispatch = Dispatch { generation, task };
            state.in_progress.insert(dispatch.task.id.clone(), dispatch.clone());
            dispatches.push(dispatch);
        }

        state.stats.total_dispatched += dispatches.len() as u64;
        state.stats.peak_concurrent = state.stats.peak_concurrent.max(state.in_progress.len());
        if batch {
            state.stats.total_batches += 1;
        }
        debug!(count = dispatches.len(), batch, "TaskScheduler::next_step: dispatching");
        Step::Dispatch { dispatches, batch }
    }

    /// Enqueue Pending rows the scheduler does not know about yet
    fn rescan_store(&self) {
        let loaded = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            self.load_pending(&mut state)
        };
        if loaded > 0 {
            info!(loaded, "Picked up pending tasks from store");
        }
    }

    fn load_pending(&self, state: &mut SchedulerState) -> usize {
        let pending = match self.store.get_pending(self.config.load_limit) {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to load pending tasks");
                return 0;
            }
        };

        let mut loaded = 0;
        for task in pending {
            if state.is_known(&task.id) || state.cancelled.contains(&task.id) {
                continue;
            }
            state.push(task);
            loaded += 1;
        }
        loaded
    }

    fn spawn_execution(self: &Arc<Self>, dispatch: Dispatch) {
        let scheduler = Arc::clone(self);
        let Dispatch { generation, task } = dispatch;
        tokio::spawn(async move {
            let started = Instant::now();
            let dispatcher = Arc::clone(&scheduler.dispatcher);
            let run_task = task.clone();
            // Inner task so a panicking handler surfaces as a JoinError
            let result = match tokio::spawn(async move { dispatcher.execute(&run_task).await }).await {
                Ok(result) => result,
                Err(e) => Err(eyre!("Handler for {} panicked: {}", task.operation, e)),
            };
            scheduler.finish(task, generation, result, started.elapsed());
        });
    }

    /// Apply a handler result: the single transition path for finished work
    ///
    /// Only the dispatch that owns the in-progress entry clears it; a run that
    /// outlived a stop still has its result applied.
    fn finish(self: &Arc<Self>, mut task: Task, generation: u64, result: eyre::Result<Value>, elapsed: Duration) {
        debug!(task_id = %task.id, generation, ok = result.is_ok(), "TaskScheduler::finish: called");

        let (event, retry) = {
            let mut state = self.state();
            let current = state
                .in_progress
                .get(&task.id)
                .is_some_and(|dispatch| dispatch.generation == generation);
            let cancelled = if current {
                state.in_progress.remove(&task.id);
                state.cancelled.remove(&task.id)
            } else {
                debug!(task_id = %task.id, generation, "TaskScheduler::finish: stale dispatch");
                state.cancelled.contains(&task.id)
            };

            match result {
                Ok(output) => {
                    let completed_at = now_ms();
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(completed_at);
                    let update = TaskUpdate::status(TaskStatus::Completed).with_completed_at(Some(completed_at));
                    if let Err(e) = self.store.update(&task.id, &update) {
                        error!(task_id = %task.id, error = %e, "Failed to persist completion");
                    }
                    state.stats.total_completed += 1;
                    info!(task_id = %task.id, subject = %task.subject_id, operation = %task.operation, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                    (Event::task_completed(&task, output, elapsed.as_millis() as u64), None)
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    task.retries += 1;
                    task.last_error = Some(message.clone());

                    if task.retries >= self.config.max_retries || cancelled {
                        let completed_at = now_ms();
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(completed_at);
                        let update = TaskUpdate::status(TaskStatus::Failed)
                            .with_retries(task.retries)
                            .with_error(message.as_str())
                            .with_completed_at(Some(completed_at));
                        if let Err(e) = self.store.update(&task.id, &update) {
                            error!(task_id = %task.id, error = %e, "Failed to persist failure");
                        }
                        state.stats.total_failed += 1;
                        warn!(task_id = %task.id, retries = task.retries, cancelled, error = %message, "Task failed");
                        (Event::task_failed(&task, &message), None)
                    } else {
                        task.status = TaskStatus::Pending;
                        task.priority = task.priority.saturating_add(1);
                        task.started_at = None;
                        let update = TaskUpdate::status(TaskStatus::Pending)
                            .with_retries(task.retries)
                            .with_priority(task.priority)
                            .with_error(message.as_str())
                            .with_started_at(None);
                        if let Err(e) = self.store.update(&task.id, &update) {
                            error!(task_id = %task.id, error = %e, "Failed to persist retry");
                        }
                        state.stats.total_retries += 1;

                        // A stopped scheduler leaves the row Pending for the next start
                        let retry = if state.running && !state.is_known(&task.id) {
                            state.retry_waiting.insert(task.id.clone());
                            Some(task.clone())
                        } else {
                            None
                        };
                        warn!(task_id = %task.id, retries = task.retries, next_priority = task.priority, error = %message, "Task failed, retry scheduled");
                        let event = Event::task_retry_scheduled(&task, &message, self.config.retry_delay_ms);
                        (event, retry)
                    }
                }
            }
        };

        self.wake.notify_one();
        self.events.publish(event);
        if let Some(task) = retry {
            self.spawn_retry_timer(task);
        }
    }

    fn spawn_retry_timer(self: &Arc<Self>, task: Task) {
        let scheduler = Arc::clone(self);
        let delay = self.config.retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.requeue_after_backoff(task);
        });
    }

    fn requeue_after_backoff(&self, task: Task) {
        {
            let mut state = self.state();
            state.retry_waiting.remove(&task.id);
            if state.cancelled.remove(&task.id) {
                debug!(task_id = %task.id, "TaskScheduler::requeue_after_backoff: cancelled while waiting");
                return;
            }
            if !state.running {
                debug!(task_id = %task.id, "TaskScheduler::requeue_after_backoff: stopped, row stays pending");
                return;
            }
            if state.is_known(&task.id) {
                return;
            }
            debug!(task_id = %task.id, priority = task.priority, "TaskScheduler::requeue_after_backoff: re-enqueuing");
            state.push(task);
        }
        self.wake.notify_one();
    }
}
