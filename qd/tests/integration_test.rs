//! Integration tests for QueueDaemon
//!
//! These tests run the real scheduler loop against in-memory and SQLite
//! stores and observe it through the store, the event bus and the bulk
//! aggregator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::eyre;
use queuedaemon::bulk::{BulkAggregator, BulkConfig, BulkItem, BulkOperationType, BulkStatus};
use queuedaemon::events::{EVENTS_FILE, Event, EventBus, EventLogger, read_events};
use queuedaemon::operations::{FnHandler, OperationDispatcher};
use queuedaemon::scheduler::{NewTask, SchedulerConfig, TaskScheduler};
use queuestore::{MemoryTaskStore, Params, SqliteTaskStore, Task, TaskFilter, TaskStatus, TaskStore};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency: 1,
        max_retries: 3,
        retry_delay_ms: 10,
        poll_interval_ms: 20,
        idle_interval_ms: 5,
        stop_timeout_ms: 1000,
        ..Default::default()
    }
}

fn build_scheduler(
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    dispatcher: OperationDispatcher,
) -> (Arc<TaskScheduler>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let scheduler = TaskScheduler::new(config, store, Arc::new(dispatcher), bus.clone());
    (scheduler, bus)
}

fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.register_callback(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    seen
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn status_of(store: &dyn TaskStore, id: &str) -> Option<TaskStatus> {
    store.get(id).unwrap().map(|t| t.status)
}

// =============================================================================
// Scheduler Tests
// =============================================================================

#[tokio::test]
async fn test_retries_increment_until_terminal_failure() {
    let store = Arc::new(MemoryTaskStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register(
        "ocr",
        FnHandler::new(move |_task: Task| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<serde_json::Value, _>(eyre!("engine unavailable")) }
        }),
    );
    let (scheduler, bus) = build_scheduler(fast_config(), store.clone(), dispatcher);
    let events = record_events(&bus);

    let id = scheduler.add_task(NewTask::new("page-1", "ocr").with_priority(2));
    scheduler.start();
    wait_until("terminal failure", || status_of(store.as_ref(), &id) == Some(TaskStatus::Failed)).await;
    scheduler.stop().await;

    let task = store.get(&id).unwrap().unwrap();
    assert_eq!(task.retries, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(task.priority, 4);
    assert!(task.last_error.unwrap().contains("engine unavailable"));

    let events = events.lock().unwrap();
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Event::TaskRetryScheduled { retries, .. } => Some(*retries),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    assert_eq!(events.iter().filter(|e| e.event_type() == "task_failed").count(), 1);
}

#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let store = Arc::new(MemoryTaskStore::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register(
        "segment",
        FnHandler::new(move |task: Task| {
            sink.lock().unwrap().push(task.subject_id.clone());
            async { Ok(json!({})) }
        }),
    );
    let (scheduler, _bus) = build_scheduler(fast_config(), store.clone(), dispatcher);

    for (subject, priority) in [("p3", 3), ("p1", 1), ("p2", 2)] {
        scheduler.add_task(NewTask::new(subject, "segment").with_priority(priority));
    }
    scheduler.start();
    wait_until("all three dispatched", || order.lock().unwrap().len() == 3).await;
    scheduler.stop().await;

    assert_eq!(*order.lock().unwrap(), vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn test_pause_is_idempotent_and_holds_dispatch() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("ocr", FnHandler::new(|_task: Task| async { Ok(json!("text")) }));
    let (scheduler, bus) = build_scheduler(fast_config(), store.clone(), dispatcher);
    let events = record_events(&bus);

    scheduler.start();
    assert!(scheduler.pause());
    assert!(!scheduler.pause());
    assert!(scheduler.is_paused());

    let id = scheduler.add_task(NewTask::new("page-9", "ocr"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status_of(store.as_ref(), &id), Some(TaskStatus::Pending));
    assert_eq!(scheduler.queued_ids(), vec![id.clone()]);

    assert!(scheduler.resume());
    assert!(!scheduler.resume());
    wait_until("completion after resume", || {
        status_of(store.as_ref(), &id) == Some(TaskStatus::Completed)
    })
    .await;
    scheduler.stop().await;

    let events = events.lock().unwrap();
    assert_eq!(events.iter().filter(|e| **e == Event::ServicePaused).count(), 1);
    assert_eq!(events.iter().filter(|e| **e == Event::ServiceResumed).count(), 1);
}

#[tokio::test]
async fn test_in_flight_cancel_prevents_retry() {
    let store = Arc::new(MemoryTaskStore::new());
    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register(
        "extract_articles",
        FnHandler::new(move |_task: Task| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Err::<serde_json::Value, _>(eyre!("layout not recognised"))
            }
        }),
    );
    let (scheduler, bus) = build_scheduler(fast_config(), store.clone(), dispatcher);
    let events = record_events(&bus);

    let id = scheduler.add_task(NewTask::new("page-4", "extract_articles"));
    scheduler.start();
    wait_until("task in flight", || scheduler.in_progress_ids().contains(&id)).await;

    assert!(scheduler.cancel_task(&id));
    release.notify_one();
    wait_until("failure", || status_of(store.as_ref(), &id) == Some(TaskStatus::Failed)).await;

    // Longer than the backoff: nothing may bring it back
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(status_of(store.as_ref(), &id), Some(TaskStatus::Failed));
    assert!(scheduler.queued_ids().is_empty());
    assert_eq!(store.get(&id).unwrap().unwrap().retries, 1);
    scheduler.stop().await;

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, Event::TaskCancelled { in_flight: true, .. })));
    assert!(!events.iter().any(|e| e.event_type() == "task_retry_scheduled"));
}

#[tokio::test]
async fn test_stop_demotes_in_flight_and_restart_redispatches() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(SqliteTaskStore::open(temp_dir.path().join("queue.db")).unwrap());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register(
        "ocr",
        FnHandler::new(move |_task: Task| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                Ok(json!({ "attempt": attempt }))
            }
        }),
    );
    let (scheduler, _bus) = build_scheduler(fast_config(), store.clone(), dispatcher);

    let id = scheduler.add_task(NewTask::new("page-7", "ocr"));
    scheduler.start();
    wait_until("task in flight", || scheduler.in_progress_ids().contains(&id)).await;
    assert_eq!(status_of(store.as_ref(), &id), Some(TaskStatus::InProgress));

    assert!(scheduler.stop().await);
    assert!(!scheduler.stop().await);
    assert_eq!(status_of(store.as_ref(), &id), Some(TaskStatus::Pending));
    assert!(scheduler.in_progress_ids().is_empty());

    assert!(scheduler.start());
    wait_until("completion after restart", || {
        status_of(store.as_ref(), &id) == Some(TaskStatus::Completed)
    })
    .await;
    scheduler.stop().await;

    assert!(attempts.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_duplicate_add_leaves_one_active_row() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(SqliteTaskStore::open(temp_dir.path().join("queue.db")).unwrap());
    let (scheduler, _bus) = build_scheduler(fast_config(), store.clone(), OperationDispatcher::new());

    let first = scheduler.add_task(NewTask::new("p1", "ocr"));
    let second = scheduler.add_task(NewTask::new("p1", "ocr").with_priority(1));
    let other = scheduler.add_task(NewTask::new("p1", "segment"));

    assert_eq!(first, second);
    assert_ne!(first, other);
    let pending = store
        .list(&TaskFilter {
            status: Some(TaskStatus::Pending),
            operation: Some("ocr".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, 5);
}

#[tokio::test]
async fn test_unknown_operation_is_retried_then_failed() {
    let store = Arc::new(MemoryTaskStore::new());
    let (scheduler, _bus) = build_scheduler(fast_config(), store.clone(), OperationDispatcher::new());

    let id = scheduler.add_task(NewTask::new("page-1", "translate"));
    scheduler.start();
    wait_until("failure", || status_of(store.as_ref(), &id) == Some(TaskStatus::Failed)).await;
    scheduler.stop().await;

    let task = store.get(&id).unwrap().unwrap();
    assert!(task.last_error.unwrap().contains("Unknown operation: translate"));
}

#[tokio::test]
async fn test_pending_rows_added_elsewhere_are_picked_up() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("ocr", FnHandler::new(|_task: Task| async { Ok(json!(null)) }));
    let (scheduler, _bus) = build_scheduler(fast_config(), store.clone(), dispatcher);
    scheduler.start();

    // Written straight to the store, as another process would
    let task = Task::new("page-2", "ocr");
    store.add(&task).unwrap();

    wait_until("rescan pickup", || {
        status_of(store.as_ref(), &task.id) == Some(TaskStatus::Completed)
    })
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_batch_mode_dispatches_together() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("index", FnHandler::new(|_task: Task| async { Ok(json!({})) }));
    let config = SchedulerConfig {
        max_concurrency: 4,
        batch_mode: true,
        batch_size: 3,
        ..fast_config()
    };
    let (scheduler, bus) = build_scheduler(config, store.clone(), dispatcher);
    let events = record_events(&bus);

    for n in 0..3 {
        scheduler.add_task(NewTask::new(format!("doc-{}", n), "index"));
    }
    scheduler.start();
    wait_until("three completions", || scheduler.stats().total_completed == 3).await;
    scheduler.stop().await;

    let events = events.lock().unwrap();
    let batch = events
        .iter()
        .find_map(|e| match e {
            Event::BatchStarted { task_ids } => Some(task_ids.len()),
            _ => None,
        })
        .expect("batch_started published");
    assert_eq!(batch, 3);
}

// =============================================================================
// Bulk Tests
// =============================================================================

#[tokio::test]
async fn test_bulk_tracks_members_to_partial_completion_and_retry() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register(
        "ocr",
        FnHandler::new(|task: Task| async move {
            if task.subject_id == "blank" {
                Err(eyre!("no text found"))
            } else {
                Ok(json!({ "chars": 120 }))
            }
        }),
    );
    let config = SchedulerConfig {
        max_retries: 1,
        ..fast_config()
    };
    let (scheduler, _bus) = build_scheduler(config, store.clone(), dispatcher);
    let aggregator = BulkAggregator::new(scheduler.clone(), Some(store.clone()), BulkConfig::default());

    let bulk_id = aggregator.create_bulk_task(BulkOperationType::Ocr, "issue 1907-03", Params::new(), 3);
    let ids = aggregator.add_tasks_to_bulk(
        &bulk_id,
        vec![
            BulkItem::new("page-1", "ocr"),
            BulkItem::new("blank", "ocr"),
            BulkItem::new("page-3", "ocr"),
        ],
    );
    assert_eq!(ids.len(), 3);

    scheduler.start();
    wait_until("bulk settles", || {
        aggregator
            .get_bulk_task(&bulk_id)
            .is_some_and(|b| b.status.is_terminal())
    })
    .await;

    let bulk = aggregator.get_bulk_task(&bulk_id).unwrap();
    assert_eq!(bulk.status, BulkStatus::PartiallyCompleted);
    assert_eq!(bulk.counters.completed, 2);
    assert_eq!(bulk.counters.failed, 1);
    assert!(bulk.counters.is_consistent());
    assert_eq!(aggregator.progress(&bulk_id), Some(1.0));
    assert_eq!(bulk.estimated_time_remaining_ms, Some(0));

    assert_eq!(aggregator.retry_failed_tasks(&bulk_id), 1);
    wait_until("retried member fails again", || {
        aggregator
            .get_bulk_task(&bulk_id)
            .is_some_and(|b| b.status == BulkStatus::PartiallyCompleted)
    })
    .await;
    scheduler.stop().await;

    let bulk = aggregator.get_bulk_task(&bulk_id).unwrap();
    assert_eq!(bulk.counters.total, 3);
    assert!(!bulk.failed_task_ids.contains(&ids[1]));
    assert_eq!(bulk.failed_task_ids.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulk_completes_on_running_multi_thread_scheduler() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("ocr", FnHandler::new(|_task: Task| async { Ok(json!({ "chars": 80 })) }));
    let config = SchedulerConfig {
        max_concurrency: 4,
        ..fast_config()
    };
    let (scheduler, _bus) = build_scheduler(config, store.clone(), dispatcher);
    let aggregator = BulkAggregator::new(scheduler.clone(), Some(store.clone()), BulkConfig::default());
    scheduler.start();

    for round in 0..10 {
        let bulk_id = aggregator.create_bulk_task(BulkOperationType::Ocr, format!("issue {}", round), Params::new(), 5);
        let items = (0..30)
            .map(|page| BulkItem::new(format!("r{}-page-{}", round, page), "ocr"))
            .collect();
        let ids = aggregator.add_tasks_to_bulk(&bulk_id, items);
        assert_eq!(ids.len(), 30);

        wait_until("bulk completes", || {
            aggregator
                .get_bulk_task(&bulk_id)
                .is_some_and(|b| b.status == BulkStatus::Completed)
        })
        .await;

        let bulk = aggregator.get_bulk_task(&bulk_id).unwrap();
        assert_eq!(bulk.counters.completed, bulk.counters.total);
        assert_eq!(bulk.counters.total, 30);
        assert!(bulk.counters.is_consistent());
        assert!(ids.iter().all(|id| status_of(store.as_ref(), id) == Some(TaskStatus::Completed)));
    }
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_added_precedes_task_started_for_every_task() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("segment", FnHandler::new(|_task: Task| async { Ok(json!([])) }));
    let config = SchedulerConfig {
        max_concurrency: 4,
        ..fast_config()
    };
    let (scheduler, bus) = build_scheduler(config, store.clone(), dispatcher);
    let seen = record_events(&bus);
    scheduler.start();

    let ids: Vec<String> = (0..60)
        .map(|page| scheduler.add_task(NewTask::new(format!("page-{}", page), "segment")))
        .collect();
    wait_until("all segmented", || {
        ids.iter().all(|id| status_of(store.as_ref(), id) == Some(TaskStatus::Completed))
    })
    .await;
    scheduler.stop().await;

    let events = seen.lock().unwrap();
    for id in &ids {
        let added = events
            .iter()
            .position(|e| matches!(e, Event::TaskAdded { task_id, .. } if task_id == id));
        let started = events
            .iter()
            .position(|e| matches!(e, Event::TaskStarted { task_id, .. } if task_id == id));
        match (added, started) {
            (Some(added), Some(started)) => assert!(added < started, "task {} started before it was added", id),
            other => panic!("missing events for {}: {:?}", id, other),
        }
    }
}

#[tokio::test]
async fn test_paused_bulk_holds_back_members() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("segment", FnHandler::new(|_task: Task| async { Ok(json!([])) }));
    let (scheduler, _bus) = build_scheduler(fast_config(), store.clone(), dispatcher);
    let aggregator = BulkAggregator::new(scheduler.clone(), Some(store.clone()), BulkConfig::default());

    let bulk_id = aggregator.create_bulk_task(BulkOperationType::Segment, "volume 3", Params::new(), 5);
    assert!(aggregator.pause_bulk_task(&bulk_id));
    scheduler.start();
    let id = aggregator
        .add_task_to_bulk(&bulk_id, "page-1", "segment", Params::new())
        .unwrap();
    let loose = scheduler.add_task(NewTask::new("page-2", "segment"));

    wait_until("unrelated task completes", || {
        status_of(store.as_ref(), &loose) == Some(TaskStatus::Completed)
    })
    .await;
    assert_eq!(status_of(store.as_ref(), &id), Some(TaskStatus::Pending));
    assert_eq!(aggregator.get_bulk_task(&bulk_id).unwrap().status, BulkStatus::Paused);

    assert!(aggregator.resume_bulk_task(&bulk_id));
    wait_until("bulk completes", || {
        aggregator
            .get_bulk_task(&bulk_id)
            .is_some_and(|b| b.status == BulkStatus::Completed)
    })
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_cancel_bulk_with_running_scheduler() {
    let store = Arc::new(MemoryTaskStore::new());
    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register(
        "download",
        FnHandler::new(move |_task: Task| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(json!({}))
            }
        }),
    );
    let (scheduler, bus) = build_scheduler(fast_config(), store.clone(), dispatcher);
    let events = record_events(&bus);
    let aggregator = BulkAggregator::new(scheduler.clone(), Some(store.clone()), BulkConfig::default());

    let bulk_id = aggregator.create_bulk_task(BulkOperationType::Download, "feeds", Params::new(), 5);
    let ids = aggregator.add_tasks_to_bulk(
        &bulk_id,
        vec![BulkItem::new("feed-1", "download"), BulkItem::new("feed-2", "download")],
    );
    scheduler.start();
    wait_until("first member in flight", || !scheduler.in_progress_ids().is_empty()).await;

    assert!(aggregator.cancel_bulk_task(&bulk_id));
    release.notify_one();
    wait_until("in-flight member finishes", || scheduler.in_progress_ids().is_empty()).await;
    scheduler.stop().await;

    let bulk = aggregator.get_bulk_task(&bulk_id).unwrap();
    assert_eq!(bulk.status, BulkStatus::Failed);
    assert!(bulk.is_cancelled);
    assert!(bulk.counters.is_consistent());
    assert_eq!(bulk.counters.total, 2);
    assert!(ids.iter().any(|id| store.get(id).unwrap().is_none()));

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::BulkTaskCancelled { cancelled_tasks: 2, .. }
    )));
}

// =============================================================================
// Event Log Tests
// =============================================================================

#[tokio::test]
async fn test_event_log_records_task_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(MemoryTaskStore::new());
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("ocr", FnHandler::new(|_task: Task| async { Ok(json!("text")) }));
    let (scheduler, bus) = build_scheduler(fast_config(), store.clone(), dispatcher);
    let logger = Arc::new(EventLogger::in_data_dir(temp_dir.path()).unwrap());
    logger.attach(&bus);

    let id = scheduler.add_task(NewTask::new("page-1", "ocr"));
    scheduler.start();
    wait_until("completion", || status_of(store.as_ref(), &id) == Some(TaskStatus::Completed)).await;
    scheduler.stop().await;

    let entries = read_events(temp_dir.path().join(EVENTS_FILE)).unwrap();
    let types: Vec<&str> = entries.iter().map(|e| e.event.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "task_added",
            "service_started",
            "task_started",
            "task_completed",
            "service_stopped"
        ]
    );
    assert_eq!(entries[2].event.task_id(), Some(id.as_str()));
}
