//! QueueDaemon - persistent prioritized task scheduler
//!
//! CLI entry point for running the scheduler and inspecting its store.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use queuedaemon::bulk::{BulkAggregator, BulkOperation, BulkPersistence, BulkStatus};
use queuedaemon::cli::{BulkCommand, Cli, Command};
use queuedaemon::config::Config;
use queuedaemon::events::{EVENTS_FILE, EventLogger, create_event_bus, read_events, tracing_observer};
use queuedaemon::operations::OperationDispatcher;
use queuedaemon::scheduler::{NewTask, TaskScheduler};
use queuestore::{BlobStore, Params, SqliteTaskStore, TaskFilter, TaskStatus, TaskStore};

fn setup_logging(log_dir: &Path, cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    fs::create_dir_all(log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    // Append: `qd add` may log while `qd run` is writing the same file
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("queuedaemon.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<SqliteTaskStore>> {
    let db_path = config.storage.db_path();
    let store =
        SqliteTaskStore::open(&db_path).context(format!("Failed to open database {}", db_path.display()))?;
    Ok(Arc::new(store))
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn colored_task_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().yellow(),
        TaskStatus::InProgress => status.as_str().cyan(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Failed => status.as_str().red(),
    }
}

fn colored_bulk_status(status: BulkStatus) -> ColoredString {
    match status {
        BulkStatus::Pending => status.as_str().yellow(),
        BulkStatus::InProgress => status.as_str().cyan(),
        BulkStatus::Paused => status.as_str().magenta(),
        BulkStatus::Completed => status.as_str().green(),
        BulkStatus::Failed => status.as_str().red(),
        BulkStatus::PartiallyCompleted => status.as_str().bright_red(),
    }
}

async fn cmd_run(config: &Config) -> Result<()> {
    debug!("cmd_run: called");
    let store = open_store(config)?;
    let bus = create_event_bus();

    let logger = Arc::new(EventLogger::in_data_dir(&config.storage.data_dir)?);
    info!(path = %logger.path().display(), "Event log attached");
    logger.attach(&bus);
    bus.register_callback(tracing_observer());

    let dispatcher = config.operations.build_dispatcher();
    if dispatcher.operations().is_empty() {
        warn!("No operations configured; every task will fail as unknown");
    }
    info!(operations = ?dispatcher.operations(), "Operations registered");

    let scheduler = TaskScheduler::new(config.scheduler.clone(), store.clone(), Arc::new(dispatcher), bus);
    let blobs: Arc<dyn BlobStore> = store;
    let aggregator = BulkAggregator::new(scheduler.clone(), Some(blobs), config.bulk.clone());
    info!(bulks = aggregator.list_bulk_tasks().len(), "Bulk aggregator ready");

    scheduler.start();
    println!(
        "{} Scheduler running (db: {}). Press Ctrl+C to stop.",
        "✓".green(),
        config.storage.db_path().display()
    );

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        warn!("Ctrl+C received");
    }

    info!("Scheduler shutting down...");
    scheduler.stop().await;
    let stats = scheduler.stats();
    info!(?stats, "Scheduler stopped");
    println!(
        "Stopped: {} completed, {} failed, {} retries",
        stats.total_completed, stats.total_failed, stats.total_retries
    );
    Ok(())
}

fn cmd_add(
    config: &Config,
    subject: String,
    operation: String,
    params: Vec<(String, serde_json::Value)>,
    priority: Option<i32>,
) -> Result<()> {
    debug!(%subject, %operation, ?priority, "cmd_add: called");
    let store = open_store(config)?;
    let bus = create_event_bus();
    let logger = Arc::new(EventLogger::in_data_dir(&config.storage.data_dir)?);
    logger.attach(&bus);

    // Not started: the task is persisted and a running daemon picks it up on rescan
    let scheduler = TaskScheduler::new(
        config.scheduler.clone(),
        store.clone(),
        Arc::new(OperationDispatcher::new()),
        bus,
    );

    let mut new = NewTask::new(subject, operation).with_params(params.into_iter().collect::<Params>());
    if let Some(priority) = priority {
        new = new.with_priority(priority);
    }
    let id = scheduler.add_task(new);

    let task = store.get(&id)?.ok_or_else(|| eyre!("Task {} was not persisted", id))?;
    println!(
        "{} Queued task: {} ({} {}, priority {}, {})",
        "✓".green(),
        id.cyan(),
        task.operation,
        task.subject_id,
        task.priority,
        colored_task_status(task.status)
    );
    Ok(())
}

fn cmd_list(config: &Config, status: Option<TaskStatus>, limit: usize) -> Result<()> {
    debug!(?status, limit, "cmd_list: called");
    let store = open_store(config)?;
    let tasks = store.list(&TaskFilter {
        status,
        limit: Some(limit),
        ..Default::default()
    })?;

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{} {:<12} {:<20} {:<18} p{} r{} {}",
            task.id.dimmed(),
            colored_task_status(task.status),
            task.subject_id,
            task.operation,
            task.priority,
            task.retries,
            task.last_error.as_deref().unwrap_or("").red()
        );
    }
    Ok(())
}

fn load_bulks(config: &Config) -> Result<Vec<BulkOperation>> {
    let store = open_store(config)?;
    let mut bulks = BulkPersistence::new(store).load_all()?;
    bulks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(bulks)
}

fn cmd_bulk_list(config: &Config) -> Result<()> {
    debug!("cmd_bulk_list: called");
    let bulks = load_bulks(config)?;
    if bulks.is_empty() {
        println!("No bulk operations found");
        return Ok(());
    }
    for bulk in bulks {
        println!(
            "{} {:<20} {:<10} {:>5.1}% {}/{} done, {} failed  {}",
            bulk.id.dimmed(),
            colored_bulk_status(bulk.status),
            bulk.operation_type,
            bulk.progress() * 100.0,
            bulk.counters.finished(),
            bulk.counters.total,
            bulk.counters.failed,
            bulk.description
        );
    }
    Ok(())
}

fn cmd_bulk_show(config: &Config, id: &str) -> Result<()> {
    debug!(id, "cmd_bulk_show: called");
    let bulk = load_bulks(config)?
        .into_iter()
        .find(|b| b.id == id)
        .ok_or_else(|| eyre!("Bulk operation not found: {}", id))?;

    println!("Bulk: {}", bulk.id.cyan());
    println!("  Type:        {}", bulk.operation_type);
    println!("  Description: {}", bulk.description);
    println!("  Status:      {}", colored_bulk_status(bulk.status));
    println!("  Priority:    {}", bulk.priority);
    println!(
        "  Progress:    {:.1}% ({} pending, {} running, {} completed, {} failed of {})",
        bulk.progress() * 100.0,
        bulk.counters.pending,
        bulk.counters.in_progress,
        bulk.counters.completed,
        bulk.counters.failed,
        bulk.counters.total
    );
    if let Some(eta) = bulk.estimated_time_remaining_ms {
        println!("  ETA:         {}s", eta / 1000);
    }
    println!("  Created:     {}", format_ms(Some(bulk.created_at)));
    println!("  Started:     {}", format_ms(bulk.started_at));
    println!("  Completed:   {}", format_ms(bulk.completed_at));

    if !bulk.members.is_empty() {
        println!("  Tasks:");
        for (task_id, member) in &bulk.members {
            println!(
                "    {} {:<12} {} {}",
                task_id.dimmed(),
                colored_task_status(member.status),
                member.operation,
                member.subject_id
            );
        }
    }
    if !bulk.messages.is_empty() {
        println!("  Messages:");
        for message in &bulk.messages {
            println!("    {} {}", format_ms(Some(message.at)), message.message);
        }
    }
    Ok(())
}

fn cmd_events(config: &Config, tail: usize) -> Result<()> {
    debug!(tail, "cmd_events: called");
    let entries = read_events(config.storage.data_dir.join(EVENTS_FILE))?;
    let skip = entries.len().saturating_sub(tail);
    for entry in entries.into_iter().skip(skip) {
        let data = serde_json::to_string(&entry.event)?;
        println!(
            "{} {:<22} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
            entry.event.event_type().cyan(),
            data
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(
        &config.storage.log_dir(),
        cli.log_level.as_deref(),
        config.log_level.as_deref(),
    )
    .context("Failed to setup logging")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run => {
            debug!("main: matched Run command");
            cmd_run(&config).await
        }
        Command::Add {
            subject,
            operation,
            params,
            priority,
        } => {
            debug!("main: matched Add command");
            cmd_add(&config, subject, operation, params, priority)
        }
        Command::List { status, limit } => {
            debug!("main: matched List command");
            cmd_list(&config, status, limit)
        }
        Command::Bulk { command } => match command {
            BulkCommand::List => {
                debug!("main: matched BulkCommand::List");
                cmd_bulk_list(&config)
            }
            BulkCommand::Show { id } => {
                debug!("main: matched BulkCommand::Show");
                cmd_bulk_show(&config, &id)
            }
        },
        Command::Events { tail } => {
            debug!("main: matched Events command");
            cmd_events(&config, tail)
        }
    }
}
