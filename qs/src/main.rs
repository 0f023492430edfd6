use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::info;
use tracing_subscriber::EnvFilter;

use queuestore::cli::{Cli, Command};
use queuestore::{SqliteTaskStore, Task, TaskFilter, TaskStatus, TaskStore, TaskUpdate};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn colored_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().yellow(),
        TaskStatus::InProgress => status.as_str().cyan(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Failed => status.as_str().red(),
    }
}

fn print_task(task: &Task) {
    println!("Task: {}", task.id.cyan());
    println!("  Subject:   {}", task.subject_id);
    println!("  Operation: {}", task.operation);
    println!("  Status:    {}", colored_status(task.status));
    println!("  Priority:  {}", task.priority);
    println!("  Retries:   {}", task.retries);
    if let Some(bulk_id) = &task.bulk_id {
        println!("  Bulk:      {}", bulk_id);
    }
    println!("  Created:   {}", format_ms(Some(task.created_at)));
    println!("  Started:   {}", format_ms(task.started_at));
    println!("  Completed: {}", format_ms(task.completed_at));
    if let Some(err) = &task.last_error {
        println!("  Error:     {}", err.red());
    }
    if !task.params.is_empty() {
        println!("  Params:");
        for (key, value) in &task.params {
            println!("    {} = {}", key, value);
        }
    }
}

fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let store = SqliteTaskStore::open(&cli.db).context(format!("Failed to open database {}", cli.db.display()))?;
    info!(db = %cli.db.display(), "queuestore opened");

    match cli.command {
        Command::List {
            status,
            operation,
            limit,
        } => {
            let tasks = store.list(&TaskFilter {
                status,
                operation,
                bulk_id: None,
                limit: Some(limit),
            })?;
            if tasks.is_empty() {
                println!("No tasks found");
            }
            for task in tasks {
                println!(
                    "{} {:<12} {:<20} {:<18} p{} r{}",
                    task.id.dimmed(),
                    colored_status(task.status),
                    task.subject_id,
                    task.operation,
                    task.priority,
                    task.retries
                );
            }
        }
        Command::Show { id } => {
            let task = store.get(&id)?.ok_or_else(|| eyre!("Task not found: {}", id))?;
            print_task(&task);
        }
        Command::Stats => {
            let counts = store.count_by_status()?;
            let total: usize = counts.values().sum();
            for status in [
                TaskStatus::Pending,
                TaskStatus::InProgress,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ] {
                println!("{:<12} {}", colored_status(status), counts.get(&status).copied().unwrap_or(0));
            }
            println!("{:<12} {}", "total", total);
        }
        Command::Requeue { id } => {
            let task = store.get(&id)?.ok_or_else(|| eyre!("Task not found: {}", id))?;
            if task.status != TaskStatus::Failed {
                return Err(eyre!("Task {} is {}, only failed tasks can be requeued", id, task.status));
            }
            store
                .update(
                    &id,
                    &TaskUpdate::status(TaskStatus::Pending)
                        .with_retries(0)
                        .with_started_at(None)
                        .with_completed_at(None),
                )
                .context("Requeue failed (an active task with the same subject and operation may exist)")?;
            println!("{} Requeued task: {}", "✓".green(), id.cyan());
        }
    }

    Ok(())
}
