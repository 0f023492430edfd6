//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use queuestore::TaskStatus;
use serde_json::Value;
use std::path::PathBuf;

/// QueueDaemon - persistent prioritized task scheduler
#[derive(Parser)]
#[command(
    name = "qd",
    about = "Persistent, prioritized, retrying task scheduler",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler until SIGINT or SIGTERM
    Run,

    /// Queue a task
    Add {
        /// Subject the operation applies to (page id, document id, ...)
        subject: String,

        /// Operation name
        operation: String,

        /// Parameter as key=value; values are parsed as JSON when possible
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Priority, smaller runs first
        #[arg(long)]
        priority: Option<i32>,
    },

    /// List tasks in the store
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Inspect bulk operations
    Bulk {
        #[command(subcommand)]
        command: BulkCommand,
    },

    /// Show the most recent entries of the event log
    Events {
        #[arg(short = 'n', long, default_value = "20")]
        tail: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum BulkCommand {
    /// List bulk operations
    List,

    /// Show one bulk operation with its members and messages
    Show {
        #[arg(required = true)]
        id: String,
    },
}

/// Parse `key=value`; the value is JSON if it parses, otherwise a string
pub fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter '{}', expected key=value", s))?;
    if key.is_empty() {
        return Err(format!("Invalid parameter '{}', empty key", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
