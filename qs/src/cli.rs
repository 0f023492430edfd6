//! CLI argument parsing for queuestore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::task::TaskStatus;

#[derive(Parser, Debug)]
#[command(name = "qs")]
#[command(author, version, about = "Inspect and repair a queuedaemon task database", long_about = None)]
pub struct Cli {
    /// Path to the SQLite database
    #[arg(short, long, env = "QS_DB", default_value = "queue.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List task rows
    List {
        /// Only rows with this status
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Only rows for this operation
        #[arg(short, long)]
        operation: Option<String>,

        /// Maximum rows to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show one task row in full
    Show {
        #[arg(required = true)]
        id: String,
    },

    /// Row counts per status
    Stats,

    /// Put a failed row back to pending with its retry count reset
    Requeue {
        #[arg(required = true)]
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_with_status() {
        let cli = Cli::try_parse_from(["qs", "--db", "/tmp/q.db", "list", "--status", "failed"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/q.db"));
        match cli.command {
            Command::List { status, limit, .. } => {
                assert_eq!(status, Some(TaskStatus::Failed));
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_status() {
        assert!(Cli::try_parse_from(["qs", "list", "--status", "exploded"]).is_err());
    }

    #[test]
    fn test_parse_requeue() {
        let cli = Cli::try_parse_from(["qs", "requeue", "abc"]).unwrap();
        assert!(matches!(cli.command, Command::Requeue { id } if id == "abc"));
    }
}
