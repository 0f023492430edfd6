//! Crash recovery
//!
//! Rows left InProgress by an unclean exit are put back to Pending so the
//! next load picks them up again (at-least-once execution).

use std::collections::HashSet;

use queuestore::{StoreResult, TaskFilter, TaskId, TaskStatus, TaskStore, TaskUpdate};
use tracing::{debug, info, warn};

/// Recovery statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryStats {
    /// Rows demoted from InProgress to Pending
    pub demoted: usize,
    /// InProgress rows left alone because this process is running them
    pub in_flight: usize,
    /// Rows that could not be updated
    pub errors: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "demoted: {}, in-flight: {}, errors: {}",
            self.demoted, self.in_flight, self.errors
        )
    }
}

/// Demote interrupted InProgress rows that are not in flight in this process
pub fn recover_interrupted(store: &dyn TaskStore, in_flight: &HashSet<TaskId>) -> StoreResult<RecoveryStats> {
    debug!(in_flight = in_flight.len(), "recover_interrupted: called");
    let mut stats = RecoveryStats::default();

    let interrupted = store.list(&TaskFilter {
        status: Some(TaskStatus::InProgress),
        ..Default::default()
    })?;

    for task in interrupted {
        if in_flight.contains(&task.id) {
            stats.in_flight += 1;
            continue;
        }
        let update = TaskUpdate::status(TaskStatus::Pending).with_started_at(None);
        match store.update(&task.id, &update) {
            Ok(()) => {
                debug!(task_id = %task.id, subject = %task.subject_id, operation = %task.operation, "Recovered interrupted task");
                stats.demoted += 1;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to recover interrupted task");
                stats.errors += 1;
            }
        }
    }

    if stats.demoted > 0 || stats.errors > 0 {
        info!(%stats, "Crash recovery complete");
    }
    Ok(stats)
}
