//! Task record and field updates

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque task identifier (UUIDv7 string)
pub type TaskId = String;

/// Task parameters, handed to the operation handler untouched
pub type Params = BTreeMap<String, Value>;

/// Priority given to tasks created without an explicit one
pub const DEFAULT_PRIORITY: i32 = 5;

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Column/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Pending or InProgress rows take part in the identity constraint
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "in-progress" | "running" => Ok(Self::InProgress),
            "completed" | "complete" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// One unit of work, identified by (subject id, operation name)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique row identifier
    pub id: TaskId,

    /// Domain entity the operation applies to (page, issue, document...)
    pub subject_id: String,

    /// Operation name resolved by the dispatcher at execution time
    pub operation: String,

    /// Free-form handler parameters
    #[serde(default)]
    pub params: Params,

    /// Smaller values are serviced first
    pub priority: i32,

    /// Number of failed attempts so far
    pub retries: u32,

    /// Error message of the most recent failed attempt
    pub last_error: Option<String>,

    pub status: TaskStatus,

    /// Owning bulk operation, if any
    pub bulk_id: Option<String>,

    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    /// Create a new pending task with default priority
    pub fn new(subject_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            subject_id: subject_id.into(),
            operation: operation.into(),
            params: Params::new(),
            priority: DEFAULT_PRIORITY,
            retries: 0,
            last_error: None,
            status: TaskStatus::Pending,
            bulk_id: None,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_bulk_id(mut self, bulk_id: Option<String>) -> Self {
        self.bulk_id = bulk_id;
        self
    }

    /// Identity key used for duplicate suppression
    pub fn identity(&self) -> (&str, &str) {
        (&self.subject_id, &self.operation)
    }

    /// Look up a string parameter
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Partial update of a task row; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub priority: Option<i32>,
    pub retries: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub started_at: Option<Option<i64>>,
    pub completed_at: Option<Option<i64>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn with_started_at(mut self, started_at: Option<i64>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_completed_at(mut self, completed_at: Option<i64>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply this update to an in-memory task
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(retries) = self.retries {
            task.retries = retries;
        }
        if let Some(last_error) = &self.last_error {
            task.last_error = last_error.clone();
        }
        if let Some(started_at) = self.started_at {
            task.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
    }
}
