//! Bulk operation aggregate and its status state machine

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use queuestore::{Params, TaskId, TaskStatus, now_ms};
use serde::{Deserialize, Serialize};

/// Kind of work a bulk operation groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperationType {
    Download,
    Ocr,
    Segment,
    Extract,
    Import,
    Export,
    Index,
}

impl BulkOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Ocr => "ocr",
            Self::Segment => "segment",
            Self::Extract => "extract",
            Self::Import => "import",
            Self::Export => "export",
            Self::Index => "index",
        }
    }
}

impl std::fmt::Display for BulkOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BulkOperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "download" => Ok(Self::Download),
            "ocr" => Ok(Self::Ocr),
            "segment" => Ok(Self::Segment),
            "extract" | "extract_articles" => Ok(Self::Extract),
            "import" => Ok(Self::Import),
            "export" => Ok(Self::Export),
            "index" => Ok(Self::Index),
            _ => Err(format!("Unknown bulk operation type: {}", s)),
        }
    }
}

/// Derived status of a bulk operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BulkStatus {
    #[default]
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl BulkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyCompleted => "partially_completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartiallyCompleted)
    }
}

impl std::fmt::Display for BulkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Member counters; the four buckets always sum to `total`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCounters {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BulkCounters {
    fn bucket_mut(&mut self, status: TaskStatus) -> &mut usize {
        match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
        }
    }

    /// Move one member between buckets; `None` adds, `to == None` removes
    pub fn shift(&mut self, from: Option<TaskStatus>, to: Option<TaskStatus>) {
        match from {
            Some(status) => {
                let bucket = self.bucket_mut(status);
                *bucket = bucket.saturating_sub(1);
            }
            None => self.total += 1,
        }
        match to {
            Some(status) => *self.bucket_mut(status) += 1,
            None => self.total = self.total.saturating_sub(1),
        }
    }

    /// Completed plus failed
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_consistent(&self) -> bool {
        self.pending + self.in_progress + self.completed + self.failed == self.total
    }
}

/// One task tracked by a bulk operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkMember {
    pub subject_id: String,
    pub operation: String,
    #[serde(default)]
    pub params: Params,
    pub status: TaskStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Timestamped audit line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub at: i64,
    pub message: String,
}

/// Input for adding several tasks to a bulk at once
#[derive(Debug, Clone)]
pub struct BulkItem {
    pub subject_id: String,
    pub operation: String,
    pub params: Params,
}

impl BulkItem {
    pub fn new(subject_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            operation: operation.into(),
            params: Params::new(),
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// A named aggregate over many tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperation {
    pub id: String,
    pub operation_type: BulkOperationType,
    pub description: String,
    #[serde(default)]
    pub params: Params,
    pub priority: i32,
    pub status: BulkStatus,
    pub counters: BulkCounters,
    #[serde(default)]
    pub failed_task_ids: BTreeSet<TaskId>,
    #[serde(default)]
    pub is_paused: bool,
    /// Sticky until failed members are retried
    #[serde(default)]
    pub is_cancelled: bool,
    #[serde(default)]
    pub members: BTreeMap<TaskId, BulkMember>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub processing_time_ms: u64,
    pub estimated_time_remaining_ms: Option<u64>,
    #[serde(default)]
    pub messages: VecDeque<StatusMessage>,
}

impl BulkOperation {
    pub fn new(operation_type: BulkOperationType, description: impl Into<String>, params: Params, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            operation_type,
            description: description.into(),
            params,
            priority,
            status: BulkStatus::Pending,
            counters: BulkCounters::default(),
            failed_task_ids: BTreeSet::new(),
            is_paused: false,
            is_cancelled: false,
            members: BTreeMap::new(),
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            processing_time_ms: 0,
            estimated_time_remaining_ms: None,
            messages: VecDeque::new(),
        }
    }

    /// Fraction of members finished, 0.0 when empty
    pub fn progress(&self) -> f64 {
        if self.counters.total == 0 {
            return 0.0;
        }
        self.counters.finished() as f64 / self.counters.total as f64
    }

    /// Append an audit message, keeping at most `limit` entries
    pub fn log(&mut self, message: impl Into<String>, limit: usize) {
        self.messages.push_back(StatusMessage {
            at: now_ms(),
            message: message.into(),
        });
        while self.messages.len() > limit {
            self.messages.pop_front();
        }
    }

    /// Track a task; an existing member only has its details refreshed
    ///
    /// Returns true when the member is new.
    pub fn register_member(&mut self, task_id: &str, member: BulkMember) -> bool {
        if let Some(existing) = self.members.get_mut(task_id) {
            existing.subject_id = member.subject_id;
            existing.operation = member.operation;
            if !member.params.is_empty() {
                existing.params = member.params;
            }
            return false;
        }

        let status = member.status;
        self.counters.shift(None, Some(status));
        if status == TaskStatus::Failed {
            self.failed_task_ids.insert(task_id.to_string());
        }
        self.members.insert(task_id.to_string(), member);
        true
    }

    /// Stop tracking a task
    pub fn remove_member(&mut self, task_id: &str) -> Option<BulkMember> {
        let member = self.members.remove(task_id)?;
        self.counters.shift(Some(member.status), None);
        self.failed_task_ids.remove(task_id);
        Some(member)
    }

    /// Move a member to a new status; returns false if unknown or unchanged
    pub fn set_member_status(&mut self, task_id: &str, status: TaskStatus, error: Option<&str>, now: i64) -> bool {
        let Some(member) = self.members.get_mut(task_id) else {
            return false;
        };
        if let Some(error) = error {
            member.last_error = Some(error.to_string());
        }
        let old = member.status;
        if old == status {
            return false;
        }
        member.status = status;
        self.counters.shift(Some(old), Some(status));

        if status == TaskStatus::Failed {
            self.failed_task_ids.insert(task_id.to_string());
        } else {
            self.failed_task_ids.remove(task_id);
        }
        if status != TaskStatus::Pending && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        true
    }

    /// Status derived from flags and counters
    pub fn derive_status(&self) -> BulkStatus {
        if self.is_paused {
            return BulkStatus::Paused;
        }
        if self.is_cancelled {
            return BulkStatus::Failed;
        }

        let c = &self.counters;
        if c.total > 0 && c.finished() == c.total {
            return if c.failed == 0 {
                BulkStatus::Completed
            } else if c.completed == 0 {
                BulkStatus::Failed
            } else {
                BulkStatus::PartiallyCompleted
            };
        }

        if c.in_progress > 0 || c.finished() > 0 || self.started_at.is_some() {
            BulkStatus::InProgress
        } else {
            BulkStatus::Pending
        }
    }

    /// Refresh status, timing and ETA; returns the previous status
    pub fn recompute(&mut self, now: i64) -> BulkStatus {
        let old = self.status;
        self.status = self.derive_status();

        if self.status.is_terminal() {
            self.completed_at.get_or_insert(now);
        } else {
            self.completed_at = None;
        }

        let elapsed = self
            .started_at
            .map(|started| (self.completed_at.unwrap_or(now) - started).max(0) as u64)
            .unwrap_or(0);
        self.processing_time_ms = elapsed;

        let finished = self.counters.finished() as u64;
        self.estimated_time_remaining_ms = if finished == 0 {
            None
        } else {
            let remaining = (self.counters.total as u64).saturating_sub(finished);
            Some(elapsed / finished * remaining)
        };

        old
    }
}
