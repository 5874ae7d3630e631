use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedError;

/// Unique identifier assigned to every submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task priority. Higher value = higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    /// Validate a raw priority against the accepted range.
    pub fn new(value: i64) -> Result<Self, SchedError> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(SchedError::invalid(format!(
                "priority {value} outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Terminal (or, for preempted tasks, provisional) outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Completed,
    Interrupted,
    Missed,
}

impl Classification {
    pub fn label(self) -> &'static str {
        match self {
            Classification::Completed => "completed",
            Classification::Interrupted => "interrupted",
            Classification::Missed => "missed",
        }
    }
}

/// Immutable snapshot of a task filed into a result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
    pub duration_ms: u64,
    pub deadline: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of times the task was started.
    pub runs: u32,
    /// Number of times the task was preempted.
    pub preemptions: u32,
    /// Execution fault message, if the last run faulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl TaskRecord {
    /// `ended_at - started_at` in milliseconds, when both are known.
    pub fn turnaround_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            name: self.name.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Read-only view handed to result-set consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Point-in-time metrics over the result sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: usize,
    pub completed: usize,
    pub interrupted: usize,
    pub missed: usize,
    /// Mean turnaround over completed tasks only; 0 when there are none.
    pub avg_turnaround_ms: u64,
}
