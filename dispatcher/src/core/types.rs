//! Shared types for the dispatcher core.
//!
//! These types define stable contracts between the executor, the task store,
//! and the agent integration. They carry no I/O and serialize with `serde` so
//! the file-backed store can persist them directly.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Queued,
    InProgress,
    Stuck,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Stuck => "stuck",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that stamp `completed_at` when entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backlog" => Ok(TaskStatus::Backlog),
            "queued" => Ok(TaskStatus::Queued),
            "in_progress" => Ok(TaskStatus::InProgress),
            "stuck" => Ok(TaskStatus::Stuck),
            "done" => Ok(TaskStatus::Done),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(anyhow!("unknown task status '{other}'")),
        }
    }
}

/// Token usage reported by the agent's result envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// Execution metrics extracted from the agent's JSON envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub turns: Option<u32>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub usage: Option<TokenUsage>,
}

/// Unit of work owned by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            id: self.id.clone(),
            title: self.title.clone(),
        }
    }
}

/// Fields supplied when creating a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub area: Option<String>,
    pub status: Option<TaskStatus>,
}

/// Status write applied by the executor.
///
/// `notes: None` leaves the stored notes untouched. `run: None` leaves the
/// stored commit and metrics untouched; `Some` replaces both, clearing any
/// that the new run did not produce.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub notes: Option<String>,
    pub run: Option<RunRecord>,
}

/// What one completed agent run left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRecord {
    pub commit_ref: Option<String>,
    pub metrics: Option<ExecutionMetrics>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            notes: None,
            run: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_run(mut self, run: RunRecord) -> Self {
        self.run = Some(run);
        self
    }
}

/// Identity of the task currently checked out by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub title: String,
}

/// Captured result of one supervised child process run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// True when the process exited zero before the deadline.
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Bytes discarded beyond the capture limit.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

/// Interpreted result of one agent run, produced once per task execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubprocessResult {
    pub success: bool,
    pub notes: Option<String>,
    pub error: Option<String>,
    /// Diagnostic only: whether the failure looks environmental rather than task-specific.
    pub is_system_error: Option<bool>,
    pub metrics: Option<ExecutionMetrics>,
    pub flagged: Option<String>,
    pub commit_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Backlog,
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Stuck,
            TaskStatus::Done,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().expect("parse"), status);
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "started".parse::<TaskStatus>().unwrap_err();
        assert!(err.to_string().contains("unknown task status"));
    }
}
