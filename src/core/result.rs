//! Task outcome records.

use crate::core::payload::TaskFailure;
use crate::core::task::{Lane, Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a task.
///
/// Exactly one terminal `TaskResult` exists per task. Non-terminal snapshots
/// (`Queued`/`Running`) are only handed out by `get_results` when it times out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub value: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub lane: Lane,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl TaskResult {
    pub fn completed(task: &Task, value: serde_json::Value) -> Self {
        Self {
            task_id: task.id,
            status: TaskStatus::Completed,
            value: Some(value),
            error: None,
            lane: task.lane,
            started_at: task.started_at,
            finished_at: Some(Utc::now()),
            attempts: task.attempts,
        }
    }

    pub fn failed(task: &Task, failure: TaskFailure) -> Self {
        Self {
            task_id: task.id,
            status: TaskStatus::for_failure(failure.kind),
            value: None,
            error: Some(failure),
            lane: task.lane,
            started_at: task.started_at,
            finished_at: Some(Utc::now()),
            attempts: task.attempts,
        }
    }

    /// Snapshot of a task that has not reached a terminal state yet.
    pub fn pending(task_id: TaskId, status: TaskStatus, lane: Lane, attempts: u32) -> Self {
        Self {
            task_id,
            status,
            value: None,
            error: None,
            lane,
            started_at: None,
            finished_at: None,
            attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Wall-clock time from first start to finish, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
