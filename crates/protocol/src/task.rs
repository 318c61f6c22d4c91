//! Task model
//!
//! A task is the unit of work the orchestrator hands to one worker for one
//! workflow step. Tasks are created per dispatch, keyed by their own id,
//! and never reused across workflow executions.

use crate::envelope::{Payload, Priority};
use crate::ids::{TaskId, WorkerId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Execution status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Dispatched and awaiting an outcome (counts against parallelism)
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Retrying
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// A unit of work assigned to one worker for one workflow step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub agent_id: WorkerId,
    pub task_type: String,
    pub payload: Payload,
    pub workflow_id: WorkflowId,
    pub orchestrator_id: WorkerId,
    pub priority: Priority,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        agent_id: WorkerId,
        task_type: impl Into<String>,
        payload: Payload,
        workflow_id: WorkflowId,
        orchestrator_id: WorkerId,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            agent_id,
            task_type: task_type.into(),
            payload,
            workflow_id,
            orchestrator_id,
            priority: Priority::Normal,
            timeout: Duration::from_secs(300),
            retry_count: 0,
            max_retries: 3,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            result: None,
            error: None,
        }
    }

    pub fn mark_assigned(&mut self) {
        self.status = TaskStatus::Assigned;
        self.assigned_at = Some(Utc::now());
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: Payload) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.failed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.cancelled_at = Some(Utc::now());
    }

    /// Reset a failed task so the same step can be dispatched again
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::new(
            WorkerId::from("severity_analyzer"),
            "analyze_severity",
            Payload::new(),
            WorkflowId::new(),
            WorkerId::from("orchestrator"),
        )
    }

    #[test]
    fn lifecycle_markers_set_timestamps() {
        let mut task = sample_task();
        assert_eq!(task.status, TaskStatus::Pending);

        task.mark_assigned();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert!(task.assigned_at.is_some());

        task.mark_running();
        assert!(task.started_at.is_some());

        task.mark_completed(Payload::new());
        assert!(task.status.is_terminal());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn retry_reset_clears_error_but_keeps_count() {
        let mut task = sample_task();
        task.mark_failed("boom");
        task.retry_count = 1;
        task.reset_for_retry();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.is_none());
        // failure timestamp is history, not state
        assert!(task.failed_at.is_some());
    }

    #[test]
    fn in_flight_statuses() {
        assert!(TaskStatus::Assigned.is_in_flight());
        assert!(TaskStatus::Running.is_in_flight());
        assert!(TaskStatus::Retrying.is_in_flight());
        assert!(!TaskStatus::Pending.is_in_flight());
        assert!(!TaskStatus::Completed.is_in_flight());
    }
}
