//! Triage pipeline executors
//!
//! Each worker in the alert-triage workflow is a [`TaskExecutor`]
//! implementation with deterministic heuristics standing in for the
//! analyst-grade reasoning a production deployment would plug in behind
//! the same contract.

pub mod alert_receiver;
pub mod context_gatherer;
pub mod false_positive;
pub mod response_coordinator;
pub mod severity_analyzer;

pub use alert_receiver::AlertReceiver;
pub use context_gatherer::ContextGatherer;
pub use false_positive::FalsePositiveChecker;
pub use response_coordinator::ResponseCoordinator;
pub use severity_analyzer::SeverityAnalyzer;

use crate::alert::SecurityAlert;
use orchestrator::TaskError;
use protocol::{Payload, Task};

/// Pull the alert out of the workflow context, falling back to the task's
/// own dispatch-time context copy.
pub(crate) fn alert_from(task: &Task, workflow_context: &Payload) -> Result<SecurityAlert, TaskError> {
    SecurityAlert::from_context(workflow_context, "alert")
        .or_else(|| {
            task.payload
                .get("context")
                .and_then(|value| value.as_object())
                .and_then(|context| SecurityAlert::from_context(context, "alert"))
        })
        .ok_or_else(|| TaskError::InvalidInput("workflow context is missing an 'alert'".to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::alert::{AlertStatus, AlertType, SecurityAlert};
    use chrono::Utc;
    use protocol::{Payload, Task, WorkerId, WorkflowId};

    pub fn alert(alert_type: AlertType) -> SecurityAlert {
        SecurityAlert {
            alert_id: "alert-1".to_string(),
            timestamp: Utc::now(),
            source_system: "test-siem".to_string(),
            alert_type,
            description: "synthetic fixture alert".to_string(),
            source_ip: None,
            destination_ip: None,
            user_id: None,
            hostname: None,
            process_name: None,
            file_hash: None,
            tags: vec![],
            status: AlertStatus::New,
            is_false_positive: None,
            severity: None,
            confidence_score: None,
            recommended_actions: vec![],
        }
    }

    pub fn task_for(alert: &SecurityAlert) -> (Task, Payload) {
        let mut context = Payload::new();
        context.insert("alert".to_string(), alert.to_value());
        let task = Task::new(
            WorkerId::from("test-worker"),
            "test_task",
            Payload::new(),
            WorkflowId::new(),
            WorkerId::from("orchestrator"),
        );
        (task, context)
    }
}
