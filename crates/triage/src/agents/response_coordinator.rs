//! Response coordination

use crate::alert::{AlertSeverity, AlertStatus, SecurityAlert};
use async_trait::async_trait;
use orchestrator::{TaskError, TaskExecutor};
use protocol::{Capability, CapabilityName, Payload, Task};
use tracing::info;

/// Final step: maps the accumulated verdicts onto a response decision
/// and a concrete action list.
#[derive(Debug, Default)]
pub struct ResponseCoordinator;

impl ResponseCoordinator {
    fn decide(alert: &SecurityAlert) -> (&'static str, Vec<&'static str>, AlertStatus) {
        if alert.is_false_positive == Some(true) {
            return (
                "dismissed_false_positive",
                vec!["auto_resolve", "update_detection_rules"],
                AlertStatus::Resolved,
            );
        }
        match alert.severity {
            Some(AlertSeverity::Critical) => (
                "containment_initiated",
                vec![
                    "isolate",
                    "preserve_evidence",
                    "create_incident",
                    "escalate",
                ],
                AlertStatus::Escalated,
            ),
            Some(AlertSeverity::High) => (
                "investigation_escalated",
                vec!["investigate", "create_incident", "escalate"],
                AlertStatus::Escalated,
            ),
            Some(AlertSeverity::Medium) => (
                "analyst_review",
                vec!["investigate", "notify_analyst"],
                AlertStatus::InProgress,
            ),
            Some(AlertSeverity::Low) | None => (
                "monitoring",
                vec!["monitor"],
                AlertStatus::InProgress,
            ),
        }
    }
}

#[async_trait]
impl TaskExecutor for ResponseCoordinator {
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new(
            CapabilityName::new("coordinate_response").expect("static capability name is valid"),
            "Select response actions for an analyzed alert",
        )]
    }

    async fn execute(
        &self,
        task: &Task,
        workflow_context: &Payload,
    ) -> Result<Payload, TaskError> {
        let mut alert = super::alert_from(task, workflow_context)?;
        let (action, actions, status) = Self::decide(&alert);

        alert.status = status;
        alert.recommended_actions = actions.iter().map(|a| a.to_string()).collect();
        info!(
            alert_id = %alert.alert_id,
            action,
            severity = ?alert.severity,
            "response coordinated"
        );

        let mut result = Payload::new();
        result.insert("alert".to_string(), alert.to_value());
        result.insert("action".to_string(), serde_json::json!(action));
        result.insert(
            "recommended_actions".to_string(),
            serde_json::json!(actions),
        );
        Ok(result)
    }
}
