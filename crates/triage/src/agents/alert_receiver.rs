//! Alert reception and normalization

use crate::alert::{AlertStatus, SecurityAlert};
use async_trait::async_trait;
use orchestrator::{TaskError, TaskExecutor};
use protocol::{Capability, CapabilityName, Payload, Task};
use tracing::info;

/// First step of the pipeline: validates the raw alert and normalizes it
/// into the shape every downstream worker expects.
#[derive(Debug, Default)]
pub struct AlertReceiver;

#[async_trait]
impl TaskExecutor for AlertReceiver {
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new(
            CapabilityName::new("process_alert").expect("static capability name is valid"),
            "Receive and normalize incoming security alerts",
        )]
    }

    async fn execute(
        &self,
        task: &Task,
        workflow_context: &Payload,
    ) -> Result<Payload, TaskError> {
        let mut alert = super::alert_from(task, workflow_context)?;

        if alert.alert_id.trim().is_empty() {
            return Err(TaskError::InvalidInput("alert has no id".to_string()));
        }
        if alert.description.trim().is_empty() {
            return Err(TaskError::InvalidInput(format!(
                "alert '{}' has no description",
                alert.alert_id
            )));
        }

        alert.status = AlertStatus::InProgress;
        alert.source_system = alert.source_system.trim().to_lowercase();
        for tag in &mut alert.tags {
            *tag = tag.trim().to_lowercase();
        }

        info!(
            alert_id = %alert.alert_id,
            alert_type = ?alert.alert_type,
            source_system = %alert.source_system,
            "alert normalized"
        );

        let mut result = Payload::new();
        result.insert("alert".to_string(), alert.to_value());
        result.insert("normalized".to_string(), serde_json::json!(true));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{alert, task_for};
    use crate::alert::AlertType;

    #[tokio::test]
    async fn normalizes_source_system_and_tags() {
        let mut raw = alert(AlertType::Malware);
        raw.source_system = "  EDR-Cluster ".to_string();
        raw.tags = vec![" Endpoint ".to_string()];
        let (task, context) = task_for(&raw);

        let result = AlertReceiver
            .execute(&task, &context)
            .await
            .expect("reception succeeds");

        let normalized = SecurityAlert::from_context(&result, "alert").expect("alert present");
        assert_eq!(normalized.source_system, "edr-cluster");
        assert_eq!(normalized.tags, vec!["endpoint".to_string()]);
        assert_eq!(normalized.status, AlertStatus::InProgress);
        assert_eq!(result.get("normalized"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn rejects_alert_without_description() {
        let mut raw = alert(AlertType::Unknown);
        raw.description = "  ".to_string();
        let (task, context) = task_for(&raw);

        let result = AlertReceiver.execute(&task, &context).await;
        assert!(matches!(result, Err(TaskError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn rejects_missing_alert() {
        let raw = alert(AlertType::Unknown);
        let (task, _context) = task_for(&raw);

        let result = AlertReceiver.execute(&task, &Payload::new()).await;
        assert!(matches!(result, Err(TaskError::InvalidInput(_))));
    }
}
