//! False-positive screening

use crate::alert::{is_private_ip, AlertStatus, AlertType, SecurityAlert};
use async_trait::async_trait;
use orchestrator::{TaskError, TaskExecutor};
use protocol::{Capability, CapabilityName, Payload, Task};
use tracing::info;

/// Tags that mark activity as pre-authorized
const BENIGN_TAGS: [&str; 3] = ["scheduled_maintenance", "authorized_test", "change_window"];

/// Processes routinely flagged by noisy detection rules
const BENIGN_PROCESSES: [&str; 4] = [
    "backup_agent",
    "av_scanner",
    "patch_runner",
    "vuln_scanner",
];

/// Screens alerts against benign-activity heuristics before the
/// expensive analysis steps run.
#[derive(Debug, Default)]
pub struct FalsePositiveChecker;

impl FalsePositiveChecker {
    /// Accumulate benign evidence into a confidence score and reasons
    fn assess(alert: &SecurityAlert) -> (f64, Vec<String>) {
        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();

        for tag in &alert.tags {
            if BENIGN_TAGS.contains(&tag.as_str()) {
                score += 0.7;
                reasons.push(format!("activity tagged '{tag}'"));
            }
        }

        if let Some(process) = alert.process_name.as_deref() {
            if BENIGN_PROCESSES.contains(&process) {
                score += 0.6;
                reasons.push(format!("known benign process '{process}'"));
            }
        }

        if alert.alert_type == AlertType::SuspiciousLogin {
            if let Some(ip) = alert.source_ip.as_deref() {
                if is_private_ip(ip) {
                    score += 0.4;
                    reasons.push(format!("login from internal address {ip}"));
                }
            }
        }

        if alert.description.to_lowercase().contains("test") {
            score += 0.2;
            reasons.push("description mentions testing".to_string());
        }

        (score.min(1.0), reasons)
    }
}

#[async_trait]
impl TaskExecutor for FalsePositiveChecker {
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new(
            CapabilityName::new("check_false_positive").expect("static capability name is valid"),
            "Screen alerts against benign-activity heuristics",
        )]
    }

    async fn execute(
        &self,
        task: &Task,
        workflow_context: &Payload,
    ) -> Result<Payload, TaskError> {
        let mut alert = super::alert_from(task, workflow_context)?;
        let (confidence, reasons) = Self::assess(&alert);
        let verdict = confidence >= 0.6;

        alert.is_false_positive = Some(verdict);
        if verdict {
            alert.status = AlertStatus::FalsePositive;
        }
        info!(
            alert_id = %alert.alert_id,
            false_positive = verdict,
            confidence,
            "false-positive screening complete"
        );

        let mut result = Payload::new();
        result.insert("alert".to_string(), alert.to_value());
        result.insert(
            "false_positive_check".to_string(),
            serde_json::json!({
                "is_false_positive": verdict,
                "confidence": confidence,
                "reasons": reasons,
            }),
        );
        Ok(result)
    }
}
