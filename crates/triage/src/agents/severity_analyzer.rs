//! Severity analysis

use crate::alert::{AlertSeverity, SecurityAlert};
use async_trait::async_trait;
use orchestrator::{TaskError, TaskExecutor};
use protocol::{Capability, CapabilityName, Payload, Task};
use tracing::info;

/// Scores alerts on a 0-100 risk scale and maps the score onto a
/// severity band.
#[derive(Debug, Default)]
pub struct SeverityAnalyzer;

impl SeverityAnalyzer {
    fn risk_score(alert: &SecurityAlert) -> (u32, Vec<String>) {
        let mut factors = Vec::new();
        let mut score = alert.alert_type.base_risk();
        factors.push(format!(
            "base risk {} for {:?} alerts",
            score, alert.alert_type
        ));

        if alert.has_external_source() {
            score += 15;
            factors.push("external source address".to_string());
        }
        if alert.file_hash.is_some() {
            score += 10;
            factors.push("file artifact captured".to_string());
        }
        if alert.user_id.is_some() && alert.hostname.is_some() {
            score += 5;
            factors.push("user and asset both identified".to_string());
        }
        if alert.is_false_positive == Some(true) {
            score = score.saturating_sub(30);
            factors.push("screened as likely false positive".to_string());
        }

        (score.min(100), factors)
    }
}

#[async_trait]
impl TaskExecutor for SeverityAnalyzer {
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new(
            CapabilityName::new("analyze_severity").expect("static capability name is valid"),
            "Score alert risk and assign a severity band",
        )]
    }

    async fn execute(
        &self,
        task: &Task,
        workflow_context: &Payload,
    ) -> Result<Payload, TaskError> {
        let mut alert = super::alert_from(task, workflow_context)?;
        let (risk_score, factors) = Self::risk_score(&alert);
        let severity = AlertSeverity::from_risk_score(risk_score);

        alert.severity = Some(severity);
        alert.confidence_score = Some(f64::from(risk_score) / 100.0);
        info!(
            alert_id = %alert.alert_id,
            risk_score,
            severity = %severity,
            "severity assigned"
        );

        let mut result = Payload::new();
        result.insert("alert".to_string(), alert.to_value());
        result.insert(
            "severity_analysis".to_string(),
            serde_json::json!({
                "severity": severity,
                "risk_score": risk_score,
                "factors": factors,
            }),
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{alert, task_for};
    use crate::alert::AlertType;

    #[tokio::test]
    async fn external_exfiltration_with_artifacts_is_critical() {
        let mut raw = alert(AlertType::DataExfiltration);
        raw.source_ip = Some("198.51.100.7".to_string());
        raw.file_hash = Some("cafebabe".to_string());
        let (task, context) = task_for(&raw);

        let result = SeverityAnalyzer
            .execute(&task, &context)
            .await
            .expect("analysis succeeds");

        let analyzed = SecurityAlert::from_context(&result, "alert").expect("alert present");
        // 70 base + 15 external + 10 artifact
        assert_eq!(analyzed.severity, Some(AlertSeverity::Critical));
        let analysis = result
            .get("severity_analysis")
            .and_then(|v| v.as_object())
            .expect("analysis details present");
        assert_eq!(analysis.get("risk_score"), Some(&serde_json::json!(95)));
    }

    #[tokio::test]
    async fn screened_false_positive_is_downgraded() {
        let mut raw = alert(AlertType::SuspiciousLogin);
        raw.is_false_positive = Some(true);
        let (task, context) = task_for(&raw);

        let result = SeverityAnalyzer
            .execute(&task, &context)
            .await
            .expect("analysis succeeds");

        let analyzed = SecurityAlert::from_context(&result, "alert").expect("alert present");
        // 35 base - 30 screened
        assert_eq!(analyzed.severity, Some(AlertSeverity::Low));
    }

    #[tokio::test]
    async fn network_anomaly_without_indicators_is_low() {
        let raw = alert(AlertType::NetworkAnomaly);
        let (task, context) = task_for(&raw);

        let result = SeverityAnalyzer
            .execute(&task, &context)
            .await
            .expect("analysis succeeds");

        let analyzed = SecurityAlert::from_context(&result, "alert").expect("alert present");
        assert_eq!(analyzed.severity, Some(AlertSeverity::Low));
        assert_eq!(analyzed.confidence_score, Some(0.3));
    }
}
