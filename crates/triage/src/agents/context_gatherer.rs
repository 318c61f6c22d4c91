//! Indicator context gathering

use crate::alert::{is_private_ip, SecurityAlert};
use async_trait::async_trait;
use orchestrator::{TaskError, TaskExecutor};
use protocol::{Capability, CapabilityName, Payload, Task};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
struct Indicator {
    kind: &'static str,
    value: String,
    scope: &'static str,
}

/// Collects the alert's observable indicators into a structured context
/// block for the response step and for analyst hand-off.
#[derive(Debug, Default)]
pub struct ContextGatherer;

impl ContextGatherer {
    fn indicators(alert: &SecurityAlert) -> Vec<Indicator> {
        let mut indicators = Vec::new();

        for (kind, ip) in [
            ("source_ip", alert.source_ip.as_deref()),
            ("destination_ip", alert.destination_ip.as_deref()),
        ] {
            if let Some(ip) = ip {
                indicators.push(Indicator {
                    kind,
                    value: ip.to_string(),
                    scope: if is_private_ip(ip) { "internal" } else { "external" },
                });
            }
        }
        if let Some(user) = alert.user_id.as_deref() {
            indicators.push(Indicator {
                kind: "user",
                value: user.to_string(),
                scope: "internal",
            });
        }
        if let Some(host) = alert.hostname.as_deref() {
            indicators.push(Indicator {
                kind: "host",
                value: host.to_string(),
                scope: "internal",
            });
        }
        if let Some(hash) = alert.file_hash.as_deref() {
            indicators.push(Indicator {
                kind: "file_hash",
                value: hash.to_string(),
                scope: "external",
            });
        }

        indicators
    }
}

#[async_trait]
impl TaskExecutor for ContextGatherer {
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new(
            CapabilityName::new("gather_context").expect("static capability name is valid"),
            "Collect indicator context for an alert",
        )]
    }

    async fn execute(
        &self,
        task: &Task,
        workflow_context: &Payload,
    ) -> Result<Payload, TaskError> {
        let alert = super::alert_from(task, workflow_context)?;
        let indicators = Self::indicators(&alert);
        let external = indicators.iter().filter(|i| i.scope == "external").count();

        info!(
            alert_id = %alert.alert_id,
            indicators = indicators.len(),
            external,
            "context gathered"
        );

        let mut result = Payload::new();
        result.insert("alert".to_string(), alert.to_value());
        result.insert(
            "enrichment".to_string(),
            serde_json::json!({
                "indicators": indicators,
                "indicator_count": indicators.len(),
                "external_indicators": external,
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
    async fn classifies_indicator_scope() {
        let mut raw = alert(AlertType::LateralMovement);
        raw.source_ip = Some("10.2.3.4".to_string());
        raw.destination_ip = Some("203.0.113.9".to_string());
        raw.user_id = Some("svc-deploy".to_string());
        raw.file_hash = Some("feedface".to_string());
        let (task, context) = task_for(&raw);

        let result = ContextGatherer
            .execute(&task, &context)
            .await
            .expect("gathering succeeds");

        let enrichment = result
            .get("enrichment")
            .and_then(|v| v.as_object())
            .expect("enrichment present");
        assert_eq!(
            enrichment.get("indicator_count"),
            Some(&serde_json::json!(4))
        );
        assert_eq!(
            enrichment.get("external_indicators"),
            Some(&serde_json::json!(2))
        );
    }

    #[tokio::test]
    async fn bare_alert_yields_empty_context() {
        let raw = alert(AlertType::Unknown);
        let (task, context) = task_for(&raw);

        let result = ContextGatherer
            .execute(&task, &context)
            .await
            .expect("gathering succeeds");

        let enrichment = result
            .get("enrichment")
            .and_then(|v| v.as_object())
            .expect("enrichment present");
        assert_eq!(enrichment.get("indicator_count"), Some(&serde_json::json!(0)));
    }
}
