//! The alert triage workflow definition

use protocol::{CapabilityName, RetryPolicy, StepDef, WorkflowDefinition};
use std::time::Duration;

fn capability(name: &str) -> CapabilityName {
    CapabilityName::new(name).expect("static capability name is valid")
}

/// Five-step triage chain: reception, false-positive screening, severity
/// analysis, context gathering, response coordination. Up to two steps
/// may run in parallel once the dependency graph allows it.
pub fn alert_triage_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("alert_triage", "Alert Triage Workflow")
        .with_description("Complete alert triage and response workflow")
        .with_steps(vec![
            StepDef::new(
                "alert_reception",
                capability("process_alert"),
                "process_alert",
                "Receive and normalize the incoming alert",
            )
            .with_timeout(Duration::from_secs(30)),
            StepDef::new(
                "false_positive_check",
                capability("check_false_positive"),
                "check_false_positive",
                "Screen the alert against benign-activity heuristics",
            )
            .depends_on(&["alert_reception"])
            .with_timeout(Duration::from_secs(60)),
            StepDef::new(
                "severity_analysis",
                capability("analyze_severity"),
                "analyze_severity",
                "Score alert risk and assign a severity band",
            )
            .depends_on(&["false_positive_check"])
            .with_timeout(Duration::from_secs(45)),
            StepDef::new(
                "context_gathering",
                capability("gather_context"),
                "gather_context",
                "Collect indicator context for the alert",
            )
            .depends_on(&["severity_analysis"])
            .with_timeout(Duration::from_secs(90)),
            StepDef::new(
                "response_coordination",
                capability("coordinate_response"),
                "coordinate_response",
                "Select and record response actions",
            )
            .depends_on(&["context_gathering"])
            .with_timeout(Duration::from_secs(120)),
        ])
        .with_max_parallel(2)
        .with_retry_policy(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            exponential_backoff: true,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_is_structurally_valid() {
        let definition = alert_triage_definition();
        assert!(definition.validate().is_ok());
        assert_eq!(definition.steps.len(), 5);
        assert_eq!(definition.key, "alert_triage");
    }

    #[test]
    fn steps_form_a_linear_chain() {
        let definition = alert_triage_definition();
        for window in definition.steps.windows(2) {
            assert_eq!(window[1].dependencies, vec![window[0].step_id.clone()]);
        }
        assert!(definition.steps[0].dependencies.is_empty());
    }
}
