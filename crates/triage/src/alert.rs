//! Normalized security alert model
//!
//! Alerts arrive as loosely structured JSON from arbitrary sources and
//! are normalized into [`SecurityAlert`] by the reception step. Analysis
//! fields are filled in by the downstream workers as the workflow runs.

use chrono::{DateTime, Utc};
use protocol::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity assigned by the analysis step
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// Map a 0-100 risk score onto a severity band
    pub fn from_risk_score(score: u32) -> Self {
        match score {
            85.. => AlertSeverity::Critical,
            60..=84 => AlertSeverity::High,
            35..=59 => AlertSeverity::Medium,
            _ => AlertSeverity::Low,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Alert classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Malware,
    Phishing,
    BruteForce,
    SuspiciousLogin,
    DataExfiltration,
    NetworkAnomaly,
    InsiderThreat,
    PrivilegeEscalation,
    LateralMovement,
    CommandAndControl,
    Unknown,
}

impl AlertType {
    /// Base risk contribution of the alert class (0-100 scale)
    pub fn base_risk(&self) -> u32 {
        match self {
            AlertType::DataExfiltration => 70,
            AlertType::CommandAndControl => 70,
            AlertType::PrivilegeEscalation => 65,
            AlertType::LateralMovement => 60,
            AlertType::Malware => 55,
            AlertType::InsiderThreat => 55,
            AlertType::BruteForce => 40,
            AlertType::Phishing => 40,
            AlertType::SuspiciousLogin => 35,
            AlertType::NetworkAnomaly => 30,
            AlertType::Unknown => 25,
        }
    }
}

/// Processing state of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    InProgress,
    FalsePositive,
    Resolved,
    Escalated,
}

impl Default for AlertStatus {
    fn default() -> Self {
        AlertStatus::New
    }
}

fn default_alert_type() -> AlertType {
    AlertType::Unknown
}

/// A normalized security alert moving through the triage workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_system: String,
    #[serde(default = "default_alert_type")]
    pub alert_type: AlertType,
    pub description: String,

    // network indicators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,

    // user and asset indicators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    // analysis results, filled in by the workers
    #[serde(default)]
    pub status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_false_positive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<AlertSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

impl SecurityAlert {
    /// Read an alert out of a workflow context payload under `key`
    pub fn from_context(context: &Payload, key: &str) -> Option<Self> {
        context
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Serialize into a JSON value for embedding in payloads
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// True when any source indicator points outside private address space
    pub fn has_external_source(&self) -> bool {
        self.source_ip
            .as_deref()
            .map(|ip| !is_private_ip(ip))
            .unwrap_or(false)
    }
}

/// RFC1918-style check, good enough for heuristic scoring
pub fn is_private_ip(ip: &str) -> bool {
    ip.starts_with("10.")
        || ip.starts_with("192.168.")
        || ip.starts_with("127.")
        || is_172_private(ip)
}

fn is_172_private(ip: &str) -> bool {
    let Some(rest) = ip.strip_prefix("172.") else {
        return false;
    };
    rest.split('.')
        .next()
        .and_then(|octet| octet.parse::<u8>().ok())
        .map(|octet| (16..=31).contains(&octet))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(AlertSeverity::from_risk_score(90), AlertSeverity::Critical);
        assert_eq!(AlertSeverity::from_risk_score(85), AlertSeverity::Critical);
        assert_eq!(AlertSeverity::from_risk_score(70), AlertSeverity::High);
        assert_eq!(AlertSeverity::from_risk_score(40), AlertSeverity::Medium);
        assert_eq!(AlertSeverity::from_risk_score(10), AlertSeverity::Low);
    }

    #[test]
    fn private_ip_ranges() {
        assert!(is_private_ip("10.1.2.3"));
        assert!(is_private_ip("192.168.0.9"));
        assert!(is_private_ip("172.16.4.4"));
        assert!(is_private_ip("172.31.255.1"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("8.8.8.8"));
    }

    #[test]
    fn alert_round_trips_through_context_payload() {
        let alert = SecurityAlert {
            alert_id: "a-1".to_string(),
            timestamp: Utc::now(),
            source_system: "edr".to_string(),
            alert_type: AlertType::Malware,
            description: "suspicious binary".to_string(),
            source_ip: Some("8.8.8.8".to_string()),
            destination_ip: None,
            user_id: None,
            hostname: Some("ws-042".to_string()),
            process_name: None,
            file_hash: Some("deadbeef".to_string()),
            tags: vec!["edr".to_string()],
            status: AlertStatus::New,
            is_false_positive: None,
            severity: None,
            confidence_score: None,
            recommended_actions: vec![],
        };

        let mut context = Payload::new();
        context.insert("alert".to_string(), alert.to_value());
        let restored = SecurityAlert::from_context(&context, "alert").expect("alert parses");
        assert_eq!(restored.alert_id, "a-1");
        assert_eq!(restored.alert_type, AlertType::Malware);
        assert!(restored.has_external_source());
    }

    #[test]
    fn lenient_deserialization_defaults_missing_fields() {
        let mut context = Payload::new();
        context.insert(
            "alert".to_string(),
            serde_json::json!({
                "alert_id": "a-2",
                "timestamp": Utc::now(),
                "source_system": "siem",
                "description": "something odd"
            }),
        );
        let alert = SecurityAlert::from_context(&context, "alert").expect("alert parses");
        assert_eq!(alert.alert_type, AlertType::Unknown);
        assert_eq!(alert.status, AlertStatus::New);
        assert!(alert.tags.is_empty());
    }
}
