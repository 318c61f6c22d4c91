//! Configuration loading
//!
//! Settings come from an optional YAML file with `TRIAGE_`-prefixed
//! environment variables layered on top, so deployments can tune the
//! mesh without editing files.

use anyhow::Context;
use orchestrator::{EngineConfig, WorkerConfig};
use protocol::WorkerId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Default log filter; `RUST_LOG` still wins when set
    pub log_level: String,
    /// Bounded mailbox capacity for every worker
    pub mailbox_capacity: usize,
    /// Worker heartbeat period in seconds
    pub heartbeat_interval_secs: u64,
    /// Shutdown drain grace per worker in seconds
    pub drain_grace_secs: u64,
    /// Concurrent workflow cap enforced by the engine
    pub max_concurrent_workflows: usize,
    /// Identity the engine registers under
    pub orchestrator_id: String,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mailbox_capacity: 1000,
            heartbeat_interval_secs: 30,
            drain_grace_secs: 5,
            max_concurrent_workflows: 100,
            orchestrator_id: "orchestrator".to_string(),
        }
    }
}

impl TriageConfig {
    /// Load from a YAML file when given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Layer `TRIAGE_*` overrides on top of the file values
    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get("TRIAGE_LOG_LEVEL") {
            self.log_level = value;
        }
        Self::override_parsed(&get, "TRIAGE_MAILBOX_CAPACITY", &mut self.mailbox_capacity);
        Self::override_parsed(
            &get,
            "TRIAGE_HEARTBEAT_INTERVAL_SECS",
            &mut self.heartbeat_interval_secs,
        );
        Self::override_parsed(&get, "TRIAGE_DRAIN_GRACE_SECS", &mut self.drain_grace_secs);
        Self::override_parsed(
            &get,
            "TRIAGE_MAX_CONCURRENT_WORKFLOWS",
            &mut self.max_concurrent_workflows,
        );
        if let Some(value) = get("TRIAGE_ORCHESTRATOR_ID") {
            self.orchestrator_id = value;
        }
    }

    fn override_parsed<T: std::str::FromStr>(
        get: &impl Fn(&str) -> Option<String>,
        key: &str,
        slot: &mut T,
    ) {
        if let Some(raw) = get(key) {
            match raw.parse() {
                Ok(value) => *slot = value,
                Err(_) => warn!(key, value = %raw, "ignoring unparsable override"),
            }
        }
    }

    pub fn orchestrator_id(&self) -> WorkerId {
        WorkerId::new(self.orchestrator_id.clone())
    }

    /// Worker runtime settings with heartbeats pointed at the engine
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            mailbox_capacity: self.mailbox_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            drain_grace: Duration::from_secs(self.drain_grace_secs),
            heartbeat_target: Some(self.orchestrator_id()),
            ..WorkerConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            orchestrator_id: self.orchestrator_id(),
            max_concurrent_workflows: self.max_concurrent_workflows,
            mailbox_capacity: self.mailbox_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_sensible() {
        let config = TriageConfig::default();
        assert_eq!(config.mailbox_capacity, 1000);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.orchestrator_id, "orchestrator");
    }

    #[test]
    fn yaml_values_are_picked_up() {
        let raw = "mailbox_capacity: 64\nlog_level: debug\n";
        let config: TriageConfig = serde_yaml::from_str(raw).expect("yaml parses");
        assert_eq!(config.mailbox_capacity, 64);
        assert_eq!(config.log_level, "debug");
        // unspecified fields keep their defaults
        assert_eq!(config.max_concurrent_workflows, 100);
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut env = HashMap::new();
        env.insert("TRIAGE_MAILBOX_CAPACITY", "32");
        env.insert("TRIAGE_ORCHESTRATOR_ID", "triage_control");
        env.insert("TRIAGE_HEARTBEAT_INTERVAL_SECS", "not-a-number");

        let mut config = TriageConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.mailbox_capacity, 32);
        assert_eq!(config.orchestrator_id, "triage_control");
        // unparsable overrides are ignored, not fatal
        assert_eq!(config.heartbeat_interval_secs, 30);
    }
}
