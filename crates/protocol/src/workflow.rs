//! Workflow model
//!
//! A workflow definition is an immutable template: named steps with
//! capability targets, dependency edges, timeouts and a retry policy.
//! Executions of a definition live in the orchestration engine and are
//! identified by a generated [`crate::WorkflowId`], distinct from the
//! definition key.

use crate::capability::CapabilityName;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// One step of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub step_id: String,
    /// Capability the target worker must advertise
    pub capability: CapabilityName,
    pub task_name: String,
    pub description: String,
    /// Step ids that must complete before this step becomes ready
    pub dependencies: Vec<String>,
    pub timeout: Duration,
}

impl StepDef {
    pub fn new(
        step_id: impl Into<String>,
        capability: CapabilityName,
        task_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            capability,
            task_name: task_name.into(),
            description: description.into(),
            dependencies: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn depends_on(mut self, steps: &[&str]) -> Self {
        self.dependencies = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Retry behavior applied when a step's task fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the k-th retry (1-based): `base * 2^(k-1)` when
    /// exponential, constant `base` otherwise
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if self.exponential_backoff && retry_count > 1 {
            self.base_delay * 2u32.saturating_pow(retry_count - 1)
        } else {
            self.base_delay
        }
    }
}

/// Immutable workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Template key used by workflow-start requests, e.g. `alert_triage`
    pub key: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<StepDef>,
    pub max_parallel_steps: usize,
    pub retry_policy: RetryPolicy,
}

impl WorkflowDefinition {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            max_parallel_steps: 1,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepDef>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel_steps: usize) -> Self {
        self.max_parallel_steps = max_parallel_steps;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Check structural soundness: at least one step, unique step ids,
    /// known dependency targets, no dependency cycles, sane parallelism
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidWorkflow {
            key: self.key.clone(),
            reason,
        };

        if self.steps.is_empty() {
            return Err(invalid("definition has no steps".to_string()));
        }
        if self.max_parallel_steps == 0 {
            return Err(invalid("max_parallel_steps must be at least 1".to_string()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.step_id.as_str()) {
                return Err(invalid(format!("duplicate step id '{}'", step.step_id)));
            }
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(invalid(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    )));
                }
            }
        }

        self.check_acyclic().map_err(invalid)
    }

    fn check_acyclic(&self) -> Result<(), String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let index: HashMap<&str, &StepDef> = self
            .steps
            .iter()
            .map(|s| (s.step_id.as_str(), s))
            .collect();
        let mut marks: HashMap<&str, Mark> = index.keys().map(|&k| (k, Mark::Unvisited)).collect();

        fn visit<'a>(
            id: &'a str,
            index: &HashMap<&'a str, &'a StepDef>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), String> {
            match marks[id] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    return Err(format!("dependency cycle through step '{id}'"));
                }
                Mark::Unvisited => {}
            }
            marks.insert(id, Mark::InProgress);
            for dep in &index[id].dependencies {
                visit(dep.as_str(), index, marks)?;
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for step in &self.steps {
            visit(step.step_id.as_str(), &index, &mut marks)?;
        }
        Ok(())
    }
}

/// Status of one workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
