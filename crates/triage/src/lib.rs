//! Security alert triage workers
//!
//! The domain side of the mesh: a normalized alert model, five task
//! executors covering the triage pipeline (reception, false-positive
//! check, severity analysis, context gathering, response coordination),
//! the `alert_triage` workflow definition that chains them, and the
//! configuration loader used by the `triage` binary. Everything here
//! plugs into the orchestrator through the task-executor contract; the
//! coordination substrate knows nothing about alerts.

pub mod agents;
pub mod alert;
pub mod config;
pub mod workflow;

pub use alert::{AlertSeverity, AlertStatus, AlertType, SecurityAlert};
pub use config::TriageConfig;
pub use workflow::alert_triage_definition;
