//! Worker status snapshots
//!
//! A worker's runtime is the single writer of its status; the registry and
//! orchestrator only ever read snapshots for discovery and health checks.

use crate::ids::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Offline,
    Online,
    Busy,
    Error,
}

impl WorkerState {
    /// Only online workers accept routed envelopes
    pub fn is_routable(&self) -> bool {
        matches!(self, WorkerState::Online)
    }

    /// States in which the processing loop keeps running
    pub fn is_processing(&self) -> bool {
        matches!(self, WorkerState::Online | WorkerState::Busy)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Offline => "offline",
            WorkerState::Online => "online",
            WorkerState::Busy => "busy",
            WorkerState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one worker's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub display_name: String,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub mailbox_depth: usize,
    pub active_threads: usize,
    pub processed: u64,
    pub errors: u64,
}

impl WorkerStatus {
    /// Initial snapshot for a worker that has not come online yet
    pub fn offline(worker_id: WorkerId, display_name: impl Into<String>) -> Self {
        Self {
            worker_id,
            display_name: display_name.into(),
            state: WorkerState::Offline,
            last_heartbeat: Utc::now(),
            mailbox_depth: 0,
            active_threads: 0,
            processed: 0,
            errors: 0,
        }
    }
}
