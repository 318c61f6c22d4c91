//! Wire-level types for the triage coordination mesh
//!
//! This crate defines the value types every other component speaks:
//! the message envelope, identity newtypes, capability descriptors,
//! worker status snapshots, and the task/workflow model consumed by the
//! orchestration engine. Everything here is plain data plus validation;
//! the async machinery lives in the `orchestrator` crate.

pub mod capability;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod status;
pub mod task;
pub mod workflow;

pub use capability::{Capability, CapabilityName};
pub use envelope::{Envelope, MessageKind, Payload, Priority};
pub use error::ProtocolError;
pub use ids::{MessageId, TaskId, ThreadId, WorkerId, WorkflowId};
pub use status::{WorkerState, WorkerStatus};
pub use task::{Task, TaskStatus};
pub use workflow::{RetryPolicy, StepDef, WorkflowDefinition, WorkflowStatus};

/// Result type for protocol-level validation
pub type ProtocolResult<T> = Result<T, ProtocolError>;
