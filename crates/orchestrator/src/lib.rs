//! Capability-routed worker coordination and workflow orchestration
//!
//! This crate is the coordination substrate of the triage mesh: a registry
//! that indexes workers by advertised capability and routes envelopes to
//! their bounded mailboxes, a worker runtime driving each worker's
//! processing loop and heartbeat, a task-executor contract that lets any
//! worker accept orchestrator-issued work, and the workflow engine that
//! expands declarative step graphs into scheduled task assignments with
//! dependency gating, bounded parallelism, timeouts and retry-with-backoff.
//!
//! # Architecture
//!
//! - **Registry**: single-owner actor holding the worker directory and
//!   capability index; everything talks to it through a [`RegistryHandle`]
//! - **WorkerRuntime**: bounded mailbox + cooperative processing loop per
//!   worker, with heartbeat emission and per-thread bookkeeping
//! - **TaskWorker**: reusable worker shape that queues and executes
//!   orchestrator tasks through a domain [`TaskExecutor`]
//! - **Engine**: workflow scheduler owning all instance and task state,
//!   reached through an [`EngineHandle`] or via command envelopes
//!
//! All cross-component communication is enqueued envelopes; each component
//! mutates its own state inside its own loop, so there are no locks.

pub mod engine;
pub mod executor;
pub mod registry;
pub mod runtime;

pub use engine::{
    Engine, EngineConfig, EngineHandle, OrchestratorError, SystemStatus, WorkflowSnapshot,
};
pub use executor::{TaskError, TaskExecutor, TaskWorker};
pub use registry::{
    AuditEntry, Registry, RegistryConfig, RegistryError, RegistryHandle, RegistryHealth,
    RegistryMetrics, ThreadStatus, WorkerRegistration,
};
pub use runtime::{spawn_worker, Worker, WorkerConfig, WorkerContext, WorkerError, WorkerHandle};
