//! Workflow engine
//!
//! The engine expands workflow definitions into live executions: it
//! detects ready steps, resolves their target capabilities through the
//! registry, dispatches bounded-parallel task batches, merges results into
//! the instance context, and applies the retry policy with backoff when a
//! task fails. All instance and task state lives inside the engine's own
//! loop; the outside world sees ids and snapshots only.
//!
//! Two entry paths share the same internals: a typed [`EngineHandle`] for
//! in-process callers, and command envelopes (`workflow_start`,
//! `workflow_pause`, `workflow_resume`, `workflow_cancel`,
//! `workflow_status`) answered with structured response envelopes, where
//! failures are data rather than errors.

use crate::registry::{RegistryError, RegistryHandle, WorkerRegistration};
use chrono::{DateTime, Utc};
use protocol::{
    Envelope, MessageKind, Payload, Priority, ProtocolError, StepDef, Task, TaskId, TaskStatus,
    ThreadId, WorkerId, WorkerState, WorkerStatus, WorkflowDefinition, WorkflowId, WorkflowStatus,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator failure taxonomy
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown workflow type '{0}'")]
    UnknownWorkflowType(String),

    #[error("workflow '{0}' not found")]
    NotFound(WorkflowId),

    #[error("maximum concurrent workflows ({0}) reached")]
    ConcurrencyLimit(usize),

    #[error("workflow '{workflow_id}' is {status}; cannot {action}")]
    InvalidState {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        action: &'static str,
    },

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] ProtocolError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("orchestrator engine is shut down")]
    Closed,
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity the engine registers under; workers report results here
    pub orchestrator_id: WorkerId,
    pub max_concurrent_workflows: usize,
    /// Capacity of the engine's own envelope mailbox
    pub mailbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            orchestrator_id: WorkerId::from("orchestrator"),
            max_concurrent_workflows: 100,
            mailbox_capacity: 1000,
        }
    }
}

/// Snapshot of one workflow execution
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    /// step id -> task copy
    pub tasks: HashMap<String, Task>,
    pub context: Payload,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate view over the engine and the worker fleet
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub registered_workers: usize,
    pub online_workers: usize,
    pub active_workflows: usize,
    pub archived_workflows: usize,
    pub definitions: Vec<String>,
    pub workers: Vec<WorkerStatus>,
    pub last_heard: HashMap<WorkerId, DateTime<Utc>>,
}

enum EngineCommand {
    StartWorkflow {
        workflow_type: String,
        context: Payload,
        reply: oneshot::Sender<Result<WorkflowId, OrchestratorError>>,
    },
    Pause {
        workflow_id: WorkflowId,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    Resume {
        workflow_id: WorkflowId,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    Cancel {
        workflow_id: WorkflowId,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    WorkflowStatus {
        workflow_id: WorkflowId,
        reply: oneshot::Sender<Result<WorkflowSnapshot, OrchestratorError>>,
    },
    SystemStatus {
        reply: oneshot::Sender<Result<SystemStatus, OrchestratorError>>,
    },
    RegisterDefinition {
        definition: WorkflowDefinition,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
}

/// Timer-driven events posted back into the engine loop
enum InternalEvent {
    RetryDue {
        workflow_id: WorkflowId,
        step_id: String,
    },
    TimeoutCheck {
        workflow_id: WorkflowId,
        task_id: TaskId,
        attempt: u32,
    },
}

/// Cloneable entry point into the engine
#[derive(Clone)]
pub struct EngineHandle {
    orchestrator_id: WorkerId,
    tx: mpsc::Sender<EngineCommand>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    pub fn orchestrator_id(&self) -> &WorkerId {
        &self.orchestrator_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, OrchestratorError>>) -> EngineCommand,
    ) -> Result<T, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        rx.await.map_err(|_| OrchestratorError::Closed)?
    }

    /// Create an execution of a named workflow definition and start it
    pub async fn start_workflow(
        &self,
        workflow_type: impl Into<String>,
        context: Payload,
    ) -> Result<WorkflowId, OrchestratorError> {
        let workflow_type = workflow_type.into();
        self.request(|reply| EngineCommand::StartWorkflow {
            workflow_type,
            context,
            reply,
        })
        .await
    }

    /// Freeze scheduling without touching in-flight tasks
    pub async fn pause(&self, workflow_id: WorkflowId) -> Result<(), OrchestratorError> {
        self.request(|reply| EngineCommand::Pause { workflow_id, reply })
            .await
    }

    /// Resume a paused execution and re-evaluate readiness immediately
    pub async fn resume(&self, workflow_id: WorkflowId) -> Result<(), OrchestratorError> {
        self.request(|reply| EngineCommand::Resume { workflow_id, reply })
            .await
    }

    /// Cancel an execution; in-flight workers are marked, not interrupted
    pub async fn cancel(&self, workflow_id: WorkflowId) -> Result<(), OrchestratorError> {
        self.request(|reply| EngineCommand::Cancel { workflow_id, reply })
            .await
    }

    pub async fn workflow_status(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowSnapshot, OrchestratorError> {
        self.request(|reply| EngineCommand::WorkflowStatus { workflow_id, reply })
            .await
    }

    pub async fn system_status(&self) -> Result<SystemStatus, OrchestratorError> {
        self.request(|reply| EngineCommand::SystemStatus { reply })
            .await
    }

    /// Add or replace a workflow definition after validation
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        self.request(|reply| EngineCommand::RegisterDefinition { definition, reply })
            .await
    }

    /// Stop the engine loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// One live execution, owned entirely by the engine loop
struct WorkflowInstance {
    workflow_id: WorkflowId,
    definition: WorkflowDefinition,
    status: WorkflowStatus,
    /// step id -> task
    tasks: HashMap<String, Task>,
    context: Payload,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.workflow_id,
            workflow_type: self.definition.key.clone(),
            status: self.status,
            completed_steps: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .count(),
            total_steps: self.definition.steps.len(),
            tasks: self.tasks.clone(),
            context: self.context.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn in_flight(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .count()
    }

    fn step_completed(&self, step_id: &str) -> bool {
        self.tasks
            .get(step_id)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    /// A step is ready when every dependency completed and its own task is
    /// absent or reset to pending; dispatched steps cannot be dispatched
    /// again except through the retry reset.
    fn step_ready(&self, step: &StepDef) -> bool {
        let deps_done = step
            .dependencies
            .iter()
            .all(|dep| self.step_completed(dep));
        let own_ok = match self.tasks.get(&step.step_id) {
            None => true,
            Some(task) => task.status == TaskStatus::Pending,
        };
        deps_done && own_ok
    }
}

/// Workflow engine constructor
pub struct Engine;

impl Engine {
    /// Register the engine with the registry and start its loop
    pub async fn spawn(
        registry: RegistryHandle,
        config: EngineConfig,
        definitions: Vec<WorkflowDefinition>,
    ) -> Result<EngineHandle, OrchestratorError> {
        for definition in &definitions {
            definition.validate()?;
        }

        let orchestrator_id = config.orchestrator_id.clone();
        let (mailbox_tx, mailbox_rx) = mpsc::channel::<Envelope>(config.mailbox_capacity);

        let mut status = WorkerStatus::offline(orchestrator_id.clone(), "Workflow Orchestrator");
        status.state = WorkerState::Online;
        let (status_tx, status_rx) = watch::channel(status);

        registry
            .register(WorkerRegistration {
                worker_id: orchestrator_id.clone(),
                display_name: "Workflow Orchestrator".to_string(),
                capabilities: vec![protocol::Capability::new(
                    protocol::CapabilityName::new("orchestrate_workflow")
                        .expect("static capability name is valid"),
                    "Orchestrate and manage workflow executions",
                )],
                mailbox: mailbox_tx,
                status: status_rx,
            })
            .await?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel::<InternalEvent>();
        let shutdown = CancellationToken::new();

        let actor = EngineActor {
            config,
            registry,
            definitions: definitions
                .into_iter()
                .map(|d| (d.key.clone(), d))
                .collect(),
            active: HashMap::new(),
            archive: HashMap::new(),
            task_index: HashMap::new(),
            last_heard: HashMap::new(),
            internal_tx,
            status_tx,
        };
        tokio::spawn(actor.run(cmd_rx, mailbox_rx, internal_rx, shutdown.clone()));

        info!(orchestrator_id = %orchestrator_id, "workflow engine online");
        Ok(EngineHandle {
            orchestrator_id,
            tx: cmd_tx,
            shutdown,
        })
    }
}

struct EngineActor {
    config: EngineConfig,
    registry: RegistryHandle,
    definitions: HashMap<String, WorkflowDefinition>,
    active: HashMap<WorkflowId, WorkflowInstance>,
    archive: HashMap<WorkflowId, WorkflowInstance>,
    /// task id -> (workflow id, step id); nothing outside the engine ever
    /// holds a live task reference
    task_index: HashMap<TaskId, (WorkflowId, String)>,
    last_heard: HashMap<WorkerId, DateTime<Utc>>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    status_tx: watch::Sender<WorkerStatus>,
}

impl EngineActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut mailbox_rx: mpsc::Receiver<Envelope>,
        mut internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                envelope = mailbox_rx.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => break,
                },
                event = internal_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_internal(event).await;
                    }
                }
            }
        }

        self.status_tx.send_modify(|s| s.state = WorkerState::Offline);
        let orchestrator_id = self.config.orchestrator_id.clone();
        if let Err(e) = self.registry.unregister(orchestrator_id.clone()).await {
            debug!(%e, "engine unregister failed");
        }
        info!(orchestrator_id = %orchestrator_id, "workflow engine stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::StartWorkflow {
                workflow_type,
                context,
                reply,
            } => {
                let result = self.start_workflow(&workflow_type, context).await;
                let _ = reply.send(result);
            }
            EngineCommand::Pause { workflow_id, reply } => {
                let _ = reply.send(self.pause(workflow_id));
            }
            EngineCommand::Resume { workflow_id, reply } => {
                let _ = reply.send(self.resume(workflow_id).await);
            }
            EngineCommand::Cancel { workflow_id, reply } => {
                let _ = reply.send(self.cancel(workflow_id));
            }
            EngineCommand::WorkflowStatus { workflow_id, reply } => {
                let _ = reply.send(self.workflow_snapshot(workflow_id));
            }
            EngineCommand::SystemStatus { reply } => {
                let _ = reply.send(self.system_status().await);
            }
            EngineCommand::RegisterDefinition { definition, reply } => {
                let result = definition
                    .validate()
                    .map_err(OrchestratorError::from)
                    .map(|()| {
                        info!(key = %definition.key, "workflow definition registered");
                        self.definitions.insert(definition.key.clone(), definition);
                    });
                let _ = reply.send(result);
            }
        }
    }

    async fn start_workflow(
        &mut self,
        workflow_type: &str,
        context: Payload,
    ) -> Result<WorkflowId, OrchestratorError> {
        if self.active.len() >= self.config.max_concurrent_workflows {
            return Err(OrchestratorError::ConcurrencyLimit(
                self.config.max_concurrent_workflows,
            ));
        }
        let definition = self
            .definitions
            .get(workflow_type)
            .ok_or_else(|| OrchestratorError::UnknownWorkflowType(workflow_type.to_string()))?
            .clone();

        let workflow_id = WorkflowId::new();
        let now = Utc::now();
        let mut instance = WorkflowInstance {
            workflow_id,
            definition,
            status: WorkflowStatus::Pending,
            tasks: HashMap::new(),
            context,
            error: None,
            created_at: now,
            updated_at: now,
        };
        info!(
            workflow_id = %workflow_id,
            workflow_type,
            "workflow execution created"
        );

        instance.status = WorkflowStatus::Running;
        self.active.insert(workflow_id, instance);
        self.advance(workflow_id).await;
        Ok(workflow_id)
    }

    /// Dispatch every ready step up to the instance's parallelism budget,
    /// or finish the instance when nothing is ready and nothing in flight.
    async fn advance(&mut self, workflow_id: WorkflowId) {
        let (ready, budget) = {
            let Some(instance) = self.active.get(&workflow_id) else {
                return;
            };
            if instance.status != WorkflowStatus::Running {
                return;
            }
            let budget = instance
                .definition
                .max_parallel_steps
                .saturating_sub(instance.in_flight());
            let ready: Vec<StepDef> = instance
                .definition
                .steps
                .iter()
                .filter(|step| instance.step_ready(step))
                .cloned()
                .collect();
            (ready, budget)
        };

        if ready.is_empty() {
            let done = {
                let Some(instance) = self.active.get(&workflow_id) else {
                    return;
                };
                instance.in_flight() == 0
            };
            if done {
                self.finish(workflow_id);
            }
            return;
        }

        for step in ready.into_iter().take(budget) {
            self.dispatch_step(workflow_id, step).await;
            let still_running = self
                .active
                .get(&workflow_id)
                .map(|i| i.status == WorkflowStatus::Running)
                .unwrap_or(false);
            if !still_running {
                break;
            }
        }
    }

    async fn dispatch_step(&mut self, workflow_id: WorkflowId, step: StepDef) {
        // Resolve the capability first; a step with zero registrants fails
        // the instance without contacting any worker.
        let target = match self
            .registry
            .discover(vec![step.capability.clone()], Vec::new())
            .await
        {
            Ok(candidates) => match candidates.into_iter().next() {
                // First candidate wins; see the selection-policy note in DESIGN.md.
                Some(target) => target,
                None => {
                    self.fail_instance(
                        workflow_id,
                        format!("no online worker advertises capability '{}'", step.capability),
                    );
                    return;
                }
            },
            Err(RegistryError::CapabilityNotFound(capability)) => {
                self.fail_instance(
                    workflow_id,
                    format!("capability '{capability}' has no registrants"),
                );
                return;
            }
            Err(error) => {
                self.fail_instance(
                    workflow_id,
                    format!("capability resolution failed: {error}"),
                );
                return;
            }
        };

        let orchestrator_id = self.config.orchestrator_id.clone();
        let (envelope, task_id, attempt, timeout) = {
            let Some(instance) = self.active.get_mut(&workflow_id) else {
                return;
            };
            let context = instance.context.clone();
            let retry_policy = instance.definition.retry_policy.clone();

            let task = instance
                .tasks
                .entry(step.step_id.clone())
                .and_modify(|task| {
                    // retry re-dispatch reuses the task, refreshed with the
                    // latest context and target
                    task.agent_id = target.clone();
                    task.payload.insert(
                        "context".to_string(),
                        serde_json::Value::Object(context.clone()),
                    );
                })
                .or_insert_with(|| {
                    let mut payload = Payload::new();
                    payload.insert("step_id".to_string(), serde_json::json!(step.step_id));
                    payload.insert("task_name".to_string(), serde_json::json!(step.task_name));
                    payload.insert(
                        "description".to_string(),
                        serde_json::json!(step.description),
                    );
                    payload.insert(
                        "context".to_string(),
                        serde_json::Value::Object(context.clone()),
                    );
                    let mut task = Task::new(
                        target.clone(),
                        step.task_name.clone(),
                        payload,
                        workflow_id,
                        orchestrator_id.clone(),
                    );
                    task.priority = Priority::High;
                    task.timeout = step.timeout;
                    task.max_retries = retry_policy.max_retries;
                    task.dependencies = step.dependencies.clone();
                    task
                });

            task.mark_assigned();
            instance.updated_at = Utc::now();

            let task_snapshot = task.clone();
            let task_value = serde_json::to_value(&task_snapshot);
            let mut payload = Payload::new();
            payload.insert("command".to_string(), serde_json::json!("execute_task"));
            // serializing our own task type cannot realistically fail, but
            // a workflow must not hang if it ever does
            let Ok(value) = task_value else {
                self.fail_instance(workflow_id, "task serialization failed".to_string());
                return;
            };
            payload.insert("task".to_string(), value);
            payload.insert(
                "workflow_context".to_string(),
                serde_json::Value::Object(instance.context.clone()),
            );

            let envelope = Envelope::new(
                orchestrator_id.clone(),
                target.clone(),
                MessageKind::Command,
                ThreadId::from(workflow_id),
                payload,
            )
            .with_priority(task_snapshot.priority)
            .with_correlation(task_snapshot.task_id.to_string());

            (
                envelope,
                task_snapshot.task_id,
                task_snapshot.retry_count,
                task_snapshot.timeout,
            )
        };

        self.task_index
            .insert(task_id, (workflow_id, step.step_id.clone()));

        match self.registry.route(envelope).await {
            Ok(()) => {
                info!(
                    workflow_id = %workflow_id,
                    step_id = %step.step_id,
                    task_id = %task_id,
                    worker_id = %target,
                    attempt = attempt + 1,
                    "task dispatched"
                );
                self.arm_timeout(workflow_id, task_id, attempt, timeout);
            }
            Err(error) => {
                warn!(
                    workflow_id = %workflow_id,
                    step_id = %step.step_id,
                    %error,
                    "task dispatch failed"
                );
                self.handle_task_failure(task_id, format!("dispatch failed: {error}"))
                    .await;
            }
        }
    }

    /// Watchdog for the open timeout gap: a stalled task is failed after
    /// its declared timeout and enters the normal retry path. The attempt
    /// number keeps stale timers from superseded attempts inert.
    fn arm_timeout(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        attempt: u32,
        timeout: Duration,
    ) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(InternalEvent::TimeoutCheck {
                workflow_id,
                task_id,
                attempt,
            });
        });
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::TaskComplete => self.on_task_complete(envelope).await,
            MessageKind::TaskFail => self.on_task_fail(envelope).await,
            MessageKind::Heartbeat => {
                self.last_heard
                    .insert(envelope.sender_id.clone(), Utc::now());
                debug!(worker_id = %envelope.sender_id, "heartbeat received");
            }
            MessageKind::Command => self.on_command_envelope(envelope).await,
            MessageKind::Error => {
                // an error reply correlated to a dispatched task fails it
                let correlated = envelope
                    .correlation_id
                    .as_deref()
                    .and_then(|id| serde_json::from_value::<TaskId>(serde_json::json!(id)).ok());
                if let Some(task_id) = correlated {
                    let reason = envelope
                        .payload
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("worker reported an error")
                        .to_string();
                    self.handle_task_failure(task_id, reason).await;
                } else {
                    warn!(
                        sender_id = %envelope.sender_id,
                        payload = %serde_json::Value::Object(envelope.payload),
                        "error envelope received"
                    );
                }
            }
            MessageKind::Response => {
                debug!(sender_id = %envelope.sender_id, "acknowledgement received");
            }
            _ => {
                debug!(kind = %envelope.kind, "ignoring envelope");
            }
        }
    }

    fn payload_task_id(payload: &Payload) -> Option<TaskId> {
        payload
            .get("task_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    async fn on_task_complete(&mut self, envelope: Envelope) {
        let Some(task_id) = Self::payload_task_id(&envelope.payload) else {
            warn!("task completion without task_id");
            return;
        };
        let Some((workflow_id, step_id)) = self.task_index.get(&task_id).cloned() else {
            debug!(task_id = %task_id, "completion for unknown task");
            return;
        };
        let Some(instance) = self.active.get_mut(&workflow_id) else {
            debug!(task_id = %task_id, "completion for archived workflow");
            return;
        };
        let Some(task) = instance.tasks.get_mut(&step_id) else {
            return;
        };
        // late results after cancel or retry are ignored; everything is
        // keyed off the task id, not arrival order
        if !task.status.is_in_flight() {
            debug!(task_id = %task_id, status = %task.status, "stale completion ignored");
            return;
        }

        let result = envelope
            .payload
            .get("result")
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        task.mark_completed(result.clone());

        // merge the step result into the accumulated context; later
        // results overwrite overlapping keys
        for (key, value) in result {
            instance.context.insert(key, value);
        }
        instance.updated_at = Utc::now();
        info!(
            workflow_id = %workflow_id,
            step_id = %step_id,
            task_id = %task_id,
            "task completed"
        );

        self.advance(workflow_id).await;
    }

    async fn on_task_fail(&mut self, envelope: Envelope) {
        let Some(task_id) = Self::payload_task_id(&envelope.payload) else {
            warn!("task failure without task_id");
            return;
        };
        let reason = envelope
            .payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        self.handle_task_failure(task_id, reason).await;
    }

    async fn handle_task_failure(&mut self, task_id: TaskId, reason: String) {
        let Some((workflow_id, step_id)) = self.task_index.get(&task_id).cloned() else {
            debug!(task_id = %task_id, "failure for unknown task");
            return;
        };
        let Some(instance) = self.active.get_mut(&workflow_id) else {
            return;
        };
        let Some(task) = instance.tasks.get_mut(&step_id) else {
            return;
        };
        if !task.status.is_in_flight() {
            debug!(task_id = %task_id, status = %task.status, "stale failure ignored");
            return;
        }

        task.mark_failed(&reason);
        instance.updated_at = Utc::now();
        warn!(
            workflow_id = %workflow_id,
            step_id = %step_id,
            task_id = %task_id,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            %reason,
            "task failed"
        );

        let policy = instance.definition.retry_policy.clone();
        if task.retry_count >= policy.max_retries {
            self.fail_instance(
                workflow_id,
                format!(
                    "step '{step_id}' failed after {} retries: {reason}",
                    policy.max_retries
                ),
            );
            return;
        }

        task.retry_count += 1;
        task.status = TaskStatus::Retrying;
        let delay = policy.delay_for(task.retry_count);
        info!(
            workflow_id = %workflow_id,
            step_id = %step_id,
            retry = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(InternalEvent::RetryDue {
                workflow_id,
                step_id,
            });
        });
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::RetryDue {
                workflow_id,
                step_id,
            } => {
                let should_advance = {
                    let Some(instance) = self.active.get_mut(&workflow_id) else {
                        return;
                    };
                    let Some(task) = instance.tasks.get_mut(&step_id) else {
                        return;
                    };
                    if task.status != TaskStatus::Retrying {
                        return;
                    }
                    task.reset_for_retry();
                    instance.status == WorkflowStatus::Running
                };
                // a paused instance keeps the reset task pending; resume
                // picks it up
                if should_advance {
                    self.advance(workflow_id).await;
                }
            }
            InternalEvent::TimeoutCheck {
                workflow_id,
                task_id,
                attempt,
            } => {
                // the timer is stale once the attempt number moved on
                let stalled_timeout = self
                    .active
                    .get(&workflow_id)
                    .zip(self.task_index.get(&task_id))
                    .and_then(|(instance, (_, step_id))| instance.tasks.get(step_id))
                    .filter(|task| {
                        task.retry_count == attempt
                            && matches!(task.status, TaskStatus::Assigned | TaskStatus::Running)
                    })
                    .map(|task| task.timeout);

                if let Some(timeout) = stalled_timeout {
                    warn!(workflow_id = %workflow_id, task_id = %task_id, "task timed out");
                    self.handle_task_failure(
                        task_id,
                        format!("task timed out after {}s", timeout.as_secs_f64()),
                    )
                    .await;
                }
            }
        }
    }

    fn pause(&mut self, workflow_id: WorkflowId) -> Result<(), OrchestratorError> {
        let instance = self.require_active(workflow_id, "pause")?;
        if instance.status != WorkflowStatus::Running {
            return Err(OrchestratorError::InvalidState {
                workflow_id,
                status: instance.status,
                action: "pause",
            });
        }
        instance.status = WorkflowStatus::Paused;
        instance.updated_at = Utc::now();
        info!(workflow_id = %workflow_id, "workflow paused");
        Ok(())
    }

    async fn resume(&mut self, workflow_id: WorkflowId) -> Result<(), OrchestratorError> {
        {
            let instance = self.require_active(workflow_id, "resume")?;
            if instance.status != WorkflowStatus::Paused {
                return Err(OrchestratorError::InvalidState {
                    workflow_id,
                    status: instance.status,
                    action: "resume",
                });
            }
            instance.status = WorkflowStatus::Running;
            instance.updated_at = Utc::now();
        }
        info!(workflow_id = %workflow_id, "workflow resumed");
        self.advance(workflow_id).await;
        Ok(())
    }

    fn cancel(&mut self, workflow_id: WorkflowId) -> Result<(), OrchestratorError> {
        let mut instance = match self.active.remove(&workflow_id) {
            Some(instance) => instance,
            None => {
                return Err(match self.archive.get(&workflow_id) {
                    Some(archived) => OrchestratorError::InvalidState {
                        workflow_id,
                        status: archived.status,
                        action: "cancel",
                    },
                    None => OrchestratorError::NotFound(workflow_id),
                })
            }
        };

        instance.status = WorkflowStatus::Cancelled;
        for task in instance.tasks.values_mut() {
            if !task.status.is_terminal() {
                task.mark_cancelled();
            }
        }
        instance.updated_at = Utc::now();
        info!(workflow_id = %workflow_id, "workflow cancelled");
        self.archive_instance(instance);
        Ok(())
    }

    fn require_active(
        &mut self,
        workflow_id: WorkflowId,
        action: &'static str,
    ) -> Result<&mut WorkflowInstance, OrchestratorError> {
        // lookup split so the archive probe runs without a live borrow
        if !self.active.contains_key(&workflow_id) {
            return Err(match self.archive.get(&workflow_id) {
                Some(archived) => OrchestratorError::InvalidState {
                    workflow_id,
                    status: archived.status,
                    action,
                },
                None => OrchestratorError::NotFound(workflow_id),
            });
        }
        self.active
            .get_mut(&workflow_id)
            .ok_or(OrchestratorError::NotFound(workflow_id))
    }

    fn finish(&mut self, workflow_id: WorkflowId) {
        if let Some(mut instance) = self.active.remove(&workflow_id) {
            instance.status = WorkflowStatus::Completed;
            instance.updated_at = Utc::now();
            info!(
                workflow_id = %workflow_id,
                steps = instance.tasks.len(),
                "workflow completed"
            );
            self.archive_instance(instance);
        }
    }

    /// Retries exhausted or dispatch impossible: the whole instance fails.
    /// There is no per-step skip/continue policy.
    fn fail_instance(&mut self, workflow_id: WorkflowId, reason: String) {
        if let Some(mut instance) = self.active.remove(&workflow_id) {
            instance.status = WorkflowStatus::Failed;
            instance.error = Some(reason.clone());
            instance.updated_at = Utc::now();
            error!(workflow_id = %workflow_id, %reason, "workflow failed");
            self.archive_instance(instance);
        }
    }

    fn archive_instance(&mut self, instance: WorkflowInstance) {
        for task in instance.tasks.values() {
            self.task_index.remove(&task.task_id);
        }
        self.archive.insert(instance.workflow_id, instance);
    }

    fn workflow_snapshot(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowSnapshot, OrchestratorError> {
        self.active
            .get(&workflow_id)
            .or_else(|| self.archive.get(&workflow_id))
            .map(WorkflowInstance::snapshot)
            .ok_or(OrchestratorError::NotFound(workflow_id))
    }

    async fn system_status(&self) -> Result<SystemStatus, OrchestratorError> {
        let workers = self.registry.all_statuses().await?;
        let online = workers
            .iter()
            .filter(|w| w.state.is_routable())
            .count();
        let mut definitions: Vec<String> = self.definitions.keys().cloned().collect();
        definitions.sort();
        Ok(SystemStatus {
            registered_workers: workers.len(),
            online_workers: online,
            active_workflows: self.active.len(),
            archived_workflows: self.archive.len(),
            definitions,
            workers,
            last_heard: self.last_heard.clone(),
        })
    }

    /// Envelope-level control interface: command payloads answered with
    /// structured response envelopes. Failures are data here, never errors.
    async fn on_command_envelope(&mut self, envelope: Envelope) {
        let command = envelope
            .payload
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let (kind, mut payload) = match command.as_str() {
            "workflow_start" => {
                let workflow_type = envelope
                    .payload
                    .get("workflow_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let context = envelope
                    .payload
                    .get("context")
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                match self.start_workflow(&workflow_type, context).await {
                    Ok(workflow_id) => {
                        let mut p = Payload::new();
                        p.insert("status".to_string(), serde_json::json!("success"));
                        p.insert(
                            "workflow_id".to_string(),
                            serde_json::json!(workflow_id.to_string()),
                        );
                        (MessageKind::Response, p)
                    }
                    Err(error) => (MessageKind::Error, error_payload(error)),
                }
            }
            "workflow_pause" | "workflow_resume" | "workflow_cancel" => {
                match Self::payload_workflow_id(&envelope.payload) {
                    Some(workflow_id) => {
                        let outcome = match command.as_str() {
                            "workflow_pause" => self.pause(workflow_id).map(|()| "paused"),
                            "workflow_resume" => {
                                self.resume(workflow_id).await.map(|()| "resumed")
                            }
                            _ => self.cancel(workflow_id).map(|()| "cancelled"),
                        };
                        match outcome {
                            Ok(status) => {
                                let mut p = Payload::new();
                                p.insert("status".to_string(), serde_json::json!(status));
                                p.insert(
                                    "workflow_id".to_string(),
                                    serde_json::json!(workflow_id.to_string()),
                                );
                                (MessageKind::Response, p)
                            }
                            Err(error) => (MessageKind::Error, error_payload(error)),
                        }
                    }
                    None => (
                        MessageKind::Error,
                        text_error_payload("missing or invalid 'workflow_id'"),
                    ),
                }
            }
            "workflow_status" => match Self::payload_workflow_id(&envelope.payload) {
                Some(workflow_id) => match self.workflow_snapshot(workflow_id) {
                    Ok(snapshot) => match serde_json::to_value(&snapshot) {
                        Ok(value) => {
                            let mut p = Payload::new();
                            p.insert("status".to_string(), serde_json::json!("success"));
                            p.insert("workflow".to_string(), value);
                            (MessageKind::Response, p)
                        }
                        Err(error) => (
                            MessageKind::Error,
                            text_error_payload(&error.to_string()),
                        ),
                    },
                    Err(error) => (MessageKind::Error, error_payload(error)),
                },
                None => (
                    MessageKind::Error,
                    text_error_payload("missing or invalid 'workflow_id'"),
                ),
            },
            other => (
                MessageKind::Error,
                text_error_payload(&format!("unknown command '{other}'")),
            ),
        };

        payload.insert("command".to_string(), serde_json::json!(command));
        let reply = envelope.reply(self.config.orchestrator_id.clone(), kind, payload);
        if let Err(error) = self.registry.route(reply).await {
            debug!(%error, "command reply not delivered");
        }
    }

    fn payload_workflow_id(payload: &Payload) -> Option<WorkflowId> {
        payload
            .get("workflow_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn error_payload(error: OrchestratorError) -> Payload {
    text_error_payload(&error.to_string())
}

fn text_error_payload(error: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("status".to_string(), serde_json::json!("error"));
    payload.insert("error".to_string(), serde_json::json!(error));
    payload
}
