//! Task executor contract
//!
//! [`TaskWorker`] is the reusable worker shape for orchestrator-issued
//! work: it accepts `execute_task` commands, keeps a FIFO queue under a
//! concurrency limit, runs the domain logic behind the [`TaskExecutor`]
//! trait, and reports completion or failure back to the orchestrator over
//! the same envelope path. Cancellation is cooperative: a cancelled task
//! is no longer reported, and discarding partial side effects is the
//! domain logic's responsibility.

use crate::registry::RegistryHandle;
use crate::runtime::{Worker, WorkerContext, WorkerError};
use async_trait::async_trait;
use protocol::{
    Capability, CapabilityName, Envelope, MessageKind, Payload, Task, TaskId, ThreadId, WorkerId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure of the domain task logic
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task input invalid: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::Failed(format!("{error:#}"))
    }
}

/// Domain logic plugged into a [`TaskWorker`]
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Capabilities this executor contributes beyond the base task contract
    fn capabilities(&self) -> Vec<Capability>;

    /// Run one task against the accumulated workflow context
    async fn execute(&self, task: &Task, workflow_context: &Payload)
        -> Result<Payload, TaskError>;
}

struct QueuedTask {
    task: Task,
    workflow_context: Payload,
}

/// Worker that executes orchestrator tasks through a [`TaskExecutor`]
pub struct TaskWorker<E: TaskExecutor> {
    worker_id: WorkerId,
    display_name: String,
    executor: Arc<E>,
    registry: RegistryHandle,
    queue: VecDeque<QueuedTask>,
    active: HashMap<TaskId, CancellationToken>,
    max_concurrent: usize,
}

impl<E: TaskExecutor> TaskWorker<E> {
    pub fn new(
        worker_id: WorkerId,
        display_name: impl Into<String>,
        executor: E,
        registry: RegistryHandle,
    ) -> Self {
        Self {
            worker_id,
            display_name: display_name.into(),
            executor: Arc::new(executor),
            registry,
            queue: VecDeque::new(),
            active: HashMap::new(),
            max_concurrent: 1,
        }
    }

    /// Raise the concurrency limit above the default of one task at a time
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    async fn handle_execute(
        &mut self,
        envelope: Envelope,
        ctx: &WorkerContext,
    ) -> Result<(), WorkerError> {
        let task_value = envelope
            .payload
            .get("task")
            .ok_or_else(|| WorkerError::InvalidTask("missing 'task' in payload".to_string()))?;
        let task: Task = serde_json::from_value(task_value.clone())
            .map_err(|error| WorkerError::InvalidTask(error.to_string()))?;
        let workflow_context = envelope
            .payload
            .get("workflow_context")
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        info!(
            worker_id = %self.worker_id,
            task_id = %task.task_id,
            task_type = %task.task_type,
            queued = self.queue.len(),
            "task accepted"
        );

        let mut ack = Payload::new();
        ack.insert("status".to_string(), serde_json::json!("accepted"));
        ack.insert(
            "task_id".to_string(),
            serde_json::json!(task.task_id.to_string()),
        );
        let reply = envelope.reply(self.worker_id.clone(), MessageKind::Response, ack);

        self.queue.push_back(QueuedTask {
            task,
            workflow_context,
        });
        self.pump();

        if let Err(error) = ctx.send(reply).await {
            debug!(worker_id = %self.worker_id, %error, "task ack not delivered");
        }
        Ok(())
    }

    async fn handle_cancel(
        &mut self,
        envelope: Envelope,
        ctx: &WorkerContext,
    ) -> Result<(), WorkerError> {
        let task_id: TaskId = envelope
            .payload
            .get("task_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| {
                WorkerError::InvalidTask("cancel_task requires a 'task_id'".to_string())
            })?;

        if let Some(token) = self.active.remove(&task_id) {
            token.cancel();
            info!(worker_id = %self.worker_id, task_id = %task_id, "running task cancelled");
        } else {
            let before = self.queue.len();
            self.queue.retain(|queued| queued.task.task_id != task_id);
            if self.queue.len() < before {
                info!(worker_id = %self.worker_id, task_id = %task_id, "queued task cancelled");
            } else {
                debug!(worker_id = %self.worker_id, task_id = %task_id, "cancel for unknown task");
            }
        }
        self.pump();

        let mut payload = Payload::new();
        payload.insert("status".to_string(), serde_json::json!("cancelled"));
        payload.insert(
            "task_id".to_string(),
            serde_json::json!(task_id.to_string()),
        );
        let reply = envelope.reply(self.worker_id.clone(), MessageKind::Response, payload);
        if let Err(error) = ctx.send(reply).await {
            debug!(worker_id = %self.worker_id, %error, "cancel ack not delivered");
        }
        Ok(())
    }

    fn handle_settled(&mut self, envelope: &Envelope) {
        if let Some(task_id) = envelope
            .payload
            .get("task_id")
            .and_then(|v| serde_json::from_value::<TaskId>(v.clone()).ok())
        {
            self.active.remove(&task_id);
        }
        self.pump();
    }

    /// Start queued tasks until the concurrency limit is reached
    fn pump(&mut self) {
        while self.active.len() < self.max_concurrent {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.start_task(queued);
        }
    }

    fn start_task(&mut self, queued: QueuedTask) {
        let mut task = queued.task;
        task.mark_running();

        let token = CancellationToken::new();
        self.active.insert(task.task_id, token.clone());
        info!(
            worker_id = %self.worker_id,
            task_id = %task.task_id,
            task_type = %task.task_type,
            "task started"
        );

        let executor = Arc::clone(&self.executor);
        let registry = self.registry.clone();
        let worker_id = self.worker_id.clone();
        let workflow_context = queued.workflow_context;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = executor.execute(&task, &workflow_context) => Some(result),
            };

            match outcome {
                None => {
                    info!(task_id = %task.task_id, "task cancelled, result discarded");
                }
                Some(Ok(result)) => {
                    report_outcome(&registry, &worker_id, &task, Ok(result)).await;
                }
                Some(Err(error)) => {
                    warn!(task_id = %task.task_id, %error, "task failed");
                    report_outcome(&registry, &worker_id, &task, Err(error)).await;
                }
            }

            // Nudge our own mailbox so the loop frees the slot and pulls
            // the next queued task, whatever the outcome was.
            let mut payload = Payload::new();
            payload.insert("command".to_string(), serde_json::json!("task_settled"));
            payload.insert(
                "task_id".to_string(),
                serde_json::json!(task.task_id.to_string()),
            );
            let settle = Envelope::new(
                worker_id.clone(),
                worker_id.clone(),
                MessageKind::Command,
                ThreadId::from(task.workflow_id),
                payload,
            );
            if let Err(error) = registry.route(settle).await {
                warn!(worker_id = %worker_id, task_id = %task.task_id, %error,
                      "task_settled not delivered; slot stays occupied");
            }
        });
    }
}

/// Report a task outcome to the orchestrator that issued it
async fn report_outcome(
    registry: &RegistryHandle,
    worker_id: &WorkerId,
    task: &Task,
    outcome: Result<Payload, TaskError>,
) {
    let mut payload = Payload::new();
    payload.insert(
        "task_id".to_string(),
        serde_json::json!(task.task_id.to_string()),
    );
    payload.insert(
        "workflow_id".to_string(),
        serde_json::json!(task.workflow_id.to_string()),
    );

    let kind = match outcome {
        Ok(result) => {
            payload.insert("result".to_string(), serde_json::Value::Object(result));
            payload.insert("status".to_string(), serde_json::json!("completed"));
            MessageKind::TaskComplete
        }
        Err(error) => {
            payload.insert("error".to_string(), serde_json::json!(error.to_string()));
            payload.insert("status".to_string(), serde_json::json!("failed"));
            MessageKind::TaskFail
        }
    };

    let envelope = Envelope::new(
        worker_id.clone(),
        task.orchestrator_id.clone(),
        kind,
        ThreadId::from(task.workflow_id),
        payload,
    )
    .with_priority(protocol::Priority::High)
    .with_correlation(task.task_id.to_string());

    if let Err(error) = registry.route(envelope).await {
        warn!(
            task_id = %task.task_id,
            %error,
            "task outcome could not be reported"
        );
    }
}

#[async_trait]
impl<E: TaskExecutor> Worker for TaskWorker<E> {
    fn worker_id(&self) -> WorkerId {
        self.worker_id.clone()
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn capabilities(&self) -> Vec<Capability> {
        let base = Capability::new(
            CapabilityName::new("execute_task").expect("static capability name is valid"),
            "Execute tasks assigned by the orchestrator",
        );
        let mut capabilities = vec![base];
        capabilities.extend(self.executor.capabilities());
        capabilities
    }

    async fn handle_envelope(
        &mut self,
        envelope: Envelope,
        ctx: &WorkerContext,
    ) -> Result<(), WorkerError> {
        match envelope.kind {
            MessageKind::Command => {
                let command = envelope
                    .payload
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                match command.as_str() {
                    "execute_task" => self.handle_execute(envelope, ctx).await,
                    "cancel_task" => self.handle_cancel(envelope, ctx).await,
                    "task_settled" => {
                        self.handle_settled(&envelope);
                        Ok(())
                    }
                    other => Err(WorkerError::UnsupportedCommand(other.to_string())),
                }
            }
            // A bare task assignment is treated like an execute_task command
            MessageKind::TaskAssign => self.handle_execute(envelope, ctx).await,
            _ => {
                debug!(
                    worker_id = %self.worker_id,
                    kind = %envelope.kind,
                    "ignoring envelope"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, RegistryConfig, RegistryHandle, WorkerRegistration};
    use crate::runtime::{spawn_worker, WorkerConfig};
    use protocol::{WorkerState, WorkerStatus, WorkflowId};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};

    struct SlowEcho {
        delay: Duration,
        executions: Arc<AtomicU64>,
    }

    #[async_trait]
    impl TaskExecutor for SlowEcho {
        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::new(
                CapabilityName::new("slow_echo").expect("valid"),
                "echoes after a delay",
            )]
        }

        async fn execute(
            &self,
            task: &Task,
            _workflow_context: &Payload,
        ) -> Result<Payload, TaskError> {
            tokio::time::sleep(self.delay).await;
            self.executions.fetch_add(1, Ordering::SeqCst);
            let mut result = Payload::new();
            result.insert(
                "echoed".to_string(),
                serde_json::json!(task.task_type.clone()),
            );
            Ok(result)
        }
    }

    async fn register_orchestrator_probe(
        registry: &RegistryHandle,
        id: &str,
    ) -> mpsc::Receiver<Envelope> {
        let worker_id = WorkerId::from(id);
        let (tx, rx) = mpsc::channel(64);
        let mut status = WorkerStatus::offline(worker_id.clone(), id);
        status.state = WorkerState::Online;
        let (_status_tx, status_rx) = watch::channel(status);
        registry
            .register(WorkerRegistration {
                worker_id,
                display_name: id.to_string(),
                capabilities: vec![],
                mailbox: tx,
                status: status_rx,
            })
            .await
            .expect("probe registration succeeds");
        rx
    }

    fn execute_command(orchestrator: &str, worker: &str, task: &Task) -> Envelope {
        let mut payload = Payload::new();
        payload.insert("command".to_string(), serde_json::json!("execute_task"));
        payload.insert(
            "task".to_string(),
            serde_json::to_value(task).expect("task serializes"),
        );
        payload.insert(
            "workflow_context".to_string(),
            serde_json::json!({"alert_id": "a-1"}),
        );
        Envelope::new(
            WorkerId::from(orchestrator),
            WorkerId::from(worker),
            MessageKind::Command,
            ThreadId::from(task.workflow_id),
            payload,
        )
    }

    fn sample_task(worker: &str, orchestrator: &str) -> Task {
        Task::new(
            WorkerId::from(worker),
            "echo_me",
            Payload::new(),
            WorkflowId::new(),
            WorkerId::from(orchestrator),
        )
    }

    async fn next_of_kind(
        mailbox: &mut mpsc::Receiver<Envelope>,
        kind: MessageKind,
    ) -> Envelope {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
                .await
                .expect("envelope arrives")
                .expect("channel open");
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn executes_task_and_reports_completion() {
        let registry = Registry::spawn(RegistryConfig::default());
        let mut orchestrator = register_orchestrator_probe(&registry, "orch").await;
        let executions = Arc::new(AtomicU64::new(0));
        let worker = TaskWorker::new(
            WorkerId::from("echoer"),
            "Echo Worker",
            SlowEcho {
                delay: Duration::from_millis(5),
                executions: Arc::clone(&executions),
            },
            registry.clone(),
        );
        let handle = spawn_worker(worker, registry.clone(), WorkerConfig::default())
            .await
            .expect("spawn succeeds");

        let task = sample_task("echoer", "orch");
        registry
            .route(execute_command("orch", "echoer", &task))
            .await
            .expect("delivery succeeds");

        let complete = next_of_kind(&mut orchestrator, MessageKind::TaskComplete).await;
        assert_eq!(
            complete.payload.get("task_id").and_then(|v| v.as_str()),
            Some(task.task_id.to_string().as_str())
        );
        assert_eq!(
            complete.payload.get("status").and_then(|v| v.as_str()),
            Some("completed")
        );
        let result = complete
            .payload
            .get("result")
            .and_then(|v| v.as_object())
            .expect("result present");
        assert_eq!(result.get("echoed"), Some(&serde_json::json!("echo_me")));
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn missing_task_payload_yields_error_reply() {
        let registry = Registry::spawn(RegistryConfig::default());
        let mut orchestrator = register_orchestrator_probe(&registry, "orch").await;
        let worker = TaskWorker::new(
            WorkerId::from("strict"),
            "Strict Worker",
            SlowEcho {
                delay: Duration::from_millis(1),
                executions: Arc::new(AtomicU64::new(0)),
            },
            registry.clone(),
        );
        let handle = spawn_worker(worker, registry.clone(), WorkerConfig::default())
            .await
            .expect("spawn succeeds");

        let mut payload = Payload::new();
        payload.insert("command".to_string(), serde_json::json!("execute_task"));
        let bad = Envelope::new(
            WorkerId::from("orch"),
            WorkerId::from("strict"),
            MessageKind::Command,
            ThreadId::new("t").expect("non-empty"),
            payload,
        );
        registry.route(bad).await.expect("delivery succeeds");

        let error = next_of_kind(&mut orchestrator, MessageKind::Error).await;
        let text = error
            .payload
            .get("error")
            .and_then(|v| v.as_str())
            .expect("error text");
        assert!(text.contains("invalid task command"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn tasks_beyond_limit_wait_in_fifo_order() {
        let registry = Registry::spawn(RegistryConfig::default());
        let mut orchestrator = register_orchestrator_probe(&registry, "orch").await;
        let executions = Arc::new(AtomicU64::new(0));
        let worker = TaskWorker::new(
            WorkerId::from("serial"),
            "Serial Worker",
            SlowEcho {
                delay: Duration::from_millis(30),
                executions: Arc::clone(&executions),
            },
            registry.clone(),
        );
        let handle = spawn_worker(worker, registry.clone(), WorkerConfig::default())
            .await
            .expect("spawn succeeds");

        let first = sample_task("serial", "orch");
        let second = sample_task("serial", "orch");
        registry
            .route(execute_command("orch", "serial", &first))
            .await
            .expect("delivery succeeds");
        registry
            .route(execute_command("orch", "serial", &second))
            .await
            .expect("delivery succeeds");

        let done_first = next_of_kind(&mut orchestrator, MessageKind::TaskComplete).await;
        let done_second = next_of_kind(&mut orchestrator, MessageKind::TaskComplete).await;
        assert_eq!(
            done_first.payload.get("task_id").and_then(|v| v.as_str()),
            Some(first.task_id.to_string().as_str())
        );
        assert_eq!(
            done_second.payload.get("task_id").and_then(|v| v.as_str()),
            Some(second.task_id.to_string().as_str())
        );
        assert_eq!(executions.load(Ordering::SeqCst), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_running_task_reports_nothing() {
        let registry = Registry::spawn(RegistryConfig::default());
        let mut orchestrator = register_orchestrator_probe(&registry, "orch").await;
        let executions = Arc::new(AtomicU64::new(0));
        let worker = TaskWorker::new(
            WorkerId::from("cancellable"),
            "Cancellable Worker",
            SlowEcho {
                delay: Duration::from_millis(200),
                executions: Arc::clone(&executions),
            },
            registry.clone(),
        );
        let handle = spawn_worker(worker, registry.clone(), WorkerConfig::default())
            .await
            .expect("spawn succeeds");

        let task = sample_task("cancellable", "orch");
        registry
            .route(execute_command("orch", "cancellable", &task))
            .await
            .expect("delivery succeeds");

        // wait for the accept ack so the task is running, then cancel it
        let _ack = next_of_kind(&mut orchestrator, MessageKind::Response).await;
        let mut payload = Payload::new();
        payload.insert("command".to_string(), serde_json::json!("cancel_task"));
        payload.insert(
            "task_id".to_string(),
            serde_json::json!(task.task_id.to_string()),
        );
        let cancel = Envelope::new(
            WorkerId::from("orch"),
            WorkerId::from("cancellable"),
            MessageKind::Command,
            ThreadId::from(task.workflow_id),
            payload,
        );
        registry.route(cancel).await.expect("delivery succeeds");

        let ack = next_of_kind(&mut orchestrator, MessageKind::Response).await;
        assert_eq!(
            ack.payload.get("status").and_then(|v| v.as_str()),
            Some("cancelled")
        );

        // no completion or failure ever shows up for the cancelled task
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(envelope) = orchestrator.try_recv() {
            assert!(
                envelope.kind != MessageKind::TaskComplete
                    && envelope.kind != MessageKind::TaskFail,
                "cancelled task must not report an outcome"
            );
        }
        assert_eq!(executions.load(Ordering::SeqCst), 0);

        handle.shutdown().await;
    }
}
