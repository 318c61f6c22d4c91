//! Worker runtime: bounded mailbox, processing loop and heartbeat
//!
//! [`spawn_worker`] registers a [`Worker`] with the registry and drives its
//! cooperative loop: one envelope at a time, heartbeat ticks in between,
//! per-thread bookkeeping on the side. A failing handler never stops the
//! loop; it produces an error-reply envelope and the next message is
//! processed. The runtime is the single writer of the worker's status
//! watch channel.

use crate::registry::{RegistryError, RegistryHandle, WorkerRegistration};
use async_trait::async_trait;
use chrono::Utc;
use protocol::{
    Capability, Envelope, MessageKind, Payload, ThreadId, WorkerId, WorkerState, WorkerStatus,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker-level failures surfaced by envelope handlers
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid task command: {0}")]
    InvalidTask(String),

    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),

    #[error("routing failed: {0}")]
    Routing(#[from] RegistryError),

    #[error("{0}")]
    Handler(String),
}

/// Behavior a worker plugs into the runtime
#[async_trait]
pub trait Worker: Send + 'static {
    /// Stable identifier the worker registers under
    fn worker_id(&self) -> WorkerId;

    fn display_name(&self) -> String {
        self.worker_id().to_string()
    }

    /// Capabilities advertised to the registry at registration time
    fn capabilities(&self) -> Vec<Capability>;

    /// Handle one envelope; errors are converted to error replies
    async fn handle_envelope(
        &mut self,
        envelope: Envelope,
        ctx: &WorkerContext,
    ) -> Result<(), WorkerError>;

    /// Called once before the loop starts processing
    async fn on_start(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Called after the mailbox has been drained on shutdown
    async fn on_shutdown(&mut self, _ctx: &WorkerContext) {}
}

/// Runtime services available to a worker while handling envelopes
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: WorkerId,
    registry: RegistryHandle,
}

impl WorkerContext {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Send an envelope through the registry
    pub async fn send(&self, envelope: Envelope) -> Result<(), RegistryError> {
        self.registry.route(envelope).await
    }
}

/// Runtime tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bounded mailbox capacity; deliveries beyond this fail with `Busy`
    pub mailbox_capacity: usize,
    /// Heartbeat emission period
    pub heartbeat_interval: Duration,
    /// Local per-thread bookkeeping entries older than this are dropped
    pub thread_ttl: Duration,
    /// How long shutdown keeps draining the mailbox before going offline
    pub drain_grace: Duration,
    /// Receiver of periodic heartbeat envelopes, usually the orchestrator
    pub heartbeat_target: Option<WorkerId>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            heartbeat_interval: Duration::from_secs(30),
            thread_ttl: Duration::from_secs(300),
            drain_grace: Duration::from_secs(5),
            heartbeat_target: None,
        }
    }
}

/// Handle to a spawned worker runtime
pub struct WorkerHandle {
    worker_id: WorkerId,
    shutdown: CancellationToken,
    status: watch::Receiver<WorkerStatus>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Latest status snapshot published by the runtime
    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Request graceful shutdown and wait for the loop to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.join.await {
            warn!(worker_id = %self.worker_id, %error, "worker task join failed");
        }
    }
}

/// Register a worker and start its processing loop
pub async fn spawn_worker<W: Worker + Sync>(
    worker: W,
    registry: RegistryHandle,
    config: WorkerConfig,
) -> Result<WorkerHandle, RegistryError> {
    let worker_id = worker.worker_id();
    let display_name = worker.display_name();

    let (mailbox_tx, mailbox_rx) = mpsc::channel::<Envelope>(config.mailbox_capacity);
    let (status_tx, status_rx) =
        watch::channel(WorkerStatus::offline(worker_id.clone(), &display_name));

    registry
        .register(WorkerRegistration {
            worker_id: worker_id.clone(),
            display_name: display_name.clone(),
            capabilities: worker.capabilities(),
            mailbox: mailbox_tx.clone(),
            status: status_rx.clone(),
        })
        .await?;

    let shutdown = CancellationToken::new();
    let runtime = RuntimeLoop {
        worker,
        config,
        registry,
        mailbox_tx,
        status_tx,
        shutdown: shutdown.clone(),
        threads: HashMap::new(),
        processed: 0,
        errors: 0,
    };
    let join = tokio::spawn(runtime.run(mailbox_rx));

    Ok(WorkerHandle {
        worker_id,
        shutdown,
        status: status_rx,
        join,
    })
}

struct ThreadActivity {
    started_at: Instant,
    messages: u64,
}

struct RuntimeLoop<W: Worker> {
    worker: W,
    config: WorkerConfig,
    registry: RegistryHandle,
    /// Clone of the mailbox sender, kept to observe queue depth
    mailbox_tx: mpsc::Sender<Envelope>,
    status_tx: watch::Sender<WorkerStatus>,
    shutdown: CancellationToken,
    threads: HashMap<ThreadId, ThreadActivity>,
    processed: u64,
    errors: u64,
}

impl<W: Worker> RuntimeLoop<W> {
    async fn run(mut self, mut mailbox_rx: mpsc::Receiver<Envelope>) {
        let worker_id = self.worker.worker_id();
        let ctx = WorkerContext {
            worker_id: worker_id.clone(),
            registry: self.registry.clone(),
        };

        if let Err(error) = self.worker.on_start(&ctx).await {
            error!(worker_id = %worker_id, %error, "worker startup failed");
            self.publish(WorkerState::Error);
            return;
        }

        self.publish(WorkerState::Online);
        info!(worker_id = %worker_id, "worker online");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(worker_id = %worker_id, "shutdown requested");
                    break;
                }
                _ = heartbeat.tick() => {
                    self.emit_heartbeat(&ctx).await;
                }
                envelope = mailbox_rx.recv() => match envelope {
                    Some(envelope) => self.process(envelope, &ctx).await,
                    None => {
                        debug!(worker_id = %worker_id, "mailbox closed");
                        break;
                    }
                },
            }
        }

        // Busy is not routable, so flipping state stops new deliveries
        // while the drain below finishes what is already queued.
        self.publish(WorkerState::Busy);
        let deadline = Instant::now() + self.config.drain_grace;
        while Instant::now() < deadline {
            match mailbox_rx.try_recv() {
                Ok(envelope) => self.process(envelope, &ctx).await,
                Err(_) => break,
            }
        }

        self.worker.on_shutdown(&ctx).await;
        self.publish(WorkerState::Offline);

        if let Err(error) = self.registry.unregister(worker_id.clone()).await {
            debug!(worker_id = %worker_id, %error, "unregister after shutdown failed");
        }
        info!(worker_id = %worker_id, "worker stopped");
    }

    async fn process(&mut self, envelope: Envelope, ctx: &WorkerContext) {
        self.track_thread(&envelope);

        let worker_id = self.worker.worker_id();
        debug!(
            worker_id = %worker_id,
            message_id = %envelope.id,
            kind = %envelope.kind,
            thread_id = %envelope.thread_id,
            "processing envelope"
        );

        let outcome = match envelope.kind {
            MessageKind::Heartbeat => self.answer_heartbeat(&envelope, ctx).await,
            MessageKind::Error => {
                warn!(
                    worker_id = %worker_id,
                    message_id = %envelope.id,
                    payload = %serde_json::Value::Object(envelope.payload.clone()),
                    "received error envelope"
                );
                Ok(())
            }
            _ => self.worker.handle_envelope(envelope.clone(), ctx).await,
        };

        match outcome {
            Ok(()) => self.processed += 1,
            Err(error) => {
                self.errors += 1;
                warn!(
                    worker_id = %worker_id,
                    message_id = %envelope.id,
                    %error,
                    "envelope handling failed"
                );
                self.send_error_reply(&envelope, &error, ctx).await;
            }
        }

        self.prune_threads();
        self.refresh_status();
    }

    /// One bad message never stops the loop; the sender gets an error
    /// reply instead. Error envelopes themselves are not answered.
    async fn send_error_reply(&self, original: &Envelope, error: &WorkerError, ctx: &WorkerContext) {
        if original.kind == MessageKind::Error || original.sender_id == ctx.worker_id {
            return;
        }
        let mut payload = Payload::new();
        payload.insert("error".to_string(), serde_json::json!(error.to_string()));
        payload.insert(
            "original_message_id".to_string(),
            serde_json::json!(original.id.to_string()),
        );
        let reply = original.reply(ctx.worker_id.clone(), MessageKind::Error, payload);
        if let Err(route_error) = ctx.send(reply).await {
            debug!(
                worker_id = %ctx.worker_id,
                %route_error,
                "error reply could not be delivered"
            );
        }
    }

    async fn answer_heartbeat(
        &self,
        envelope: &Envelope,
        ctx: &WorkerContext,
    ) -> Result<(), WorkerError> {
        let reply = envelope.reply(
            ctx.worker_id.clone(),
            MessageKind::Response,
            self.status_payload(),
        );
        if let Err(error) = ctx.send(reply).await {
            debug!(worker_id = %ctx.worker_id, %error, "heartbeat reply not delivered");
        }
        Ok(())
    }

    async fn emit_heartbeat(&mut self, ctx: &WorkerContext) {
        self.prune_threads();
        self.status_tx.send_modify(|status| {
            status.last_heartbeat = Utc::now();
        });
        self.refresh_status();

        let Some(target) = self.config.heartbeat_target.clone() else {
            return;
        };
        let thread_id = ThreadId::new("heartbeat").expect("static thread id is non-empty");
        let envelope = Envelope::new(
            ctx.worker_id.clone(),
            target,
            MessageKind::Heartbeat,
            thread_id,
            self.status_payload(),
        )
        .with_priority(protocol::Priority::Low);

        if let Err(error) = ctx.send(envelope).await {
            debug!(worker_id = %ctx.worker_id, %error, "heartbeat not delivered");
        }
    }

    fn status_payload(&self) -> Payload {
        let status = self.status_tx.borrow().clone();
        let mut payload = Payload::new();
        payload.insert(
            "agent_id".to_string(),
            serde_json::json!(status.worker_id.as_str()),
        );
        payload.insert("status".to_string(), serde_json::json!(status.state.to_string()));
        payload.insert(
            "queue_size".to_string(),
            serde_json::json!(status.mailbox_depth),
        );
        payload.insert(
            "active_threads".to_string(),
            serde_json::json!(status.active_threads),
        );
        payload.insert("processed".to_string(), serde_json::json!(status.processed));
        payload.insert("errors".to_string(), serde_json::json!(status.errors));
        payload
    }

    fn track_thread(&mut self, envelope: &Envelope) {
        let activity = self
            .threads
            .entry(envelope.thread_id.clone())
            .or_insert_with(|| ThreadActivity {
                started_at: Instant::now(),
                messages: 0,
            });
        activity.messages += 1;
    }

    fn prune_threads(&mut self) {
        let ttl = self.config.thread_ttl;
        self.threads.retain(|thread_id, activity| {
            let keep = activity.started_at.elapsed() <= ttl;
            if !keep {
                debug!(
                    thread_id = %thread_id,
                    messages = activity.messages,
                    "dropping idle thread bookkeeping"
                );
            }
            keep
        });
    }

    fn mailbox_depth(&self) -> usize {
        self.mailbox_tx
            .max_capacity()
            .saturating_sub(self.mailbox_tx.capacity())
    }

    fn refresh_status(&self) {
        let depth = self.mailbox_depth();
        let active_threads = self.threads.len();
        let processed = self.processed;
        let errors = self.errors;
        self.status_tx.send_modify(|status| {
            status.mailbox_depth = depth;
            status.active_threads = active_threads;
            status.processed = processed;
            status.errors = errors;
        });
    }

    fn publish(&self, state: WorkerState) {
        let depth = self.mailbox_depth();
        let active_threads = self.threads.len();
        let processed = self.processed;
        let errors = self.errors;
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.last_heartbeat = Utc::now();
            status.mailbox_depth = depth;
            status.active_threads = active_threads;
            status.processed = processed;
            status.errors = errors;
        });
    }
}
