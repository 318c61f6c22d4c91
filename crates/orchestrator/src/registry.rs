//! Worker registry: discovery, routing and thread audit trail
//!
//! The registry is a single-owner actor. One spawned task owns every map
//! (worker directory, capability index, thread records); the rest of the
//! system talks to it through a cloneable [`RegistryHandle`] whose methods
//! send commands over a channel and await oneshot replies. Worker status
//! is read through each worker's watch channel, whose only writer is that
//! worker's runtime.

use chrono::{DateTime, Utc};
use protocol::{Capability, CapabilityName, Envelope, MessageId, MessageKind, ThreadId, WorkerId, WorkerStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Registry failure taxonomy
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker '{0}' is already registered")]
    AlreadyRegistered(WorkerId),

    #[error("worker '{0}' is not registered")]
    NotFound(WorkerId),

    #[error("no registered worker advertises capability '{0}'")]
    CapabilityNotFound(CapabilityName),

    #[error("worker '{worker_id}' is {state}, not routable")]
    NotRoutable { worker_id: WorkerId, state: String },

    #[error("mailbox of worker '{worker_id}' is full (capacity {capacity})")]
    Busy { worker_id: WorkerId, capacity: usize },

    #[error("registry is shut down")]
    Closed,
}

/// Everything a worker hands over when it registers
///
/// The mailbox sender is the delivery endpoint; the status receiver is the
/// read side of the worker's single-writer status channel.
pub struct WorkerRegistration {
    pub worker_id: WorkerId,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
    pub mailbox: mpsc::Sender<Envelope>,
    pub status: watch::Receiver<WorkerStatus>,
}

/// Registry tuning knobs
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often the background sweep looks for stale thread records
    pub sweep_interval: Duration,
    /// Thread records idle longer than this are evicted
    pub thread_ttl: Duration,
    /// Per-thread audit history ring size
    pub max_history: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            thread_ttl: Duration::from_secs(300),
            max_history: 1000,
        }
    }
}

/// One routed envelope as recorded in a thread's audit history
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub message_id: MessageId,
    pub sender_id: WorkerId,
    pub receiver_id: WorkerId,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the registry's advisory bookkeeping for one thread
#[derive(Debug, Clone, Serialize)]
pub struct ThreadStatus {
    pub thread_id: ThreadId,
    pub started_at: DateTime<Utc>,
    pub message_count: u64,
    pub participants: Vec<WorkerId>,
    /// Seconds since the last routed envelope on this thread
    pub idle_seconds: f64,
    pub history: Vec<AuditEntry>,
}

/// Aggregate registry counters
#[derive(Debug, Clone, Serialize)]
pub struct RegistryMetrics {
    pub total_workers: usize,
    pub total_capabilities: usize,
    pub active_threads: usize,
    pub messages_routed: u64,
    pub messages_failed: u64,
    pub success_rate: f64,
    pub uptime_seconds: f64,
    pub messages_per_second: f64,
}

/// Coarse health report
#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub healthy: bool,
    pub total_workers: usize,
    pub online_workers: usize,
    pub active_threads: usize,
    pub uptime_seconds: f64,
}

enum RegistryCommand {
    Register(
        WorkerRegistration,
        oneshot::Sender<Result<(), RegistryError>>,
    ),
    Unregister(WorkerId, oneshot::Sender<Result<(), RegistryError>>),
    Discover {
        capabilities: Vec<CapabilityName>,
        exclude: Vec<WorkerId>,
        reply: oneshot::Sender<Result<Vec<WorkerId>, RegistryError>>,
    },
    Route(Envelope, oneshot::Sender<Result<(), RegistryError>>),
    Broadcast {
        envelope: Envelope,
        capability_filter: Option<Vec<CapabilityName>>,
        reply: oneshot::Sender<Result<usize, RegistryError>>,
    },
    WorkerStatus(
        WorkerId,
        oneshot::Sender<Option<WorkerStatus>>,
    ),
    AllStatuses(oneshot::Sender<Vec<WorkerStatus>>),
    ThreadStatus(ThreadId, oneshot::Sender<Option<ThreadStatus>>),
    Metrics(oneshot::Sender<RegistryMetrics>),
    Health(oneshot::Sender<RegistryHealth>),
}

/// Cloneable entry point into the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Register a worker and index its capabilities
    pub async fn register(&self, registration: WorkerRegistration) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::Register(registration, reply))
            .await?
    }

    /// Remove a worker and all of its capability index entries
    pub async fn unregister(&self, worker_id: WorkerId) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::Unregister(worker_id, reply))
            .await?
    }

    /// Find online workers advertising every requested capability
    ///
    /// An empty capability list returns all registered worker ids.
    pub async fn discover(
        &self,
        capabilities: Vec<CapabilityName>,
        exclude: Vec<WorkerId>,
    ) -> Result<Vec<WorkerId>, RegistryError> {
        self.request(|reply| RegistryCommand::Discover {
            capabilities,
            exclude,
            reply,
        })
        .await?
    }

    /// Deliver an envelope into the receiver's mailbox
    pub async fn route(&self, envelope: Envelope) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::Route(envelope, reply))
            .await?
    }

    /// Fan a copy of the envelope out to every matching worker
    ///
    /// Returns the number of successful deliveries; per-target failures are
    /// logged and do not abort the remaining fan-out.
    pub async fn broadcast(
        &self,
        envelope: Envelope,
        capability_filter: Option<Vec<CapabilityName>>,
    ) -> Result<usize, RegistryError> {
        self.request(|reply| RegistryCommand::Broadcast {
            envelope,
            capability_filter,
            reply,
        })
        .await?
    }

    pub async fn worker_status(
        &self,
        worker_id: WorkerId,
    ) -> Result<Option<WorkerStatus>, RegistryError> {
        self.request(|reply| RegistryCommand::WorkerStatus(worker_id, reply))
            .await
    }

    pub async fn all_statuses(&self) -> Result<Vec<WorkerStatus>, RegistryError> {
        self.request(RegistryCommand::AllStatuses).await
    }

    pub async fn thread_status(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<ThreadStatus>, RegistryError> {
        self.request(|reply| RegistryCommand::ThreadStatus(thread_id, reply))
            .await
    }

    pub async fn metrics(&self) -> Result<RegistryMetrics, RegistryError> {
        self.request(RegistryCommand::Metrics).await
    }

    pub async fn health(&self) -> Result<RegistryHealth, RegistryError> {
        self.request(RegistryCommand::Health).await
    }
}

/// Registry actor constructor
pub struct Registry;

impl Registry {
    /// Spawn the registry actor and return its handle
    ///
    /// The actor runs until every handle is dropped.
    pub fn spawn(config: RegistryConfig) -> RegistryHandle {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);
        let mut actor = RegistryActor::new(config.clone());

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(config.sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(command) => actor.handle(command),
                        None => break,
                    },
                    _ = sweep.tick() => actor.sweep_threads(),
                }
            }
            debug!("registry actor stopped");
        });

        RegistryHandle { tx }
    }
}

struct RegisteredWorker {
    registration: WorkerRegistration,
    registered_at: DateTime<Utc>,
}

struct ThreadRecord {
    started_at: DateTime<Utc>,
    last_activity: Instant,
    message_count: u64,
    participants: HashSet<WorkerId>,
    history: VecDeque<AuditEntry>,
}

struct RegistryActor {
    config: RegistryConfig,
    workers: HashMap<WorkerId, RegisteredWorker>,
    /// capability name -> worker ids in registration order
    capability_index: HashMap<CapabilityName, Vec<WorkerId>>,
    threads: HashMap<ThreadId, ThreadRecord>,
    messages_routed: u64,
    messages_failed: u64,
    started_at: Instant,
}

impl RegistryActor {
    fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            workers: HashMap::new(),
            capability_index: HashMap::new(),
            threads: HashMap::new(),
            messages_routed: 0,
            messages_failed: 0,
            started_at: Instant::now(),
        }
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register(registration, reply) => {
                let _ = reply.send(self.register(registration));
            }
            RegistryCommand::Unregister(worker_id, reply) => {
                let _ = reply.send(self.unregister(&worker_id));
            }
            RegistryCommand::Discover {
                capabilities,
                exclude,
                reply,
            } => {
                let _ = reply.send(self.discover(&capabilities, &exclude));
            }
            RegistryCommand::Route(envelope, reply) => {
                let _ = reply.send(self.route(envelope));
            }
            RegistryCommand::Broadcast {
                envelope,
                capability_filter,
                reply,
            } => {
                let _ = reply.send(self.broadcast(envelope, capability_filter));
            }
            RegistryCommand::WorkerStatus(worker_id, reply) => {
                let status = self
                    .workers
                    .get(&worker_id)
                    .map(|w| w.registration.status.borrow().clone());
                let _ = reply.send(status);
            }
            RegistryCommand::AllStatuses(reply) => {
                let statuses = self
                    .workers
                    .values()
                    .map(|w| w.registration.status.borrow().clone())
                    .collect();
                let _ = reply.send(statuses);
            }
            RegistryCommand::ThreadStatus(thread_id, reply) => {
                let _ = reply.send(self.thread_status(&thread_id));
            }
            RegistryCommand::Metrics(reply) => {
                let _ = reply.send(self.metrics());
            }
            RegistryCommand::Health(reply) => {
                let _ = reply.send(self.health());
            }
        }
    }

    fn register(&mut self, registration: WorkerRegistration) -> Result<(), RegistryError> {
        let worker_id = registration.worker_id.clone();
        if self.workers.contains_key(&worker_id) {
            return Err(RegistryError::AlreadyRegistered(worker_id));
        }

        for capability in &registration.capabilities {
            self.capability_index
                .entry(capability.name.clone())
                .or_default()
                .push(worker_id.clone());
        }

        info!(
            worker_id = %worker_id,
            display_name = %registration.display_name,
            capabilities = registration.capabilities.len(),
            "worker registered"
        );
        self.workers.insert(
            worker_id,
            RegisteredWorker {
                registration,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn unregister(&mut self, worker_id: &WorkerId) -> Result<(), RegistryError> {
        let worker = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| RegistryError::NotFound(worker_id.clone()))?;

        for capability in &worker.registration.capabilities {
            if let Some(ids) = self.capability_index.get_mut(&capability.name) {
                ids.retain(|id| id != worker_id);
                if ids.is_empty() {
                    self.capability_index.remove(&capability.name);
                }
            }
        }

        let registered_for = Utc::now() - worker.registered_at;
        info!(
            worker_id = %worker_id,
            registered_for_secs = registered_for.num_seconds(),
            "worker unregistered"
        );
        Ok(())
    }

    fn discover(
        &self,
        capabilities: &[CapabilityName],
        exclude: &[WorkerId],
    ) -> Result<Vec<WorkerId>, RegistryError> {
        if capabilities.is_empty() {
            return Ok(self.workers.keys().cloned().collect());
        }

        // Intersect in registration order of the first capability's list so
        // "first candidate" selection stays deterministic.
        let mut candidate_sets = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            let ids = self
                .capability_index
                .get(capability)
                .ok_or_else(|| RegistryError::CapabilityNotFound(capability.clone()))?;
            candidate_sets.push(ids);
        }

        let first = candidate_sets[0];
        let rest: Vec<HashSet<&WorkerId>> = candidate_sets[1..]
            .iter()
            .map(|ids| ids.iter().collect())
            .collect();

        let result = first
            .iter()
            .filter(|id| rest.iter().all(|set| set.contains(*id)))
            .filter(|id| !exclude.contains(*id))
            .filter(|id| {
                self.workers
                    .get(*id)
                    .map(|w| w.registration.status.borrow().state.is_routable())
                    .unwrap_or(false)
            })
            .cloned()
            .collect::<Vec<_>>();

        debug!(
            capabilities = ?capabilities.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            matched = result.len(),
            "capability discovery"
        );
        Ok(result)
    }

    fn route(&mut self, envelope: Envelope) -> Result<(), RegistryError> {
        let receiver_id = envelope.receiver_id.clone();
        let (mailbox, state) = match self.workers.get(&receiver_id) {
            Some(worker) => (
                worker.registration.mailbox.clone(),
                worker.registration.status.borrow().state,
            ),
            None => {
                self.messages_failed += 1;
                return Err(RegistryError::NotFound(receiver_id));
            }
        };

        if !state.is_routable() {
            self.messages_failed += 1;
            return Err(RegistryError::NotRoutable {
                worker_id: receiver_id,
                state: state.to_string(),
            });
        }

        let entry = AuditEntry {
            message_id: envelope.id,
            sender_id: envelope.sender_id.clone(),
            receiver_id: receiver_id.clone(),
            kind: envelope.kind,
            timestamp: envelope.timestamp,
        };
        let thread_id = envelope.thread_id.clone();

        match mailbox.try_send(envelope) {
            Ok(()) => {
                self.track_thread(thread_id, entry);
                self.messages_routed += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.messages_failed += 1;
                Err(RegistryError::Busy {
                    worker_id: receiver_id,
                    capacity: mailbox.max_capacity(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.messages_failed += 1;
                Err(RegistryError::NotRoutable {
                    worker_id: receiver_id,
                    state: "closed".to_string(),
                })
            }
        }
    }

    fn broadcast(
        &mut self,
        envelope: Envelope,
        capability_filter: Option<Vec<CapabilityName>>,
    ) -> Result<usize, RegistryError> {
        let targets = match capability_filter {
            Some(capabilities) => self.discover(&capabilities, &[])?,
            None => self.workers.keys().cloned().collect(),
        };

        let mut delivered = 0usize;
        for target in targets {
            let copy = envelope.readdressed(target.clone());
            match self.route(copy) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(worker_id = %target, %error, "broadcast delivery failed");
                }
            }
        }
        debug!(delivered, "broadcast fan-out complete");
        Ok(delivered)
    }

    fn track_thread(&mut self, thread_id: ThreadId, entry: AuditEntry) {
        let record = self
            .threads
            .entry(thread_id)
            .or_insert_with(|| ThreadRecord {
                started_at: Utc::now(),
                last_activity: Instant::now(),
                message_count: 0,
                participants: HashSet::new(),
                history: VecDeque::new(),
            });

        record.message_count += 1;
        record.last_activity = Instant::now();
        record.participants.insert(entry.sender_id.clone());
        record.participants.insert(entry.receiver_id.clone());
        record.history.push_back(entry);
        while record.history.len() > self.config.max_history {
            record.history.pop_front();
        }
    }

    fn thread_status(&self, thread_id: &ThreadId) -> Option<ThreadStatus> {
        self.threads.get(thread_id).map(|record| ThreadStatus {
            thread_id: thread_id.clone(),
            started_at: record.started_at,
            message_count: record.message_count,
            participants: record.participants.iter().cloned().collect(),
            idle_seconds: record.last_activity.elapsed().as_secs_f64(),
            history: record.history.iter().cloned().collect(),
        })
    }

    /// Evict thread records with no routed traffic inside the TTL.
    /// Advisory bookkeeping only; authoritative workflow state lives in the
    /// orchestration engine.
    fn sweep_threads(&mut self) {
        let ttl = self.config.thread_ttl;
        let before = self.threads.len();
        self.threads
            .retain(|_, record| record.last_activity.elapsed() <= ttl);
        let evicted = before - self.threads.len();
        if evicted > 0 {
            info!(evicted, "swept inactive thread records");
        }
    }

    fn metrics(&self) -> RegistryMetrics {
        let uptime = self.started_at.elapsed().as_secs_f64();
        let attempted = self.messages_routed + self.messages_failed;
        RegistryMetrics {
            total_workers: self.workers.len(),
            total_capabilities: self.capability_index.len(),
            active_threads: self.threads.len(),
            messages_routed: self.messages_routed,
            messages_failed: self.messages_failed,
            success_rate: if attempted > 0 {
                self.messages_routed as f64 / attempted as f64
            } else {
                1.0
            },
            uptime_seconds: uptime,
            messages_per_second: if uptime > 0.0 {
                self.messages_routed as f64 / uptime
            } else {
                0.0
            },
        }
    }

    fn health(&self) -> RegistryHealth {
        let online = self
            .workers
            .values()
            .filter(|w| w.registration.status.borrow().state.is_routable())
            .count();
        RegistryHealth {
            healthy: online > 0,
            total_workers: self.workers.len(),
            online_workers: online,
            active_threads: self.threads.len(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}
