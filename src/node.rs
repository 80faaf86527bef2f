use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AgentContext;
use crate::error::{Result, SchedulerError};
use crate::naming::ContainerName;
use crate::protocol::{
    BuildChannelMessage, ClaimRequest, ClaimResponse, HealthReport, NodeChannelMessage,
    NodeCommand, BUILD_CHANNEL, NODE_CHANNEL,
};
use crate::runtime::{RuntimeEvent, StartedContainer};
use crate::scheduler::{
    Admission, ClaimEngine, ContainerPhase, FinishedContainers, LocalQueue, NodeLoad, QueueEntry,
    Registry, RegistryEntry, RunStatus, CANCELLED_REASON,
};
use crate::store::CoordinationStoreExt;
use crate::worker::lifecycle::{self, LifecycleEvent};
use crate::worker::session::{self, SessionReport, SessionRequest};

const EVENT_BUFFER: usize = 1024;

/// Reason recorded when a container terminated without a build stream.
pub const CONTAINER_EXITED_REASON: &str = "container exited";
/// Reason recorded for runs still in flight when the node shuts down.
pub const SHUTDOWN_REASON: &str = "node shutdown";

/// Everything the agent reacts to. Inputs from the outside world and the
/// results of the agent's own spawned I/O arrive on the same channel.
#[derive(Debug)]
pub enum AgentEvent {
    Build(BuildChannelMessage),
    Control(NodeChannelMessage),
    Runtime(RuntimeEvent),
    /// A claim request round trip finished
    ClaimSettled {
        job_id: String,
        result: Result<Option<ClaimResponse>>,
    },
    /// Container creation for a dispatched job finished
    ContainerCreated {
        job_id: String,
        result: Result<StartedContainer>,
    },
    /// A build session ended, before or after its stream opened
    SessionEnded {
        job_id: String,
        report: SessionReport,
    },
}

/// Turn a raw pub/sub delivery into an agent event. Malformed payloads and
/// unknown channels are logged and dropped.
pub fn decode_channel_message(channel: &str, payload: &str) -> Option<AgentEvent> {
    let decoded = match channel {
        BUILD_CHANNEL => BuildChannelMessage::parse(payload).map(AgentEvent::Build),
        NODE_CHANNEL => NodeChannelMessage::parse(payload).map(AgentEvent::Control),
        _ => return None,
    };
    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(channel, error = %e, "Dropping malformed channel message");
            None
        }
    }
}

/// Observable state of the agent, published after every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub queued: Vec<QueueEntry>,
    pub running: Vec<RegistryEntry>,
}

pub fn health_report(ctx: &AgentContext, snapshot: &AgentSnapshot, started_at: Instant) -> HealthReport {
    HealthReport {
        status: "ok".to_string(),
        uptime: started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        arch: ctx.config.arch.clone(),
        os: std::env::consts::OS.to_string(),
        node_id: ctx.node_id.clone(),
        running: snapshot.running.len(),
        queued: snapshot.queued.len(),
    }
}

struct SessionHandle {
    /// Interrupts the startup sequence when the container goes away
    abort: CancellationToken,
    /// Cancel reason carried over once the registry entry is gone
    cancel_reason: Option<String>,
}

/// Per-node scheduling agent.
///
/// Owns the local queue, the running-container registry and the claim book,
/// and is their only writer: every event is processed to completion before
/// the next one, and all I/O happens on spawned tasks that report back
/// through [`AgentEvent`]s.
pub struct Agent {
    ctx: AgentContext,
    queue: LocalQueue,
    registry: Registry,
    claims: ClaimEngine,
    finished: FinishedContainers,
    sessions: HashMap<String, SessionHandle>,
    events_tx: mpsc::Sender<AgentEvent>,
    events_rx: mpsc::Receiver<AgentEvent>,
    snapshot_tx: watch::Sender<AgentSnapshot>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl Agent {
    pub fn new(ctx: AgentContext, shutdown: CancellationToken) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (snapshot_tx, _) = watch::channel(AgentSnapshot::default());
        let claims = ClaimEngine::new(ctx.node_id.clone(), &ctx.config);
        Self {
            ctx,
            queue: LocalQueue::new(),
            registry: Registry::new(),
            claims,
            finished: FinishedContainers::default(),
            sessions: HashMap::new(),
            events_tx,
            events_rx,
            snapshot_tx,
            shutdown,
            started_at: Instant::now(),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<AgentEvent> {
        self.events_tx.clone()
    }

    pub fn snapshot(&self) -> watch::Receiver<AgentSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Reload the queue this node persisted before a restart.
    pub async fn restore(&mut self) -> Result<usize> {
        let entries = self.ctx.store.load_queue(&self.ctx.node_id).await?;
        self.queue = LocalQueue::from_entries(entries);
        if !self.queue.is_empty() {
            info!(queued = self.queue.len(), "Restored queued builds");
        }
        self.publish_snapshot();
        Ok(self.queue.len())
    }

    /// Process events until shutdown, then finalize whatever is still
    /// running.
    pub async fn run(mut self) {
        self.spawn_persister();
        self.dispatch();
        self.publish_snapshot();

        info!(node_id = %self.ctx.node_id, max_builds = self.ctx.config.max_builds, "Agent started");
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.events_rx.recv() => {
                    self.handle(event);
                    self.publish_snapshot();
                }
            }
        }

        self.drain().await;
    }

    fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Build(msg) => self.on_build_message(msg),
            AgentEvent::Control(msg) => self.on_control_message(msg),
            AgentEvent::Runtime(event) => {
                if let Some(event) = lifecycle::classify(&event, &self.ctx.node_id) {
                    self.on_lifecycle_event(event);
                }
            }
            AgentEvent::ClaimSettled { job_id, result } => self.on_claim_settled(job_id, result),
            AgentEvent::ContainerCreated { job_id, result } => {
                self.on_container_created(job_id, result)
            }
            AgentEvent::SessionEnded { job_id, report } => self.on_session_ended(job_id, report),
        }
    }

    fn on_build_message(&mut self, msg: BuildChannelMessage) {
        let load = NodeLoad {
            queue: &self.queue,
            registry: &self.registry,
            max_builds: self.ctx.config.max_builds,
        };
        match self.claims.on_message(&msg, load) {
            Admission::Ignore(reason) => debug!(sender = %msg.sender, reason, "Ignoring build message"),
            Admission::Apply { job_id, builder_id } => self.apply(job_id, builder_id),
            Admission::Cancel { job_id } => self.cancel(&job_id),
            Admission::Enqueue { job_id, builder_id } => self.enqueue(job_id, builder_id),
        }
    }

    fn apply(&self, job_id: String, builder_id: i64) {
        info!(job_id = %job_id, builder_id, "Claiming job");
        let controller = self.ctx.controller.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let request = ClaimRequest {
                builder_id,
                job_id: job_id.clone(),
            };
            let result = controller.apply(&request).await;
            let _ = tx.send(AgentEvent::ClaimSettled { job_id, result }).await;
        });
    }

    fn on_claim_settled(&mut self, job_id: String, result: Result<Option<ClaimResponse>>) {
        match result {
            Ok(Some(response)) => {
                if let Admission::Enqueue { job_id, builder_id } =
                    self.claims.on_claim_response(&response)
                {
                    self.enqueue(job_id, builder_id);
                }
            }
            Ok(None) => debug!(job_id = %job_id, "Claim sent, awaiting response"),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Claim request failed");
                self.claims.forget(&job_id);
            }
        }
    }

    fn enqueue(&mut self, job_id: String, builder_id: i64) {
        if self.registry.contains(&job_id) {
            debug!(job_id = %job_id, "Approved job already running");
            return;
        }
        if self.queue.push(QueueEntry::new(job_id.clone(), builder_id)) {
            info!(job_id = %job_id, builder_id, queued = self.queue.len(), "Claim approved, job queued");
        }
        self.dispatch();
    }

    fn cancel(&mut self, job_id: &str) {
        if self.queue.remove(job_id).is_some() {
            info!(job_id = %job_id, "Cancelled queued job");
            return;
        }

        if let Some(entry) = self.registry.get_mut(job_id) {
            entry.cancel_reason = Some(CANCELLED_REASON.to_string());
            // Until the runtime knows the container, stopping it would be a
            // no-op; the stop is issued once creation reports back.
            let known = entry.container_id.is_some() || entry.phase == ContainerPhase::Started;
            info!(job_id = %job_id, known, "Cancelling running job");
            if known {
                self.request_stop(job_id);
            }
            return;
        }

        if let Some(handle) = self.sessions.get_mut(job_id) {
            handle.cancel_reason = Some(CANCELLED_REASON.to_string());
            return;
        }
        debug!(job_id = %job_id, "Cancel for a job this node does not hold");
    }

    /// Start containers for queued jobs while capacity allows.
    fn dispatch(&mut self) {
        while self.registry.len() < self.ctx.config.max_builds {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            let name = match ContainerName::new(next.build_config_id, &next.job_id, &self.ctx.node_id) {
                Ok(name) => name,
                Err(e) => {
                    error!(job_id = %next.job_id, error = %e, "Cannot name container, dropping job");
                    continue;
                }
            };

            self.registry.insert(RegistryEntry::new(&name));
            info!(job_id = %next.job_id, container = %name, running = self.registry.len(), "Dispatching job");

            let spec = lifecycle::container_spec(&self.ctx.config, &name);
            let ctx = self.ctx.clone();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let job_id = next.job_id;
                // Without a record nothing downstream could report the run,
                // so the container is never started.
                let result = match ctx.run_state.create(&job_id, next.build_config_id).await {
                    Ok(_) => ctx.runtime.start(&spec).await,
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Failed to write run record");
                        ctx.run_state
                            .report_unrecorded_failure(&job_id, RunStatus::Queued)
                            .await;
                        Err(e)
                    }
                };
                let _ = tx.send(AgentEvent::ContainerCreated { job_id, result }).await;
            });
        }
    }

    fn on_container_created(&mut self, job_id: String, result: Result<StartedContainer>) {
        match result {
            Ok(started) => {
                let Some(entry) = self.registry.get_mut(&job_id) else {
                    debug!(job_id = %job_id, "Container created for a job no longer registered");
                    return;
                };
                debug!(job_id = %job_id, container_id = %started.id, "Container created");
                entry.container_id.get_or_insert(started.id);
                if entry.cancel_reason.is_some() {
                    self.request_stop(&job_id);
                }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Container creation failed");
                if self.registry.remove(&job_id).is_some() {
                    self.spawn_finalize(job_id, RunStatus::Failed, Some(e.to_string()), None);
                }
                self.dispatch();
            }
        }
    }

    fn on_lifecycle_event(&mut self, event: LifecycleEvent) {
        let job_id = event.name.job_id().to_string();
        if event.action.is_terminal() {
            self.on_container_exited(&job_id, event);
        } else {
            self.on_container_started(&job_id, event);
        }
    }

    fn on_container_started(&mut self, job_id: &str, event: LifecycleEvent) {
        let Some(entry) = self.registry.get_mut(job_id) else {
            warn!(container = %event.name, "Start event for an unknown container, stopping it");
            let runtime = self.ctx.runtime.clone();
            let name = event.name.to_string();
            tokio::spawn(async move {
                if let Err(e) = runtime.stop(&name).await {
                    warn!(container = %name, error = %e, "Failed to stop stale container");
                }
            });
            return;
        };

        entry.phase = ContainerPhase::Started;
        entry.container_id = Some(event.container_id);
        if entry.cancel_reason.is_some() {
            self.request_stop(job_id);
            return;
        }
        if entry.stop_requested {
            return;
        }
        if entry.session_active {
            let e = SchedulerError::StreamAlreadyOpen(job_id.to_string());
            warn!(job_id = %job_id, error = %e, "Ignoring duplicate start event");
            return;
        }

        entry.session_active = true;
        let request = SessionRequest {
            job_id: job_id.to_string(),
            builder_id: entry.builder_id,
            container_name: entry.container_name.clone(),
        };
        let abort = CancellationToken::new();
        self.sessions.insert(
            job_id.to_string(),
            SessionHandle {
                abort: abort.clone(),
                cancel_reason: None,
            },
        );

        info!(job_id = %job_id, container = %event.name, "Container started, opening build session");
        let ctx = self.ctx.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let job_id = request.job_id.clone();
            let report = session::run(ctx, request, abort).await;
            let _ = tx.send(AgentEvent::SessionEnded { job_id, report }).await;
        });
    }

    fn on_container_exited(&mut self, job_id: &str, event: LifecycleEvent) {
        let name = event.name.to_string();
        let Some(entry) = self.registry.remove(job_id) else {
            if self.finished.contains(&name) {
                debug!(container = %name, action = ?event.action, "Container already handled");
                return;
            }
            warn!(job_id = %job_id, container = %name, "Orphaned container terminated");
            self.finished.insert(name);
            let run_state = self.ctx.run_state.clone();
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = run_state.report_orphan(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to report orphaned run");
                }
            });
            return;
        };

        self.finished.insert(name);
        info!(
            job_id = %job_id,
            action = ?event.action,
            running = self.registry.len(),
            "Container terminated"
        );

        if entry.session_active {
            // The session's end finalizes the run.
            if let Some(handle) = self.sessions.get_mut(job_id) {
                handle.abort.cancel();
                if handle.cancel_reason.is_none() {
                    handle.cancel_reason = entry.cancel_reason;
                }
            }
        } else if !entry.run_settled {
            let reason = entry
                .cancel_reason
                .unwrap_or_else(|| CONTAINER_EXITED_REASON.to_string());
            self.spawn_finalize(job_id.to_string(), RunStatus::Failed, Some(reason), None);
        }

        self.dispatch();
    }

    fn on_session_ended(&mut self, job_id: String, report: SessionReport) {
        let handle = self.sessions.remove(&job_id);

        let (mut status, mut reason) = match report {
            SessionReport::Closed(outcome) => {
                let reason = outcome
                    .close_code
                    .filter(|_| outcome.status == RunStatus::Failed)
                    .map(|code| format!("build stream closed with code {code}"));
                (outcome.status, reason)
            }
            SessionReport::StartupFailed(e) => {
                warn!(job_id = %job_id, error = %e, "Build startup failed");
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        let mut stop = None;
        let cancel_reason = match self.registry.get_mut(&job_id) {
            Some(entry) => {
                entry.session_active = false;
                entry.run_settled = true;
                if !entry.stop_requested {
                    entry.stop_requested = true;
                    stop = Some(entry.container_name.clone());
                }
                entry.cancel_reason.clone()
            }
            None => None,
        }
        .or(handle.and_then(|h| h.cancel_reason));

        if let Some(cancel_reason) = cancel_reason {
            status = RunStatus::Failed;
            reason = Some(cancel_reason);
        }
        self.spawn_finalize(job_id, status, reason, stop);
    }

    fn on_control_message(&mut self, msg: NodeChannelMessage) {
        if !msg.is_addressed_to(&self.ctx.node_id) {
            return;
        }
        match msg.command {
            NodeCommand::HealthCheck => {
                let report = health_report(&self.ctx, &self.current_snapshot(), self.started_at);
                let response = NodeChannelMessage {
                    sender: self.ctx.node_id.clone(),
                    target: Some(msg.sender),
                    command: NodeCommand::HealthResponse(report),
                };
                let store = self.ctx.store.clone();
                tokio::spawn(async move {
                    let sent = match response.to_payload() {
                        Ok(payload) => store.publish(NODE_CHANNEL, payload).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!(error = %e, "Failed to answer health check");
                    }
                });
            }
            NodeCommand::Deregister => {
                info!(sender = %msg.sender, "Deregistered by controller, shutting down");
                self.shutdown.cancel();
            }
            NodeCommand::HealthResponse(_) => {}
        }
    }

    /// Issue at most one stop for a registered container.
    fn request_stop(&mut self, job_id: &str) {
        let Some(entry) = self.registry.get_mut(job_id) else {
            return;
        };
        if entry.stop_requested {
            return;
        }
        entry.stop_requested = true;

        let runtime = self.ctx.runtime.clone();
        let name = entry.container_name.clone();
        info!(job_id = %job_id, container = %name, "Stopping container");
        tokio::spawn(async move {
            if let Err(e) = runtime.stop(&name).await {
                warn!(container = %name, error = %e, "Failed to stop container");
            }
        });
    }

    /// Finalize a run off the loop, then optionally stop its container. The
    /// stop is only issued once the record is terminal, so the container's
    /// termination can never race the session's verdict.
    fn spawn_finalize(
        &self,
        job_id: String,
        status: RunStatus,
        reason: Option<String>,
        stop: Option<String>,
    ) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.run_state.finalize(&job_id, status, reason).await {
                warn!(job_id = %job_id, error = %e, "Failed to finalize run");
            }
            if let Some(name) = stop {
                if let Err(e) = ctx.runtime.stop(&name).await {
                    warn!(container = %name, error = %e, "Failed to stop container");
                }
            }
        });
    }

    fn current_snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            queued: self.queue.entries(),
            running: self.registry.entries().to_vec(),
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.current_snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    /// Mirror the queue and the registry to the store, latest state wins.
    fn spawn_persister(&self) {
        let mut snapshots = self.snapshot_tx.subscribe();
        let store = self.ctx.store.clone();
        let node_id = self.ctx.node_id.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = snapshots.borrow_and_update().clone();
                if let Err(e) = store.save_queue(&node_id, &snapshot.queued).await {
                    warn!(error = %e, "Failed to persist queue");
                }
                if let Err(e) = store.save_current_builds(&node_id, &snapshot.running).await {
                    warn!(error = %e, "Failed to persist current builds");
                }
                if snapshots.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    async fn drain(&mut self) {
        info!(running = self.registry.len(), queued = self.queue.len(), "Agent shutting down");
        for handle in self.sessions.values() {
            handle.abort.cancel();
        }
        for entry in self.registry.entries() {
            if !entry.run_settled {
                if let Err(e) = self
                    .ctx
                    .run_state
                    .finalize(&entry.job_id, RunStatus::Failed, Some(SHUTDOWN_REASON.to_string()))
                    .await
                {
                    warn!(job_id = %entry.job_id, error = %e, "Failed to finalize run on shutdown");
                }
            }
            if let Err(e) = self.ctx.runtime.stop(&entry.container_name).await {
                warn!(container = %entry.container_name, error = %e, "Failed to stop container on shutdown");
            }
        }
        if let Err(e) = self
            .ctx
            .store
            .save_queue(&self.ctx.node_id, &self.queue.entries())
            .await
        {
            warn!(error = %e, "Failed to persist queue on shutdown");
        }
    }
}
