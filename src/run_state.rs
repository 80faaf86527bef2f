//! Run records and their fan-out.
//!
//! Every change to a `run:<job_id>` record goes through [`RunState`], which
//! writes the record back, publishes it on `build_updates`, hands it to
//! in-process subscribers of that job and, for status changes, informs the
//! controller. Read-modify-write cycles are serialized here so log frames and
//! status transitions of concurrent tasks never clobber each other. The
//! controller is informed after the write lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::controller::ControllerClient;
use crate::error::Result;
use crate::protocol::{BuildUpdateMessage, StateNotification, UpdateKind, BUILD_UPDATES_CHANNEL};
use crate::scheduler::job::{RunRecord, RunStatus};
use crate::store::{CoordinationStore, CoordinationStoreExt};

const SUBSCRIBER_BUFFER: usize = 256;

/// Reason recorded when a container vanished without a session to report it.
pub const ORPHANED_REASON: &str = "orphaned container";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildUpdate {
    /// One inbound frame from the builder, appended verbatim
    Log(String),
    Status {
        status: RunStatus,
        reason: Option<String>,
    },
}

impl BuildUpdate {
    pub fn status(status: RunStatus) -> Self {
        BuildUpdate::Status {
            status,
            reason: None,
        }
    }

    fn kind(&self) -> UpdateKind {
        match self {
            BuildUpdate::Log(_) => UpdateKind::Log,
            BuildUpdate::Status { .. } => UpdateKind::Status,
        }
    }
}

/// A record write together with the status transition it made, if any.
struct Applied {
    record: RunRecord,
    transition: Option<(RunStatus, RunStatus)>,
}

pub struct RunState {
    node_id: String,
    store: Arc<dyn CoordinationStore>,
    controller: Arc<dyn ControllerClient>,
    write_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<HashMap<String, broadcast::Sender<BuildUpdateMessage>>>,
}

impl RunState {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        controller: Arc<dyn ControllerClient>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            controller,
            write_lock: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Write the initial `queued` record for a job about to be dispatched.
    pub async fn create(&self, job_id: &str, builder_id: i64) -> Result<RunRecord> {
        let _guard = self.write_lock.lock().await;
        let record = RunRecord::new(job_id, builder_id, &self.node_id);
        self.store.put_run(&record).await?;
        self.fan_out(UpdateKind::Status, &record).await;
        debug!(job_id = %job_id, builder_id, "Run record created");
        Ok(record)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<RunRecord>> {
        self.store.get_run(job_id).await
    }

    /// Apply one update to a job's record and publish the result.
    ///
    /// Returns the updated record, or `None` when no record exists or a status
    /// change was refused because the record is already terminal.
    pub async fn publish_build_update(
        &self,
        job_id: &str,
        update: BuildUpdate,
    ) -> Result<Option<RunRecord>> {
        let applied = {
            let _guard = self.write_lock.lock().await;
            self.apply(job_id, update).await?
        };
        match applied {
            Some(applied) => Ok(Some(self.announce(job_id, applied).await)),
            None => Ok(None),
        }
    }

    /// Move a run into a terminal status. A no-op when the run is already
    /// terminal; returns whether a transition happened.
    pub async fn finalize(
        &self,
        job_id: &str,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        Ok(self
            .publish_build_update(job_id, BuildUpdate::Status { status, reason })
            .await?
            .is_some())
    }

    /// Report a job whose container terminated without anyone on this node
    /// tracking it. The controller always learns the run failed.
    pub async fn report_orphan(&self, job_id: &str) -> Result<()> {
        let applied = {
            let _guard = self.write_lock.lock().await;
            match self.store.get_run(job_id).await? {
                Some(record) if record.status.is_terminal() => {
                    debug!(job_id = %job_id, status = %record.status, "Orphan already finalized");
                    return Ok(());
                }
                Some(_) => {
                    self.apply(
                        job_id,
                        BuildUpdate::Status {
                            status: RunStatus::Failed,
                            reason: Some(ORPHANED_REASON.to_string()),
                        },
                    )
                    .await?
                }
                None => None,
            }
        };

        match applied {
            Some(applied) => {
                self.announce(job_id, applied).await;
            }
            None => self.report_unrecorded_failure(job_id, RunStatus::Running).await,
        }
        Ok(())
    }

    /// Tell the controller a job failed when there is no record to carry the
    /// transition, e.g. because the initial write itself failed.
    pub async fn report_unrecorded_failure(&self, job_id: &str, last_known: RunStatus) {
        warn!(job_id = %job_id, old = %last_known, "Reporting failure of a run without a record");
        self.notify(job_id, last_known, RunStatus::Failed).await;
    }

    /// Live updates for one job. The stream ends once the run is finalized.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<BuildUpdateMessage> {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    /// Drop the job's channel if nobody listens to it any more.
    pub fn unsubscribe(&self, job_id: &str) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if subscribers
            .get(job_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            subscribers.remove(job_id);
        }
    }

    /// Caller holds the write lock.
    async fn apply(&self, job_id: &str, update: BuildUpdate) -> Result<Option<Applied>> {
        let Some(mut record) = self.store.get_run(job_id).await? else {
            warn!(job_id = %job_id, "No run record, dropping update");
            return Ok(None);
        };

        let kind = update.kind();
        let mut transition = None;
        match update {
            BuildUpdate::Log(line) => record.append_log(&line),
            BuildUpdate::Status { status, reason } => {
                if record.status.is_terminal() {
                    debug!(
                        job_id = %job_id,
                        current = %record.status,
                        requested = %status,
                        "Run already terminal, ignoring status"
                    );
                    return Ok(None);
                }
                let old = record.transition(status, reason);
                transition = Some((old, status));
            }
        }

        self.store.put_run(&record).await?;
        self.fan_out(kind, &record).await;
        Ok(Some(Applied { record, transition }))
    }

    /// Inform the controller of the transition an update made. Runs outside
    /// the write lock; a slow controller only delays its own job.
    async fn announce(&self, job_id: &str, applied: Applied) -> RunRecord {
        if let Some((old, new)) = applied.transition {
            info!(job_id = %job_id, old = %old, new = %new, "Run status changed");
            self.notify(job_id, old, new).await;
        }
        applied.record
    }

    async fn fan_out(&self, kind: UpdateKind, record: &RunRecord) {
        let message = BuildUpdateMessage {
            kind,
            build_id: record.id.clone(),
            data: record.clone(),
        };

        match serde_json::to_string(&message) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(BUILD_UPDATES_CHANNEL, payload).await {
                    warn!(job_id = %record.id, error = %e, "Failed to publish build update");
                }
            }
            Err(e) => warn!(job_id = %record.id, error = %e, "Failed to encode build update"),
        }

        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = subscribers.get(&record.id) {
            let _ = tx.send(message);
        }
        if record.status.is_terminal() {
            // Dropping the sender ends every open subscription for the job.
            subscribers.remove(&record.id);
        }
    }

    async fn notify(&self, job_id: &str, old_state: RunStatus, new_state: RunStatus) {
        let notification = StateNotification {
            job_id: job_id.to_string(),
            old_state,
            new_state,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.controller.inform(&notification).await {
            warn!(job_id = %job_id, error = %e, "Failed to inform controller of state change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::controller::{MockControllerClient, RegistrationRequest, RegistrationResponse};
    use crate::error::SchedulerError;
    use crate::protocol::{ClaimRequest, ClaimResponse};
    use crate::store::MemoryStore;

    /// Controller that takes `delay` to acknowledge every notification.
    struct SlowController {
        informing: Arc<Notify>,
        delay: Duration,
    }

    #[async_trait]
    impl ControllerClient for SlowController {
        async fn register(&self, _request: &RegistrationRequest) -> Result<RegistrationResponse> {
            Err(SchedulerError::Controller("not registered in tests".to_string()))
        }

        async fn apply(&self, _request: &ClaimRequest) -> Result<Option<ClaimResponse>> {
            Ok(None)
        }

        async fn inform(&self, _notification: &StateNotification) -> Result<()> {
            self.informing.notify_one();
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn run_state(controller: MockControllerClient) -> (Arc<MemoryStore>, RunState) {
        let store = Arc::new(MemoryStore::new());
        let state = RunState::new("node-1", store.clone(), Arc::new(controller));
        (store, state)
    }

    fn quiet_controller() -> MockControllerClient {
        let mut controller = MockControllerClient::new();
        controller.expect_inform().returning(|_| Ok(()));
        controller
    }

    #[tokio::test]
    async fn create_writes_queued_record() {
        let (store, state) = run_state(MockControllerClient::new());
        let record = state.create("j1", 3).await.unwrap();
        assert_eq!(record.status, RunStatus::Queued);
        assert_eq!(record.node_id, "node-1");

        let stored = store.get_run("j1").await.unwrap().unwrap();
        assert_eq!(stored.builder_id, 3);
        assert_eq!(store.published(BUILD_UPDATES_CHANNEL).len(), 1);
    }

    #[tokio::test]
    async fn update_without_record_is_dropped() {
        let (store, state) = run_state(MockControllerClient::new());
        let result = state
            .publish_build_update("missing", BuildUpdate::Log("x".to_string()))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(store.get_run("missing").await.unwrap().is_none());
        assert!(store.published(BUILD_UPDATES_CHANNEL).is_empty());
    }

    #[tokio::test]
    async fn log_update_appends_and_publishes() {
        let (store, state) = run_state(MockControllerClient::new());
        state.create("j1", 1).await.unwrap();
        state
            .publish_build_update("j1", BuildUpdate::Log("compiling".to_string()))
            .await
            .unwrap();

        let stored = store.get_run("j1").await.unwrap().unwrap();
        assert_eq!(stored.log, "compiling\n");

        let published = store.published(BUILD_UPDATES_CHANNEL);
        let last: serde_json::Value = serde_json::from_str(published.last().unwrap()).unwrap();
        assert_eq!(last["type"], "log");
        assert_eq!(last["build_id"], "j1");
    }

    #[tokio::test]
    async fn status_update_informs_controller() {
        let mut controller = MockControllerClient::new();
        controller
            .expect_inform()
            .withf(|n| {
                n.job_id == "j1"
                    && n.old_state == RunStatus::Queued
                    && n.new_state == RunStatus::Starting
            })
            .times(1)
            .returning(|_| Ok(()));
        let (_store, state) = run_state(controller);
        state.create("j1", 1).await.unwrap();

        let record = state
            .publish_build_update("j1", BuildUpdate::status(RunStatus::Starting))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RunStatus::Starting);
    }

    #[tokio::test]
    async fn controller_failure_is_swallowed() {
        let mut controller = MockControllerClient::new();
        controller
            .expect_inform()
            .returning(|_| Err(SchedulerError::Controller("unreachable".to_string())));
        let (store, state) = run_state(controller);
        state.create("j1", 1).await.unwrap();

        assert!(state
            .finalize("j1", RunStatus::Failed, None)
            .await
            .unwrap());
        let stored = store.get_run("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let mut controller = MockControllerClient::new();
        controller.expect_inform().times(1).returning(|_| Ok(()));
        let (store, state) = run_state(controller);
        state.create("j1", 1).await.unwrap();

        assert!(state
            .finalize("j1", RunStatus::Success, None)
            .await
            .unwrap());
        assert!(!state
            .finalize("j1", RunStatus::Failed, Some("late".to_string()))
            .await
            .unwrap());

        let stored = store.get_run("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert!(stored.reason.is_none());
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn orphan_with_live_record_is_failed() {
        let mut controller = MockControllerClient::new();
        controller
            .expect_inform()
            .withf(|n| n.old_state == RunStatus::Running && n.new_state == RunStatus::Failed)
            .times(1)
            .returning(|_| Ok(()));
        let (store, state) = run_state(controller);
        let mut record = RunRecord::new("j1", 1, "node-1");
        record.status = RunStatus::Running;
        store.put_run(&record).await.unwrap();

        state.report_orphan("j1").await.unwrap();
        let stored = store.get_run("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.reason.as_deref(), Some(ORPHANED_REASON));
    }

    #[tokio::test]
    async fn orphan_without_record_notifies_directly() {
        let mut controller = MockControllerClient::new();
        controller
            .expect_inform()
            .withf(|n| {
                n.job_id == "ghost"
                    && n.old_state == RunStatus::Running
                    && n.new_state == RunStatus::Failed
            })
            .times(1)
            .returning(|_| Ok(()));
        let (store, state) = run_state(controller);

        state.report_orphan("ghost").await.unwrap();
        assert!(store.get_run("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_with_terminal_record_is_skipped() {
        let (store, state) = run_state(MockControllerClient::new());
        let mut record = RunRecord::new("j1", 1, "node-1");
        record.transition(RunStatus::Success, None);
        store.put_run(&record).await.unwrap();

        state.report_orphan("j1").await.unwrap();
        let stored = store.get_run("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn subscription_sees_updates_and_ends_on_terminal() {
        let (_store, state) = run_state(quiet_controller());
        state.create("j1", 1).await.unwrap();
        let mut rx = state.subscribe("j1");

        state
            .publish_build_update("j1", BuildUpdate::Log("hello".to_string()))
            .await
            .unwrap();
        state
            .finalize("j1", RunStatus::Success, None)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, UpdateKind::Log);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.data.status, RunStatus::Success);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn slow_controller_does_not_hold_up_other_jobs() {
        let informing = Arc::new(Notify::new());
        let store = Arc::new(MemoryStore::new());
        let controller = SlowController {
            informing: informing.clone(),
            delay: Duration::from_secs(2),
        };
        let state = Arc::new(RunState::new("node-1", store.clone(), Arc::new(controller)));
        state.create("a", 1).await.unwrap();
        state.create("b", 2).await.unwrap();

        let finalizing = tokio::spawn({
            let state = state.clone();
            async move { state.finalize("a", RunStatus::Success, None).await }
        });
        informing.notified().await;

        let started = Instant::now();
        state
            .publish_build_update("b", BuildUpdate::Log("still building".to_string()))
            .await
            .unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "log write waited {:?} behind another job's notification",
            started.elapsed()
        );

        let a = store.get_run("a").await.unwrap().unwrap();
        assert_eq!(a.status, RunStatus::Success);
        let b = store.get_run("b").await.unwrap().unwrap();
        assert_eq!(b.log, "still building\n");

        finalizing.abort();
    }
}
