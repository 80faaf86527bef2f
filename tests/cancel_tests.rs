//! Cancellation at every stage of a job: queued, being created, created,
//! and with an open build session.


use std::sync::Arc;
use std::time::Duration;

use iglu_scheduler::protocol::ClaimResult;
use iglu_scheduler::scheduler::job::{RunStatus, CANCELLED_REASON};
use iglu_scheduler::store::MemoryStore;
use serde_json::json;
use test_harness::{
    assert_eventually, container_name, settle, test_config, ApplyReply, BuilderEnding,
    FakeBuilder, FakeController, FakeRuntime, TestAgent,
};

#[tokio::test]
async fn test_cancel_queued_job_never_starts() {
    let agent = TestAgent::start(test_config(1)).await;

    agent.offer("job-a", 1).await;
    agent.offer("job-b", 2).await;
    assert_eventually(
        || async { agent.controller.applies().len() == 2 },
        Duration::from_secs(2),
        "both jobs should be claimed",
    )
    .await;
    agent.respond("job-a", 1, ClaimResult::Approved).await;
    agent.respond("job-b", 2, ClaimResult::Approved).await;
    assert_eventually(
        || async { agent.queued() == vec!["job-b".to_string()] },
        Duration::from_secs(2),
        "B should wait behind A",
    )
    .await;

    agent.cancel("job-b").await;
    assert_eventually(
        || async { agent.queued().is_empty() },
        Duration::from_secs(2),
        "B should leave the queue",
    )
    .await;

    agent.runtime.crash(&container_name("job-a", 1)).await;
    assert_eventually(
        || async { agent.status("job-a").await == Some(RunStatus::Failed) },
        Duration::from_secs(2),
        "A should fail",
    )
    .await;
    settle().await;
    assert_eq!(agent.runtime.started(), vec![container_name("job-a", 1)]);
    assert!(agent.record("job-b").await.is_none());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_cancel_created_container_stops_it_once() {
    let agent = TestAgent::start(test_config(2)).await;
    let name = container_name("job-a", 1);

    agent.claim("job-a", 1).await;
    assert_eventually(
        || async { agent.runtime.started().len() == 1 },
        Duration::from_secs(2),
        "container should be created",
    )
    .await;

    agent.cancel("job-a").await;
    agent.cancel("job-a").await;
    assert_eventually(
        || async { agent.status("job-a").await == Some(RunStatus::Failed) },
        Duration::from_secs(2),
        "cancelled run should fail",
    )
    .await;
    settle().await;

    let record = agent.record("job-a").await.unwrap();
    assert_eq!(record.reason.as_deref(), Some(CANCELLED_REASON));
    assert_eq!(agent.runtime.stop_count(&name), 1);
    assert_eq!(agent.running(), 0);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_creation_stops_after_create() {
    let agent = TestAgent::start(test_config(2)).await;
    let name = container_name("job-a", 1);
    agent.runtime.hold_starts();

    agent.claim("job-a", 1).await;
    assert_eventually(
        || async { agent.running() == 1 },
        Duration::from_secs(2),
        "job should be dispatched",
    )
    .await;

    agent.cancel("job-a").await;
    settle().await;
    // Nothing to stop while the runtime does not know the container.
    assert_eq!(agent.runtime.stop_count(&name), 0);

    agent.runtime.release_starts();
    assert_eventually(
        || async { agent.runtime.stop_count(&name) == 1 },
        Duration::from_secs(2),
        "container should be stopped once created",
    )
    .await;
    assert_eventually(
        || async { agent.status("job-a").await == Some(RunStatus::Failed) },
        Duration::from_secs(2),
        "cancelled run should fail",
    )
    .await;
    let record = agent.record("job-a").await.unwrap();
    assert_eq!(record.reason.as_deref(), Some(CANCELLED_REASON));
    settle().await;
    assert_eq!(agent.runtime.stop_count(&name), 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_cancel_with_open_session_overrides_result() {
    let builder = FakeBuilder::spawn(&["step 1"], BuilderEnding::Close(1000), true).await;
    let runtime = Arc::new(FakeRuntime::new(true));
    runtime.publish_builder(builder.port);
    let agent = TestAgent::with_fakes(
        test_config(2),
        Arc::new(MemoryStore::new()),
        runtime,
        Arc::new(FakeController::new(ApplyReply::Pending)),
    )
    .await;
    let name = container_name("job-a", 1);
    agent.set_build_config(1, json!({"name": "demo"})).await;

    agent.claim("job-a", 1).await;
    assert_eventually(
        || async { agent.status("job-a").await == Some(RunStatus::Running) },
        Duration::from_secs(2),
        "build stream should open",
    )
    .await;

    agent.cancel("job-a").await;
    assert_eventually(
        || async { agent.runtime.stop_count(&name) == 1 },
        Duration::from_secs(2),
        "cancel should stop the container",
    )
    .await;

    // The builder still reports a clean exit afterwards.
    builder.release();
    assert_eventually(
        || async { agent.status("job-a").await == Some(RunStatus::Failed) },
        Duration::from_secs(2),
        "cancelled run should end failed",
    )
    .await;
    settle().await;

    let record = agent.record("job-a").await.unwrap();
    assert_eq!(record.reason.as_deref(), Some(CANCELLED_REASON));
    assert_eq!(agent.runtime.stop_count(&name), 1);
    assert_eq!(
        agent.controller.transitions("job-a").last(),
        Some(&(RunStatus::Running, RunStatus::Failed))
    );

    agent.shutdown().await;
}

#[tokio::test]
async fn test_cancel_for_unknown_job_is_ignored() {
    let agent = TestAgent::start(test_config(1)).await;

    agent.cancel("job-x").await;
    settle().await;
    assert!(agent.runtime.stopped().is_empty());
    assert!(agent.controller.informs().is_empty());

    agent.shutdown().await;
}
