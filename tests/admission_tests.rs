//! Claim protocol tests: which broadcast jobs the node competes for and how
//! controller answers turn into dispatched containers.


use std::sync::Arc;
use std::time::Duration;

use iglu_scheduler::protocol::ClaimResult;
use iglu_scheduler::store::MemoryStore;
use test_harness::{
    assert_eventually, container_name, settle, test_config, ApplyReply, FakeController,
    FakeRuntime, TestAgent,
};

#[tokio::test]
async fn test_eligible_job_is_claimed_once() {
    let agent = TestAgent::start(test_config(2)).await;

    agent.offer("job-a", 7).await;
    agent.offer("job-a", 7).await;

    assert_eventually(
        || async { agent.controller.apply_count("job-a") == 1 },
        Duration::from_secs(2),
        "job should be claimed",
    )
    .await;
    settle().await;
    assert_eq!(agent.controller.apply_count("job-a"), 1);
    let request = &agent.controller.applies()[0];
    assert_eq!(request.builder_id, 7);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_approvals_start_one_container() {
    let agent = TestAgent::start(test_config(2)).await;

    agent.claim("job-a", 7).await;
    agent.respond("job-a", 7, ClaimResult::Approved).await;
    agent.respond("job-a", 7, ClaimResult::Approved).await;

    assert_eventually(
        || async { agent.runtime.started().len() == 1 },
        Duration::from_secs(2),
        "approved job should be dispatched",
    )
    .await;
    settle().await;
    assert_eq!(agent.runtime.started(), vec![container_name("job-a", 7)]);
    assert_eq!(agent.running(), 1);
    assert!(agent.queued().is_empty());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_denied_and_unsolicited_responses_are_ignored() {
    let agent = TestAgent::start(test_config(2)).await;

    agent.offer("job-a", 1).await;
    assert_eventually(
        || async { agent.controller.apply_count("job-a") == 1 },
        Duration::from_secs(2),
        "job should be claimed",
    )
    .await;
    agent.respond("job-a", 1, ClaimResult::Denied).await;
    agent.respond("never-offered", 1, ClaimResult::Approved).await;
    // An approval after a denial is treated as foreign.
    agent.respond("job-a", 1, ClaimResult::Approved).await;

    settle().await;
    assert!(agent.runtime.started().is_empty());
    assert!(agent.record("job-a").await.is_none());
    assert!(agent.record("never-offered").await.is_none());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_arch_is_not_claimed() {
    let agent = TestAgent::start(test_config(2)).await;

    agent.offer_arch("job-a", 1, "mips-unknown").await;
    settle().await;
    assert!(agent.controller.applies().is_empty());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_cross_arch_is_claimed_when_enabled() {
    let config = test_config(2).with_cross_arch("s390x");
    let agent = TestAgent::start(config).await;

    agent.offer_arch("job-a", 1, "s390x").await;
    assert_eventually(
        || async { agent.controller.apply_count("job-a") == 1 },
        Duration::from_secs(2),
        "cross-arch job should be claimed",
    )
    .await;

    agent.shutdown().await;
}

#[tokio::test]
async fn test_no_claims_at_capacity() {
    let agent = TestAgent::start(test_config(1)).await;

    agent.claim("job-a", 1).await;
    assert_eventually(
        || async { agent.running() == 1 },
        Duration::from_secs(2),
        "first job should occupy the only slot",
    )
    .await;

    agent.offer("job-b", 1).await;
    settle().await;
    assert_eq!(agent.controller.apply_count("job-b"), 0);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_failed_claim_request_is_forgotten() {
    let agent = TestAgent::with_fakes(
        test_config(2),
        Arc::new(MemoryStore::new()),
        Arc::new(FakeRuntime::new(false)),
        Arc::new(FakeController::new(ApplyReply::Fail)),
    )
    .await;

    agent.offer("job-a", 1).await;
    assert_eventually(
        || async { agent.controller.apply_count("job-a") == 1 },
        Duration::from_secs(2),
        "claim should be attempted",
    )
    .await;
    settle().await;

    agent.respond("job-a", 1, ClaimResult::Approved).await;
    settle().await;
    assert!(agent.runtime.started().is_empty());

    // Forgotten jobs can be claimed again on a later broadcast.
    agent.offer("job-a", 1).await;
    assert_eventually(
        || async { agent.controller.apply_count("job-a") == 2 },
        Duration::from_secs(2),
        "job should be claimable again",
    )
    .await;

    agent.shutdown().await;
}

#[tokio::test]
async fn test_inline_approval_dispatches() {
    let agent = TestAgent::with_fakes(
        test_config(2),
        Arc::new(MemoryStore::new()),
        Arc::new(FakeRuntime::new(false)),
        Arc::new(FakeController::new(ApplyReply::ApproveInline)),
    )
    .await;

    agent.offer("job-a", 3).await;
    assert_eventually(
        || async { agent.runtime.started() == vec![container_name("job-a", 3)] },
        Duration::from_secs(2),
        "inline approval should dispatch the job",
    )
    .await;

    // The same approval echoed on the channel changes nothing.
    agent.respond("job-a", 3, ClaimResult::Approved).await;
    settle().await;
    assert_eq!(agent.runtime.started().len(), 1);

    agent.shutdown().await;
}
