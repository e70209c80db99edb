//! Crash detection: a worker dying mid-run yields a synthetic
//! WORKER_CRASHED record and a respawned slot.

use std::time::Duration;

use bf_resolver::ECHO;
use bf_schemas::{ErrorKind, ExecutionStatus};
use bf_testkit::{EngineHarness, CRASH_SENTINEL};
use serde_json::json;

#[tokio::test]
async fn crash_produces_a_synthetic_failed_record() {
    let h = EngineHarness::start_default().await;

    let receipt = h
        .submitter
        .submit(EngineHarness::request(CRASH_SENTINEL, json!({})))
        .await
        .expect("submit");

    let rec = h.await_terminal(receipt.id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::Failed);
    assert_eq!(rec.error_kind, Some(ErrorKind::WorkerCrashed));
    assert!(
        rec.error_message.unwrap().contains("without a result"),
        "synthetic result names the crash"
    );
}

#[tokio::test]
async fn pool_respawns_and_serves_after_a_crash() {
    let h = EngineHarness::start_default().await;

    let crash = h
        .submitter
        .submit(EngineHarness::request(CRASH_SENTINEL, json!({})))
        .await
        .expect("submit");
    h.await_terminal(crash.id, Duration::from_secs(5)).await;

    // The replacement slot serves the next execution.
    let ok = h
        .submitter
        .submit(EngineHarness::request(ECHO, json!({"value": 1})))
        .await
        .expect("submit");
    let rec = h.await_terminal(ok.id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::Success);

    // And the pool is back at its floor.
    let status = h.pool.status().await.expect("pool status");
    assert!(status.pool_size >= 1, "pool respawned to min_workers");
}

#[tokio::test]
async fn consecutive_crashes_each_get_their_own_record() {
    let h = EngineHarness::start_default().await;

    for _ in 0..3 {
        let receipt = h
            .submitter
            .submit(EngineHarness::request(CRASH_SENTINEL, json!({})))
            .await
            .expect("submit");
        let rec = h.await_terminal(receipt.id, Duration::from_secs(5)).await;
        assert_eq!(rec.error_kind, Some(ErrorKind::WorkerCrashed));
    }
}
