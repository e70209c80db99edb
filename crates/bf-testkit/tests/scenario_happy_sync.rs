//! Synchronous submission: the waiter blocks on the rendezvous list and
//! receives the terminal record.

use std::time::Duration;

use bf_resolver::{ECHO, SLEEP_MS};
use bf_schemas::ExecutionStatus;
use bf_submit::WaitOutcome;
use bf_testkit::EngineHarness;
use serde_json::json;

#[tokio::test]
async fn sync_waiter_receives_the_terminal_record_via_rendezvous() {
    let h = EngineHarness::start_default().await;

    let mut req = EngineHarness::request(SLEEP_MS, json!({"duration_ms": 200}));
    req.sync = true;
    req.timeout_seconds = Some(5);
    let receipt = h.submitter.submit(req).await.expect("submit");

    let started = tokio::time::Instant::now();
    let outcome = h
        .submitter
        .wait_for_result(receipt.id, Duration::from_secs(10))
        .await
        .expect("wait");

    match outcome {
        WaitOutcome::Ready(rec) => {
            assert_eq!(rec.status, ExecutionStatus::Success);
            assert_eq!(rec.result, Some(json!({"slept_ms": 200})));
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "waiter must return well before its own deadline"
            );
        }
        WaitOutcome::TimedOut => panic!("waiter timed out on a 200ms execution"),
    }
}

#[tokio::test]
async fn late_waiter_reads_the_record_store_directly() {
    let h = EngineHarness::start_default().await;

    let mut req = EngineHarness::request(ECHO, json!({"value": "ok"}));
    req.sync = true;
    let receipt = h.submitter.submit(req).await.expect("submit");

    // Let the execution finish before anyone waits.
    h.await_terminal(receipt.id, Duration::from_secs(5)).await;

    let outcome = h
        .submitter
        .wait_for_result(receipt.id, Duration::from_secs(1))
        .await
        .expect("wait");
    match outcome {
        WaitOutcome::Ready(rec) => assert_eq!(rec.result, Some(json!("ok"))),
        WaitOutcome::TimedOut => panic!("terminal record must satisfy a late waiter"),
    }
}
