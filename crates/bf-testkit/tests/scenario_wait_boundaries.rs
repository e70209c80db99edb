//! Boundary behaviors of the synchronous wait: zero timeouts, waiter
//! independence from the execution deadline.

use std::time::Duration;

use bf_ids::ExecutionId;
use bf_resolver::{ECHO, SLEEP_MS};
use bf_schemas::ExecutionStatus;
use bf_submit::WaitOutcome;
use bf_testkit::EngineHarness;
use serde_json::json;

#[tokio::test]
async fn zero_timeout_wait_returns_immediately_with_a_terminal_record() {
    let h = EngineHarness::start_default().await;

    let mut req = EngineHarness::request(ECHO, json!({"value": "done"}));
    req.sync = true;
    let receipt = h.submitter.submit(req).await.expect("submit");
    h.await_terminal(receipt.id, Duration::from_secs(5)).await;

    let started = tokio::time::Instant::now();
    let outcome = h
        .submitter
        .wait_for_result(receipt.id, Duration::ZERO)
        .await
        .expect("wait");
    assert!(started.elapsed() < Duration::from_millis(200));
    match outcome {
        WaitOutcome::Ready(rec) => assert_eq!(rec.result, Some(json!("done"))),
        WaitOutcome::TimedOut => panic!("terminal record must be returned"),
    }
}

#[tokio::test]
async fn zero_timeout_wait_on_unfinished_execution_times_out_immediately() {
    let h = EngineHarness::start_default().await;

    let started = tokio::time::Instant::now();
    let outcome = h
        .submitter
        .wait_for_result(ExecutionId::generate(), Duration::ZERO)
        .await
        .expect("wait");
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(matches!(outcome, WaitOutcome::TimedOut));
}

#[tokio::test]
async fn waiter_giving_up_leaves_the_execution_running_to_completion() {
    let h = EngineHarness::start_default().await;

    let mut req = EngineHarness::request(SLEEP_MS, json!({"duration_ms": 600}));
    req.sync = true;
    req.timeout_seconds = Some(10);
    let receipt = h.submitter.submit(req).await.expect("submit");

    let outcome = h
        .submitter
        .wait_for_result(receipt.id, Duration::from_millis(50))
        .await
        .expect("wait");
    assert!(
        matches!(outcome, WaitOutcome::TimedOut),
        "50ms waiter must give up on a 600ms execution"
    );

    // The execution is unaffected by the waiter's exit.
    let rec = h.await_terminal(receipt.id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::Success);
}
