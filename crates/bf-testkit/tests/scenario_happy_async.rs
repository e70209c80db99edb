//! Happy-path asynchronous execution: submit, dispatch, run, finalize.

use std::time::Duration;

use bf_resolver::ECHO;
use bf_schemas::{ErrorKind, ExecutionStatus};
use bf_testkit::EngineHarness;
use serde_json::json;

#[tokio::test]
async fn async_submit_reaches_success_with_the_result() {
    let h = EngineHarness::start_default().await;

    let mut req = EngineHarness::request(ECHO, json!({"value": 42}));
    req.timeout_seconds = Some(5);
    let receipt = h.submitter.submit(req).await.expect("submit");
    assert_eq!(receipt.status, ExecutionStatus::Pending);

    let rec = h.await_terminal(receipt.id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::Success);
    assert_eq!(rec.result, Some(json!(42)));
    assert!(rec.error_kind.is_none() && rec.error_message.is_none());
    assert!(rec.finished_at.unwrap() >= rec.started_at.unwrap());

    let usage = rec.resource_usage.expect("resource usage recorded");
    assert!(usage.duration_ms < 5_000);
}

#[tokio::test]
async fn logs_are_flushed_and_referenced_from_the_record() {
    let h = EngineHarness::start_default().await;

    let receipt = h
        .submitter
        .submit(EngineHarness::request(ECHO, json!({"value": 1})))
        .await
        .expect("submit");

    let rec = h.await_terminal(receipt.id, Duration::from_secs(5)).await;
    let logs_ref = rec.logs_ref.expect("echo logs one line; logs_ref set");
    assert!(logs_ref.contains(&receipt.id.to_string()));

    let flushed = h.sink.flushed_for(receipt.id);
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].message, "echoing value");
}

#[tokio::test]
async fn user_error_target_fails_with_the_message() {
    let h = EngineHarness::start_default().await;

    let receipt = h
        .submitter
        .submit(EngineHarness::request(
            bf_resolver::FAIL_WITH,
            json!({"message": "kaput"}),
        ))
        .await
        .expect("submit");

    let rec = h.await_terminal(receipt.id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::Failed);
    assert_eq!(rec.error_kind, Some(ErrorKind::UserError));
    assert_eq!(rec.error_message.as_deref(), Some("kaput"));
    assert!(rec.result.is_none());
}

#[tokio::test]
async fn soft_failure_sentinel_completes_with_errors() {
    let h = EngineHarness::start_default().await;

    let receipt = h
        .submitter
        .submit(EngineHarness::request(
            bf_resolver::SOFT_FAIL,
            json!({"error": "row 7 rejected"}),
        ))
        .await
        .expect("submit");

    let rec = h.await_terminal(receipt.id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::CompletedWithErrors);
    assert_eq!(rec.error_kind, Some(ErrorKind::UserError));
    assert_eq!(rec.error_message.as_deref(), Some("row 7 rejected"));
}
