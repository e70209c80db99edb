//! Dispatch-time failure paths, driven by staging requests directly (the
//! submitter would reject these up front; the dispatcher must still defend
//! against them because targets can be re-registered between staging and
//! dispatch).

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use bf_ids::ExecutionId;
use bf_resolver::ECHO;
use bf_schemas::{
    pending_key, DispatchMessage, DurableQueue, EphemeralStore, ErrorKind, ExecutionKind,
    ExecutionRequest, ExecutionStatus, RecordStore,
};
use bf_testkit::EngineHarness;

async fn stage_and_publish(h: &EngineHarness, target: &str, parameters: serde_json::Value) -> ExecutionId {
    let id = ExecutionId::generate();
    let request = ExecutionRequest {
        id,
        kind: ExecutionKind::Tool,
        target: target.into(),
        parameters,
        caller: EngineHarness::caller(),
        config: json!({}),
        timeout_seconds: Some(5),
        sync: false,
        enqueued_at: Utc::now(),
        enqueued_at_monotonic_ms: 0,
    };
    h.store
        .set(
            &pending_key(id),
            serde_json::to_value(&request).unwrap(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    h.queue
        .publish(
            DispatchMessage {
                id,
                kind: ExecutionKind::Tool,
            }
            .encode(),
        )
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn bad_parameters_become_a_terminal_invalid_params_record() {
    let h = EngineHarness::start_default().await;

    // echo requires `value`; stage garbage past the submitter.
    let id = stage_and_publish(&h, ECHO, json!({"wrong": 1})).await;

    let rec = h.await_terminal(id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::Failed);
    assert_eq!(rec.error_kind, Some(ErrorKind::InvalidParams));
    assert!(rec.error_message.unwrap().contains("value"));
}

#[tokio::test]
async fn vanished_target_becomes_a_terminal_target_not_found_record() {
    let h = EngineHarness::start_default().await;

    let id = stage_and_publish(&h, "wf:deregistered", json!({})).await;

    let rec = h.await_terminal(id, Duration::from_secs(5)).await;
    assert_eq!(rec.status, ExecutionStatus::Failed);
    assert_eq!(rec.error_kind, Some(ErrorKind::TargetNotFound));
}

#[tokio::test]
async fn handoff_without_a_staged_request_is_dropped_silently() {
    let h = EngineHarness::start_default().await;

    // A hand-off whose pending key expired: dropped with an ack, no record.
    let ghost = ExecutionId::generate();
    h.queue
        .publish(
            DispatchMessage {
                id: ghost,
                kind: ExecutionKind::Tool,
            }
            .encode(),
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.queue.depth() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "message never acked");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.records.get(ghost).await.unwrap().is_none(), "no record created");
}
