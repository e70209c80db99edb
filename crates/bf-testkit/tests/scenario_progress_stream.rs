//! Progress streaming: per-execution ordering and seq monotonicity, tenant
//! channel fan-out, and gap detection for late subscribers.

use std::time::Duration;

use bf_resolver::SLEEP_MS;
use bf_schemas::{tenant_progress_channel, EphemeralStore, ProgressEvent, ProgressKind};
use bf_testkit::EngineHarness;
use serde_json::json;

async fn drain_events(
    sub: &mut bf_schemas::Subscription,
    quiet: Duration,
) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(quiet, sub.recv()).await {
            Ok(Some(v)) => events.push(serde_json::from_value(v).unwrap()),
            Ok(None) | Err(_) => break,
        }
    }
    events
}

#[tokio::test]
async fn tenant_channel_carries_phases_logs_and_one_completion_in_order() {
    let h = EngineHarness::start_default().await;

    // Subscribe on the tenant channel before submitting so nothing is
    // missed (per-execution channels race the submit by construction).
    let mut sub = h
        .store
        .subscribe(&tenant_progress_channel("tenant-a"))
        .await
        .expect("subscribe");

    let mut req = EngineHarness::request(SLEEP_MS, json!({"duration_ms": 100}));
    req.timeout_seconds = Some(5);
    let receipt = h.submitter.submit(req).await.expect("submit");
    h.await_terminal(receipt.id, Duration::from_secs(5)).await;

    let events = drain_events(&mut sub, Duration::from_millis(300)).await;
    let mine: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| e.execution_id == receipt.id)
        .collect();
    assert!(!mine.is_empty(), "tenant channel received events");

    // seq is monotonic and dense in emission order.
    for (i, ev) in mine.iter().enumerate() {
        assert_eq!(ev.seq, (i + 1) as u64, "seq gap or reorder at index {i}");
    }

    // The sleep target marks two phases; the terminal state event is last
    // and unique.
    let phases: Vec<&str> = mine
        .iter()
        .filter(|e| e.kind == ProgressKind::Phase)
        .filter_map(|e| e.payload.get("phase").and_then(|p| p.as_str()))
        .collect();
    assert_eq!(phases, vec!["sleeping", "done"]);

    let states: Vec<&&ProgressEvent> = mine
        .iter()
        .filter(|e| e.kind == ProgressKind::State)
        .collect();
    assert_eq!(states.len(), 1, "exactly one completion event");
    assert_eq!(
        states[0].payload.get("status").and_then(|s| s.as_str()),
        Some("SUCCESS")
    );
    assert_eq!(states[0].seq, mine.last().unwrap().seq, "completion is last");
}

#[tokio::test]
async fn late_subscriber_sees_no_history() {
    let h = EngineHarness::start_default().await;

    let mut req = EngineHarness::request(SLEEP_MS, json!({"duration_ms": 50}));
    req.timeout_seconds = Some(5);
    let receipt = h.submitter.submit(req).await.expect("submit");
    h.await_terminal(receipt.id, Duration::from_secs(5)).await;

    // Subscribing after the fact yields silence; completeness requires the
    // flushed log reference on the record instead.
    let mut sub = h
        .store
        .subscribe(&bf_schemas::progress_channel(receipt.id))
        .await
        .expect("subscribe");
    let events = drain_events(&mut sub, Duration::from_millis(200)).await;
    assert!(events.is_empty(), "no replay for late subscribers");
}
