//! Scenario tests for the in-memory ephemeral store: TTL expiry, the
//! rendezvous blocking pop, and pub/sub fan-out. Time-sensitive cases run
//! with the paused tokio clock so they are deterministic.

use std::time::Duration;

use bf_ephemeral::MemoryStore;
use bf_schemas::EphemeralStore;
use serde_json::json;

// ---------------------------------------------------------------------------
// Key/value + TTL
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn get_returns_value_until_ttl_then_none() {
    let store = MemoryStore::new();
    store
        .set("pending:abc", json!({"x": 1}), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(
        store.get("pending:abc").await.unwrap(),
        Some(json!({"x": 1}))
    );

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(store.get("pending:abc").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn sweep_drops_expired_keys_that_are_never_read() {
    let store = MemoryStore::new();
    store
        .set("k", json!(1), Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    store.sweep().await;

    // Re-set under the same key must see a clean slate.
    assert_eq!(store.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn delete_removes_key_and_list() {
    let store = MemoryStore::new();
    store
        .set("k", json!(1), Duration::from_secs(60))
        .await
        .unwrap();
    store
        .rpush("k", json!(2), Duration::from_secs(60))
        .await
        .unwrap();

    store.delete("k").await.unwrap();

    assert_eq!(store.get("k").await.unwrap(), None);
    assert_eq!(
        store.blpop("k", Duration::ZERO).await.unwrap(),
        None,
        "deleted list must be empty"
    );
}

// ---------------------------------------------------------------------------
// Rendezvous lists
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blpop_returns_pushed_value_in_fifo_order() {
    let store = MemoryStore::new();
    store
        .rpush("result:1", json!("first"), Duration::from_secs(60))
        .await
        .unwrap();
    store
        .rpush("result:1", json!("second"), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(
        store.blpop("result:1", Duration::ZERO).await.unwrap(),
        Some(json!("first"))
    );
    assert_eq!(
        store.blpop("result:1", Duration::ZERO).await.unwrap(),
        Some(json!("second"))
    );
}

#[tokio::test]
async fn blpop_zero_timeout_on_empty_list_returns_immediately() {
    let store = MemoryStore::new();
    let got = store.blpop("result:none", Duration::ZERO).await.unwrap();
    assert_eq!(got, None);
}

#[tokio::test]
async fn blpop_wakes_when_a_value_arrives_later() {
    let store = MemoryStore::new();

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.blpop("result:x", Duration::from_secs(5)).await })
    };

    // Give the waiter a chance to park before pushing.
    tokio::time::sleep(Duration::from_millis(20)).await;
    store
        .rpush("result:x", json!("done"), Duration::from_secs(60))
        .await
        .unwrap();

    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got, Some(json!("done")));
}

#[tokio::test(start_paused = true)]
async fn blpop_times_out_when_nothing_arrives() {
    let store = MemoryStore::new();
    let got = store.blpop("result:y", Duration::from_secs(3)).await.unwrap();
    assert_eq!(got, None);
}

// ---------------------------------------------------------------------------
// Pub/sub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_then_publish_delivers_to_all_subscribers() {
    let store = MemoryStore::new();
    let mut a = store.subscribe("cancel").await.unwrap();
    let mut b = store.subscribe("cancel").await.unwrap();

    store
        .publish("cancel", json!({"execution_id": "e1"}))
        .await
        .unwrap();

    assert_eq!(a.recv().await, Some(json!({"execution_id": "e1"})));
    assert_eq!(b.recv().await, Some(json!({"execution_id": "e1"})));
}

#[tokio::test]
async fn publish_without_subscribers_is_a_noop() {
    let store = MemoryStore::new();
    // Must not error; late subscribers receive nothing (no history).
    store.publish("progress:z", json!(1)).await.unwrap();

    let mut late = store.subscribe("progress:z").await.unwrap();
    store.publish("progress:z", json!(2)).await.unwrap();
    assert_eq!(
        late.recv().await,
        Some(json!(2)),
        "late subscriber sees only post-subscription events"
    );
}
