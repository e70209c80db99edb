//! Record store lifecycle against a real Postgres.
//!
//! Requires BIFROST_DATABASE_URL; each test skips (with a note on stderr)
//! when it is not set, so the suite stays green on machines without a
//! database.

use bf_db::PgRecordStore;
use bf_ids::ExecutionId;
use bf_schemas::{
    ErrorKind, ExecutionKind, ExecutionStatus, Finalization, FinalizeOutcome, NewRunningRecord,
    RecordStore, ResourceUsage, UpsertOutcome,
};
use chrono::Utc;

fn db_available() -> bool {
    if std::env::var(bf_db::ENV_DB_URL).is_ok() {
        true
    } else {
        eprintln!("skipping: {} not set", bf_db::ENV_DB_URL);
        false
    }
}

fn new_running(id: ExecutionId) -> NewRunningRecord {
    NewRunningRecord {
        id,
        kind: ExecutionKind::Workflow,
        target_id: "wf:t1".into(),
        tenant_id: "tenant-a".into(),
        user_id: "user-1".into(),
        started_at: Utc::now(),
    }
}

fn success_finalization() -> Finalization {
    Finalization {
        status: ExecutionStatus::Success,
        finished_at: Utc::now(),
        result: Some(serde_json::json!(42)),
        error_kind: None,
        error_message: None,
        logs_ref: None,
        resource_usage: Some(ResourceUsage {
            duration_ms: 12,
            peak_memory_bytes: None,
            integrations_invoked: vec![],
        }),
    }
}

#[tokio::test]
async fn upsert_is_idempotent_and_finalize_is_write_once() {
    if !db_available() {
        return;
    }
    let pool = bf_db::testkit_db_pool().await.expect("db pool");
    let store = PgRecordStore::new(pool);

    let id = ExecutionId::generate();
    let rec = new_running(id);

    assert_eq!(
        store.upsert_running(&rec).await.unwrap(),
        UpsertOutcome::Inserted
    );
    // Duplicate queue delivery: absorbed, still RUNNING.
    assert_eq!(
        store.upsert_running(&rec).await.unwrap(),
        UpsertOutcome::AlreadyRunning
    );

    assert_eq!(
        store.finalize(id, &success_finalization()).await.unwrap(),
        FinalizeOutcome::Finalized
    );
    // Second finalize is a no-op.
    assert_eq!(
        store.finalize(id, &success_finalization()).await.unwrap(),
        FinalizeOutcome::AlreadyTerminal(ExecutionStatus::Success)
    );
    // A late duplicate delivery cannot resurrect a terminal record.
    assert_eq!(
        store.upsert_running(&rec).await.unwrap(),
        UpsertOutcome::AlreadyTerminal(ExecutionStatus::Success)
    );

    let got = store.get(id).await.unwrap().expect("record exists");
    assert_eq!(got.status, ExecutionStatus::Success);
    assert_eq!(got.result, Some(serde_json::json!(42)));
    assert!(got.error_kind.is_none());
    assert!(got.finished_at.unwrap() >= got.started_at.unwrap());
}

#[tokio::test]
async fn finalize_failure_carries_the_error_pair_not_a_result() {
    if !db_available() {
        return;
    }
    let pool = bf_db::testkit_db_pool().await.expect("db pool");
    let store = PgRecordStore::new(pool);

    let id = ExecutionId::generate();
    store.upsert_running(&new_running(id)).await.unwrap();

    let fin = Finalization {
        status: ExecutionStatus::Timeout,
        finished_at: Utc::now(),
        result: None,
        error_kind: Some(ErrorKind::Timeout),
        error_message: Some("deadline exceeded after 1s".into()),
        logs_ref: None,
        resource_usage: None,
    };
    store.finalize(id, &fin).await.unwrap();

    let got = store.get(id).await.unwrap().unwrap();
    assert_eq!(got.status, ExecutionStatus::Timeout);
    assert!(got.result.is_none());
    assert_eq!(got.error_kind, Some(ErrorKind::Timeout));
    assert!(got.error_message.unwrap().contains("deadline"));
}

#[tokio::test]
async fn finalize_unknown_execution_is_an_error() {
    if !db_available() {
        return;
    }
    let pool = bf_db::testkit_db_pool().await.expect("db pool");
    let store = PgRecordStore::new(pool);

    let err = store
        .finalize(ExecutionId::generate(), &success_finalization())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown execution"));
}
