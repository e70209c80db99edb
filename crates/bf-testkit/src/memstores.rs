//! In-memory durable-queue, record-store, and log-sink implementations
//! with the same guard semantics as the Postgres versions: claims with a
//! visibility timeout, idempotent RUNNING upserts, write-once finalize.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use bf_ids::ExecutionId;
use bf_schemas::{
    AckToken, DurableQueue, ExecutionRecord, ExecutionStatus, Finalization, FinalizeOutcome,
    LogLine, LogSink, NewRunningRecord, QueueMessage, RecordStore, UpsertOutcome,
};

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

struct QueueInner {
    next_id: u64,
    pending: VecDeque<(u64, Vec<u8>)>,
    claimed: HashMap<u64, (Vec<u8>, Instant)>,
}

/// At-least-once FIFO. `inject_duplicate` republishes an arbitrary payload
/// to exercise duplicate-delivery absorption.
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_id: 1,
                pending: VecDeque::new(),
                claimed: HashMap::new(),
            }),
            visibility_timeout,
        }
    }

    /// Deliver `payload` again even though it was already published once.
    pub fn inject_duplicate(&self, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push_back((id, payload));
    }

    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.pending.len() + inner.claimed.len()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn publish(&self, message: Vec<u8>) -> Result<()> {
        self.inject_duplicate(message);
        Ok(())
    }

    async fn consume(&self) -> Result<Option<QueueMessage>> {
        let mut inner = self.inner.lock().unwrap();

        // Reap expired claims back to the front, oldest first.
        let now = Instant::now();
        let expired: Vec<u64> = inner
            .claimed
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= self.visibility_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((payload, _)) = inner.claimed.remove(&id) {
                inner.pending.push_front((id, payload));
            }
        }

        let Some((id, payload)) = inner.pending.pop_front() else {
            return Ok(None);
        };
        inner.claimed.insert(id, (payload.clone(), now));
        Ok(Some(QueueMessage {
            payload,
            token: AckToken::new(id.to_string()),
        }))
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        let Ok(id) = token.as_str().parse::<u64>() else {
            return Ok(());
        };
        self.inner.lock().unwrap().claimed.remove(&id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_running(&self, rec: &NewRunningRecord) -> Result<UpsertOutcome> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&rec.id) {
            None => {
                records.insert(
                    rec.id,
                    ExecutionRecord {
                        id: rec.id,
                        kind: rec.kind,
                        target_id: rec.target_id.clone(),
                        tenant_id: rec.tenant_id.clone(),
                        user_id: rec.user_id.clone(),
                        status: ExecutionStatus::Running,
                        started_at: Some(rec.started_at),
                        finished_at: None,
                        result: None,
                        error_kind: None,
                        error_message: None,
                        logs_ref: None,
                        resource_usage: None,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) if existing.status.is_terminal() => {
                Ok(UpsertOutcome::AlreadyTerminal(existing.status))
            }
            Some(existing) => {
                existing.status = ExecutionStatus::Running;
                existing.started_at.get_or_insert(rec.started_at);
                Ok(UpsertOutcome::AlreadyRunning)
            }
        }
    }

    async fn finalize(&self, id: ExecutionId, fin: &Finalization) -> Result<FinalizeOutcome> {
        let mut records = self.records.lock().unwrap();
        let rec = records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("finalize: unknown execution {id}"))?;
        if rec.status.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyTerminal(rec.status));
        }
        rec.status = fin.status;
        rec.finished_at = Some(fin.finished_at);
        rec.result = fin.result.clone();
        rec.error_kind = fin.error_kind;
        rec.error_message = fin.error_message.clone();
        rec.logs_ref = fin.logs_ref.clone();
        rec.resource_usage = fin.resource_usage.clone();
        Ok(FinalizeOutcome::Finalized)
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn count_active(&self, tenant_id: &str) -> Result<i64> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.tenant_id == tenant_id && !r.status.is_terminal())
            .count() as i64)
    }
}

// ---------------------------------------------------------------------------
// MemoryLogSink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLogSink {
    flushed: Mutex<HashMap<ExecutionId, Vec<LogLine>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushed_for(&self, id: ExecutionId) -> Vec<LogLine> {
        self.flushed
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn put(&self, id: ExecutionId, lines: &[LogLine]) -> Result<String> {
        self.flushed.lock().unwrap().insert(id, lines.to_vec());
        Ok(format!("mem:logs:{id}"))
    }
}
