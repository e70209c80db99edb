//! Collaborator traits: the narrow, replaceable interfaces the engine is
//! written against. Production wiring uses Postgres (`bf-db`) and the
//! in-memory ephemeral store (`bf-ephemeral`); the test harness swaps in
//! deterministic in-memory implementations of all of them.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bf_ids::ExecutionId;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::model::{ExecutionRecord, LogLine, ResourceUsage};
use crate::status::{ErrorKind, ExecutionKind, ExecutionStatus};

// ---------------------------------------------------------------------------
// Durable queue
// ---------------------------------------------------------------------------

/// Opaque acknowledgement token returned by `consume`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The minimal hand-off message the submitter pushes onto the queue. The
/// full request stays in the ephemeral store under `pending:{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
}

impl DispatchMessage {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("dispatch message serialization must not fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A message handed out by `consume`, pending acknowledgement. Unacked
/// messages become visible again after the queue's visibility timeout.
#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub payload: Vec<u8>,
    pub token: AckToken,
}

/// Single-consumer-group FIFO with at-least-once delivery.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn publish(&self, message: Vec<u8>) -> Result<()>;

    /// Claim the next available message, or `None` when the queue is empty.
    /// Consumers poll; the queue never blocks the caller.
    async fn consume(&self) -> Result<Option<QueueMessage>>;

    /// Acknowledge a consumed message. Unknown or already-acked tokens are
    /// a no-op (the message may have been reaped and redelivered).
    async fn ack(&self, token: AckToken) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Ephemeral store
// ---------------------------------------------------------------------------

/// One pub/sub subscription. Backed by a broadcast receiver; a slow
/// subscriber that lags simply skips ahead (progress streams carry `seq`
/// so gaps are detectable).
pub struct Subscription {
    rx: broadcast::Receiver<Value>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<Value>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The subscription as a `Stream`, for consumers that pipe progress
    /// into SSE/WebSocket plumbing. Lagged gaps are skipped.
    pub fn into_stream(self) -> impl Stream<Item = Value> {
        BroadcastStream::new(self.rx).filter_map(|r| async move { r.ok() })
    }
}

/// Key/value with TTL, list queues, and pub/sub, treated as one logical
/// collaborator. TTLs are absolute monotonic-clock deadlines; values
/// disappear at most one sweep tick after expiry.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append to a list, creating it with the given TTL if absent.
    async fn rpush(&self, list: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Blocking left-pop: waits up to `timeout` for an element. A zero
    /// timeout polls once and returns immediately.
    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<Value>>;

    async fn publish(&self, channel: &str, message: Value) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Fields for the idempotent RUNNING upsert performed by the dispatcher.
#[derive(Clone, Debug)]
pub struct NewRunningRecord {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
    pub target_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
}

/// What `upsert_running` found. Duplicate queue deliveries are absorbed by
/// branching on this: anything already terminal is dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Fresh record created in RUNNING.
    Inserted,
    /// Record existed as PENDING or RUNNING; now RUNNING. `started_at` keeps
    /// its original value.
    AlreadyRunning,
    /// Record is terminal; nothing was written.
    AlreadyTerminal(ExecutionStatus),
}

/// Terminal fields applied by the result path.
#[derive(Clone, Debug)]
pub struct Finalization {
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub logs_ref: Option<String>,
    pub resource_usage: Option<ResourceUsage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    /// The record was already terminal; nothing was written. Re-running the
    /// result path observes this and no-ops.
    AlreadyTerminal(ExecutionStatus),
}

/// Relational storage for the execution record. The upsert and terminal
/// writes must be serializable; implementations use single-row guarded
/// statements.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_running(&self, rec: &NewRunningRecord) -> Result<UpsertOutcome>;
    async fn finalize(&self, id: ExecutionId, fin: &Finalization) -> Result<FinalizeOutcome>;
    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Count of non-terminal executions for a tenant. Backs the per-tenant
    /// concurrent-submission quota.
    async fn count_active(&self, tenant_id: &str) -> Result<i64>;
}

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

/// Blob storage for flushed execution logs. `put` returns the `logs_ref`
/// stamped onto the record.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn put(&self, id: ExecutionId, lines: &[LogLine]) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_message_round_trips() {
        let msg = DispatchMessage {
            id: ExecutionId::generate(),
            kind: ExecutionKind::Tool,
        };
        let back = DispatchMessage::decode(&msg.encode()).unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn subscription_stream_yields_published_values() {
        let (tx, rx) = broadcast::channel(8);
        let stream = Subscription::new(rx).into_stream();
        tx.send(serde_json::json!("a")).unwrap();
        tx.send(serde_json::json!("b")).unwrap();
        drop(tx);

        let got: Vec<Value> = stream.collect().await;
        assert_eq!(got, vec![serde_json::json!("a"), serde_json::json!("b")]);
    }

    #[tokio::test]
    async fn subscription_skips_lag_and_ends_on_close() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);
        // Overflow the 2-slot buffer so the receiver lags.
        for i in 0..4 {
            tx.send(serde_json::json!(i)).unwrap();
        }
        // Lagged deliveries resume at the oldest retained message.
        assert_eq!(sub.recv().await, Some(serde_json::json!(2)));
        assert_eq!(sub.recv().await, Some(serde_json::json!(3)));
        drop(tx);
        assert_eq!(sub.recv().await, None);
    }
}
