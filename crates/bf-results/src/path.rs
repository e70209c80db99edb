//! The result path.
//!
//! Consumes completion events from the pool manager and runs each through
//! the same idempotent sequence: flush logs, finalize the record, publish
//! exactly one completion event, fulfill the rendezvous for synchronous
//! submitters, delete the per-execution ephemeral keys. Re-running any
//! step observes terminal state and no-ops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bf_ids::ExecutionId;
use bf_schemas::{
    context_key, pending_key, result_key, CompletionEvent, ContextRecord, EphemeralStore,
    Finalization, FinalizeOutcome, LogSink, ProgressKind, RawProgress, RecordStore,
};

/// Bounded-retry budget for collaborator calls. Exceeding it drops to a
/// warning; the record keeps its last consistent state and the queue's
/// at-least-once delivery gets another chance on redelivery paths.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

pub struct ResultPath {
    records: Arc<dyn RecordStore>,
    store: Arc<dyn EphemeralStore>,
    sink: Arc<dyn LogSink>,
    progress: mpsc::UnboundedSender<RawProgress>,
    /// TTL for the rendezvous push, bounded by the maximum synchronous wait.
    rendezvous_ttl: Duration,
}

impl ResultPath {
    pub fn new(
        records: Arc<dyn RecordStore>,
        store: Arc<dyn EphemeralStore>,
        sink: Arc<dyn LogSink>,
        progress: mpsc::UnboundedSender<RawProgress>,
        rendezvous_ttl: Duration,
    ) -> Self {
        Self {
            records,
            store,
            sink,
            progress,
            rendezvous_ttl,
        }
    }

    /// Consume completions until the channel closes (pool shutdown).
    pub async fn run(self, mut completions: mpsc::UnboundedReceiver<CompletionEvent>) {
        info!("result path running");
        while let Some(ev) = completions.recv().await {
            self.handle(ev).await;
        }
        info!("result path stopped");
    }

    /// Process one completion. Public for the scenario harness.
    pub async fn handle(&self, ev: CompletionEvent) {
        let id = ev.execution_id;

        // The staged context tells us whether a synchronous submitter is
        // waiting. Read it before the cleanup step deletes it; when it has
        // already expired (very long executions) the rendezvous degrades to
        // record-store polling by the waiter.
        let context: Option<ContextRecord> = match self.store.get(&context_key(id)).await {
            Ok(Some(v)) => serde_json::from_value(v).ok(),
            _ => None,
        };

        // Flush buffered logs first so the finalized record can reference
        // them.
        let logs_ref = if ev.logs.is_empty() {
            None
        } else {
            let sink = self.sink.as_ref();
            let logs = &ev.logs;
            match retry(move || sink.put(id, logs)).await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(%id, error = %e, "log flush failed; finalizing without logs_ref");
                    None
                }
            }
        };

        let fin = Finalization {
            status: ev.outcome.status,
            finished_at: Utc::now(),
            result: ev.outcome.result.clone(),
            error_kind: ev.outcome.error.as_ref().map(|e| e.kind),
            error_message: ev.outcome.error.as_ref().map(|e| e.message.clone()),
            logs_ref,
            resource_usage: Some(ev.outcome.usage.clone()),
        };

        let records = self.records.as_ref();
        let fin_ref = &fin;
        let finalized = match retry(move || records.finalize(id, fin_ref)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%id, error = %e, "finalize failed beyond retry budget");
                return;
            }
        };

        match finalized {
            FinalizeOutcome::Finalized => {
                debug!(%id, status = %fin.status, "record finalized");

                // Exactly one completion event per terminal transition.
                let _ = self.progress.send(RawProgress {
                    execution_id: id,
                    kind: ProgressKind::State,
                    payload: json!({
                        "status": fin.status.as_str(),
                        "error_kind": fin.error_kind.map(|k| k.as_str()),
                        "error_message": fin.error_message,
                    }),
                });

                if context.as_ref().map(|c| c.sync).unwrap_or(false) {
                    self.fulfill_rendezvous(id).await;
                }
            }
            FinalizeOutcome::AlreadyTerminal(status) => {
                // Duplicate completion (re-run of the path): observe and
                // no-op. No second publish, no second rendezvous push.
                debug!(%id, %status, "record already terminal; completion is a no-op");
            }
        }

        self.cleanup(id).await;
    }

    /// Push the authoritative terminal record onto `result:{id}`.
    async fn fulfill_rendezvous(&self, id: ExecutionId) {
        let record = match self.records.get(id).await {
            Ok(Some(rec)) => rec,
            Ok(None) => {
                warn!(%id, "finalized record missing at rendezvous push");
                return;
            }
            Err(e) => {
                warn!(%id, error = %e, "record fetch for rendezvous failed");
                return;
            }
        };
        match serde_json::to_value(&record) {
            Ok(v) => {
                if let Err(e) = self
                    .store
                    .rpush(&result_key(id), v, self.rendezvous_ttl)
                    .await
                {
                    warn!(%id, error = %e, "rendezvous push failed");
                }
            }
            Err(e) => warn!(%id, error = %e, "record serialization failed"),
        }
    }

    /// Delete the per-execution ephemeral keys. Safe to re-run.
    async fn cleanup(&self, id: ExecutionId) {
        for key in [context_key(id), pending_key(id)] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(%id, key, error = %e, "ephemeral cleanup failed");
            }
        }
    }
}

/// Bounded retries with exponential backoff for transient collaborator
/// failures.
async fn retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < RETRY_ATTEMPTS => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                debug!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
