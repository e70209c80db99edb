//! The progress publisher.
//!
//! Takes raw progress off the pool/result-path channel, assigns the
//! per-execution monotonic `seq`, and publishes to `progress:{id}` plus the
//! per-tenant channel. Late subscribers receive no history; the `seq` lets
//! them detect the gap and fall back to the flushed log reference on the
//! record.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bf_ids::ExecutionId;
use bf_schemas::{
    progress_channel, tenant_progress_channel, EphemeralStore, ProgressEvent, ProgressKind,
    RawProgress, RecordStore,
};

pub struct ProgressPublisher {
    store: Arc<dyn EphemeralStore>,
    records: Arc<dyn RecordStore>,
    seqs: HashMap<ExecutionId, u64>,
    /// Tenant routing cache: `None` means the lookup failed and only the
    /// per-execution channel is served.
    tenants: HashMap<ExecutionId, Option<String>>,
}

impl ProgressPublisher {
    pub fn new(store: Arc<dyn EphemeralStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            records,
            seqs: HashMap::new(),
            tenants: HashMap::new(),
        }
    }

    /// Consume raw progress until the channel closes.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RawProgress>) {
        info!("progress publisher running");
        while let Some(raw) = rx.recv().await {
            self.publish(raw).await;
        }
        info!("progress publisher stopped");
    }

    /// Publish one event. Public for the scenario harness.
    pub async fn publish(&mut self, raw: RawProgress) {
        let id = raw.execution_id;
        let seq = {
            let counter = self.seqs.entry(id).or_insert(0);
            *counter += 1;
            *counter
        };

        let event = ProgressEvent {
            execution_id: id,
            kind: raw.kind,
            payload: raw.payload,
            seq,
        };
        let encoded = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                warn!(%id, error = %e, "progress event serialization failed");
                return;
            }
        };

        if let Err(e) = self.store.publish(&progress_channel(id), encoded.clone()).await {
            warn!(%id, error = %e, "per-execution progress publish failed");
        }

        if let Some(tenant) = self.tenant_for(id).await {
            let channel = tenant_progress_channel(&tenant);
            if let Err(e) = self.store.publish(&channel, encoded).await {
                warn!(%id, tenant, error = %e, "per-tenant progress publish failed");
            }
        }

        // A terminal state event is the last thing an execution publishes;
        // drop its routing state.
        if event.kind == ProgressKind::State && is_terminal_payload(&event.payload) {
            self.seqs.remove(&id);
            self.tenants.remove(&id);
        }
    }

    async fn tenant_for(&mut self, id: ExecutionId) -> Option<String> {
        if let Some(cached) = self.tenants.get(&id) {
            return cached.clone();
        }
        let looked_up = match self.records.get(id).await {
            Ok(Some(rec)) => Some(rec.tenant_id),
            Ok(None) => None,
            Err(e) => {
                debug!(%id, error = %e, "tenant lookup failed");
                None
            }
        };
        self.tenants.insert(id, looked_up.clone());
        looked_up
    }
}

fn is_terminal_payload(payload: &Value) -> bool {
    payload
        .get("status")
        .and_then(Value::as_str)
        .and_then(|s| bf_schemas::ExecutionStatus::parse(s).ok())
        .map(|s| s.is_terminal())
        .unwrap_or(false)
}
