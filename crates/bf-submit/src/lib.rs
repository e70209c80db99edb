//! bf-submit
//!
//! The submission API. `submit` validates and stages a request, pushes the
//! minimal hand-off message onto the durable queue, and returns the id in
//! constant time; `wait_for_result` blocks on the rendezvous list for
//! synchronous callers; `cancel` publishes on the cancel channel.
//!
//! The submitter never touches the pool: all coupling is through the queue
//! and the ephemeral store.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use bf_config::EngineConfig;
use bf_ids::ExecutionId;
use bf_resolver::TargetRegistry;
use bf_schemas::{
    pending_key, result_key, CallerIdentity, CancelRequest, DispatchMessage, DurableQueue,
    EphemeralStore, ExecutionKind, ExecutionRecord, ExecutionRequest, ExecutionStatus,
    RecordStore, CANCEL_CHANNEL,
};

// ---------------------------------------------------------------------------
// SubmitError
// ---------------------------------------------------------------------------

/// Submission-time failures, returned synchronously to the caller. No
/// record is created for any of these.
#[derive(Debug)]
pub enum SubmitError {
    InvalidRequest(String),
    TargetNotFound(String),
    QuotaExceeded { tenant_id: String, limit: usize },
    Unavailable(anyhow::Error),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            SubmitError::TargetNotFound(target) => write!(f, "target not found: {target:?}"),
            SubmitError::QuotaExceeded { tenant_id, limit } => write!(
                f,
                "tenant {tenant_id} exceeded concurrent-submission quota ({limit})"
            ),
            SubmitError::Unavailable(e) => write!(f, "collaborator unavailable: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Caller-facing submission input. The engine allocates the id.
#[derive(Clone, Debug)]
pub struct NewExecution {
    pub kind: ExecutionKind,
    pub target: String,
    pub parameters: Value,
    pub caller: CallerIdentity,
    pub config: Value,
    pub timeout_seconds: Option<u64>,
    pub sync: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
}

#[derive(Clone, Debug)]
pub enum WaitOutcome {
    /// Terminal record, either read directly from the record store or
    /// delivered through the rendezvous list.
    Ready(Box<ExecutionRecord>),
    /// The waiter's own deadline elapsed. The execution keeps running.
    TimedOut,
}

// ---------------------------------------------------------------------------
// Submitter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Submitter {
    store: Arc<dyn EphemeralStore>,
    queue: Arc<dyn DurableQueue>,
    records: Arc<dyn RecordStore>,
    registry: TargetRegistry,
    config: EngineConfig,
}

impl Submitter {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        queue: Arc<dyn DurableQueue>,
        records: Arc<dyn RecordStore>,
        registry: TargetRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            records,
            registry,
            config,
        }
    }

    /// Validate, stage, and enqueue a request. Constant-time: no waiting on
    /// the pool or the dispatcher.
    pub async fn submit(&self, new: NewExecution) -> Result<SubmitReceipt, SubmitError> {
        // Target must resolve, and its declared kind must match the request.
        let spec = self
            .registry
            .resolve(&new.target)
            .map_err(|e| SubmitError::TargetNotFound(e.target))?;
        if spec.kind != new.kind {
            return Err(SubmitError::InvalidRequest(format!(
                "target {} is declared as {}, request says {}",
                new.target, spec.kind, new.kind
            )));
        }

        // Timeout override: zero is meaningless, and nothing may exceed the
        // platform ceiling.
        if let Some(t) = new.timeout_seconds {
            if t == 0 {
                return Err(SubmitError::InvalidRequest(
                    "timeout_seconds must be > 0".into(),
                ));
            }
            if t > self.config.timeout_ceiling_seconds {
                return Err(SubmitError::InvalidRequest(format!(
                    "timeout_seconds {} exceeds platform ceiling {}",
                    t, self.config.timeout_ceiling_seconds
                )));
            }
        }

        // Parameters must conform to the target's declared schema. The
        // dispatcher coerces again before hand-off; failing early keeps
        // garbage out of the queue.
        if let Err(e) = spec.schema.coerce(&new.parameters) {
            return Err(SubmitError::InvalidRequest(e.to_string()));
        }

        // Per-tenant concurrent-submission quota.
        let active = self
            .records
            .count_active(&new.caller.tenant_id)
            .await
            .map_err(SubmitError::Unavailable)?;
        if active >= self.config.tenant_submission_quota as i64 {
            return Err(SubmitError::QuotaExceeded {
                tenant_id: new.caller.tenant_id.clone(),
                limit: self.config.tenant_submission_quota,
            });
        }

        let id = ExecutionId::generate();
        let request = ExecutionRequest {
            id,
            kind: new.kind,
            target: new.target,
            parameters: new.parameters,
            caller: new.caller,
            config: new.config,
            timeout_seconds: new.timeout_seconds,
            sync: new.sync,
            enqueued_at: Utc::now(),
            enqueued_at_monotonic_ms: monotonic_ms(),
        };

        let staged = serde_json::to_value(&request)
            .map_err(|e| SubmitError::Unavailable(anyhow::Error::new(e)))?;
        self.store
            .set(&pending_key(id), staged, self.config.pending_ttl())
            .await
            .map_err(SubmitError::Unavailable)?;

        let msg = DispatchMessage {
            id,
            kind: request.kind,
        };
        self.queue
            .publish(msg.encode())
            .await
            .map_err(SubmitError::Unavailable)?;

        info!(%id, target = %request.target, sync = request.sync, "execution submitted");
        Ok(SubmitReceipt {
            id,
            status: ExecutionStatus::Pending,
        })
    }

    /// Block until the execution reaches a terminal state or `timeout`
    /// elapses. The waiter's deadline is independent of the execution's:
    /// giving up here leaves the execution running.
    pub async fn wait_for_result(
        &self,
        id: ExecutionId,
        timeout: Duration,
    ) -> anyhow::Result<WaitOutcome> {
        let timeout = timeout.min(self.config.sync_wait_ceiling());

        // The record may already be terminal (waiter arrived late).
        if let Some(rec) = self.records.get(id).await? {
            if rec.status.is_terminal() {
                return Ok(WaitOutcome::Ready(Box::new(rec)));
            }
        }

        match self.store.blpop(&result_key(id), timeout).await? {
            Some(v) => {
                let rec: ExecutionRecord = serde_json::from_value(v)?;
                debug_assert!(rec.status.is_terminal(), "rendezvous carries terminal records");
                Ok(WaitOutcome::Ready(Box::new(rec)))
            }
            None => {
                debug!(%id, "wait_for_result timed out");
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    /// Publish a cancel request. Best-effort: acceptance does not guarantee
    /// the execution stops before completing; callers observe the outcome
    /// through the result path.
    pub async fn cancel(&self, id: ExecutionId, reason: Option<String>) -> anyhow::Result<()> {
        let req = CancelRequest {
            execution_id: id,
            reason,
        };
        self.store
            .publish(CANCEL_CHANNEL, serde_json::to_value(&req)?)
            .await?;
        info!(%id, "cancel published");
        Ok(())
    }
}

/// Milliseconds since the first call in this process. Monotonic.
fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}
