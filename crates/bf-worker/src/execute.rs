//! The execution core: fetch context, invoke the target, map the outcome.
//!
//! Used verbatim by the OS worker binary and by the in-process task workers
//! in the test harness, so outcome mapping can never drift between the two.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use bf_ids::ExecutionId;
use bf_resolver::{ExecutionContext, TargetRegistry, UserEvent};
use bf_schemas::{
    context_key, ContextRecord, EphemeralStore, ErrorKind, ExecutionOutcome, ExecutionStatus,
    ResourceUsage, WorkerMsg,
};

// ---------------------------------------------------------------------------
// ContextSource
// ---------------------------------------------------------------------------

/// Where a worker reads `exec:{id}:context` from. In-process workers hold
/// the shared store directly; spawned workers go through the Unix-socket
/// client.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn fetch(&self, id: ExecutionId) -> Result<Option<ContextRecord>>;
}

/// Direct handle on the ephemeral store.
pub struct StoreContextSource {
    store: Arc<dyn EphemeralStore>,
}

impl StoreContextSource {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContextSource for StoreContextSource {
    async fn fetch(&self, id: ExecutionId) -> Result<Option<ContextRecord>> {
        let raw = self.store.get(&context_key(id)).await?;
        raw.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// execute
// ---------------------------------------------------------------------------

/// Run one execution to its terminal outcome, emitting progress through
/// `emit` along the way. Never panics outward; user-code panics and errors
/// are folded into the outcome.
///
/// The caller (the Run loop) is responsible for sending the final
/// `WorkerMsg::Result`, which keeps the one-result-per-Run guarantee in a
/// single place.
pub async fn execute(
    registry: &TargetRegistry,
    source: &dyn ContextSource,
    id: ExecutionId,
    emit: &(dyn Fn(WorkerMsg) + Send + Sync),
) -> ExecutionOutcome {
    let started = tokio::time::Instant::now();

    let ctx_record = match source.fetch(id).await {
        Ok(Some(rec)) => rec,
        Ok(None) => {
            warn!(%id, "execution context missing or expired");
            return ExecutionOutcome::failure(
                ExecutionStatus::Failed,
                ErrorKind::Unavailable,
                "execution context missing or expired".into(),
                usage(started, &[]),
            );
        }
        Err(e) => {
            return ExecutionOutcome::failure(
                ExecutionStatus::Failed,
                ErrorKind::Unavailable,
                format!("context fetch failed: {e}"),
                usage(started, &[]),
            );
        }
    };

    let spec = match registry.resolve(&ctx_record.target) {
        Ok(spec) => spec,
        Err(e) => {
            return ExecutionOutcome::failure(
                ExecutionStatus::Failed,
                ErrorKind::TargetNotFound,
                e.to_string(),
                usage(started, &[]),
            );
        }
    };

    // Fresh per-execution context; dropping it at the end of this function
    // clears all per-execution state unconditionally.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<UserEvent>();
    let ctx = ExecutionContext::new(id, ctx_record.caller.clone(), ctx_record.config.clone(), events_tx);

    let invocation = AssertUnwindSafe((spec.callable)(ctx_record.parameters.clone(), ctx.clone()))
        .catch_unwind();

    let result = {
        // Forward user events as they happen so subscribers see live
        // progress. The channel cannot close while `ctx` is alive, so this
        // future only ends by being dropped when the invocation completes.
        let forwarder = async {
            while let Some(ev) = events_rx.recv().await {
                emit(user_event_msg(id, ev));
            }
        };
        tokio::pin!(forwarder);

        tokio::select! {
            biased;
            res = invocation => res,
            _ = &mut forwarder => unreachable!("event channel outlives the callable"),
        }
    };

    // Drain events the callable queued right before completing, preserving
    // their order ahead of the terminal result.
    while let Ok(ev) = events_rx.try_recv() {
        emit(user_event_msg(id, ev));
    }

    let integrations = ctx.integrations_invoked();
    match result {
        Ok(Ok(value)) => {
            if is_soft_failure(&value) {
                let msg = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("target reported failure")
                    .to_string();
                ExecutionOutcome::completed_with_errors(msg, usage(started, &integrations))
            } else {
                ExecutionOutcome::success(value, usage(started, &integrations))
            }
        }
        Ok(Err(e)) => {
            debug!(%id, error = %e, "target returned an error");
            ExecutionOutcome::failure(
                ExecutionStatus::Failed,
                ErrorKind::UserError,
                e.to_string(),
                usage(started, &integrations),
            )
        }
        Err(panic) => {
            let msg = panic_message(panic);
            warn!(%id, panic = %msg, "target panicked");
            ExecutionOutcome::failure(
                ExecutionStatus::Failed,
                ErrorKind::UserError,
                format!("target panicked: {msg}"),
                usage(started, &integrations),
            )
        }
    }
}

/// The `{success: false, ...}` sentinel from the target contract.
fn is_soft_failure(value: &Value) -> bool {
    value.get("success").and_then(Value::as_bool) == Some(false)
}

fn user_event_msg(id: ExecutionId, ev: UserEvent) -> WorkerMsg {
    match ev {
        UserEvent::Log { level, message } => WorkerMsg::Log { id, level, message },
        UserEvent::Phase { name } => WorkerMsg::StateChange { id, phase: name },
        UserEvent::Variable { name, snapshot } => WorkerMsg::Variable {
            id,
            name,
            snapshot: Value::String(snapshot),
        },
    }
}

fn usage(started: tokio::time::Instant, integrations: &[String]) -> ResourceUsage {
    ResourceUsage {
        duration_ms: started.elapsed().as_millis() as u64,
        peak_memory_bytes: None,
        integrations_invoked: integrations.to_vec(),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
