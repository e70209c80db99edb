//! bf-dispatch
//!
//! The single-flight queue consumer: materializes the execution record as
//! RUNNING, resolves and coerces against the target's declared schema,
//! writes the worker-facing context, and hands off to the pool. Every step
//! is idempotent against duplicate delivery; a message is acknowledged only
//! once its execution is RUNNING in the pool or provably dead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bf_config::EngineConfig;
use bf_pool::{DispatchDecision, PoolHandle};
use bf_resolver::TargetRegistry;
use bf_schemas::{
    context_key, pending_key, CompletionEvent, ContextRecord, DispatchMessage, DurableQueue,
    EphemeralStore, ErrorKind, ExecutionOutcome, ExecutionRequest, ExecutionStatus,
    NewRunningRecord, QueueMessage, RecordStore, ResourceUsage, UpsertOutcome,
};

/// Extra context-key lifetime beyond timeout + grace, covering result-path
/// scheduling slack.
const CONTEXT_TTL_SLACK: Duration = Duration::from_secs(30);

/// Pause before re-publishing a hand-off the pool refused.
const SATURATION_BACKOFF: Duration = Duration::from_millis(500);

pub struct Dispatcher {
    queue: Arc<dyn DurableQueue>,
    store: Arc<dyn EphemeralStore>,
    records: Arc<dyn RecordStore>,
    registry: TargetRegistry,
    pool: PoolHandle,
    /// Dispatch-time failures (bad params, vanished target) complete
    /// through the same result path as worker outcomes.
    completions: mpsc::UnboundedSender<CompletionEvent>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        store: Arc<dyn EphemeralStore>,
        records: Arc<dyn RecordStore>,
        registry: TargetRegistry,
        pool: PoolHandle,
        completions: mpsc::UnboundedSender<CompletionEvent>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            store,
            records,
            registry,
            pool,
            completions,
            config,
        }
    }

    /// Consume until the task is dropped. One consumer per deployment.
    pub async fn run(self) {
        info!("dispatcher running");
        loop {
            match self.queue.consume().await {
                Ok(Some(msg)) => {
                    if let Err(e) = self.handle_message(msg).await {
                        // Leave the message unacked: the visibility timeout
                        // redelivers it once the collaborator recovers.
                        warn!(error = %e, "dispatch failed; message left for redelivery");
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(self.config.queue_poll_interval()).await;
                }
                Err(e) => {
                    warn!(error = %e, "queue consume failed");
                    tokio::time::sleep(self.config.queue_poll_interval()).await;
                }
            }
        }
    }

    /// Process one queue message to the point where acking is correct.
    pub async fn handle_message(&self, msg: QueueMessage) -> Result<()> {
        let handoff = match DispatchMessage::decode(&msg.payload) {
            Ok(h) => h,
            Err(e) => {
                // Garbage on the queue is dropped, not retried forever.
                warn!(error = %e, "malformed queue message dropped");
                return self.queue.ack(msg.token).await;
            }
        };
        let id = handoff.id;

        // 1. The staged request. Missing means the TTL expired or this is a
        //    duplicate whose first delivery already cleaned up.
        let request: ExecutionRequest = match self.store.get(&pending_key(id)).await? {
            Some(v) => serde_json::from_value(v)
                .with_context(|| format!("staged request for {id} is corrupt"))?,
            None => {
                debug!(%id, "staged request missing or expired; dropping message");
                return self.queue.ack(msg.token).await;
            }
        };

        // 2. Idempotent RUNNING upsert. A terminal prior status means this
        //    is a duplicate delivery of a finished execution.
        let upsert = self
            .records
            .upsert_running(&NewRunningRecord {
                id,
                kind: request.kind,
                target_id: request.target.clone(),
                tenant_id: request.caller.tenant_id.clone(),
                user_id: request.caller.user_id.clone(),
                started_at: Utc::now(),
            })
            .await?;
        match upsert {
            UpsertOutcome::AlreadyTerminal(status) => {
                debug!(%id, %status, "duplicate delivery of a terminal execution; dropping");
                return self.queue.ack(msg.token).await;
            }
            UpsertOutcome::AlreadyRunning => {
                // Either a duplicate of an in-flight execution, or a
                // redelivery after a dispatcher death between upsert and
                // pool accept. The pool knows which: this consumer is
                // single-flight, so a live execution is already visible in
                // a slot by the time a duplicate gets here.
                let status = self.pool.status().await?;
                let live = status
                    .processes
                    .iter()
                    .any(|p| p.current_execution_id == Some(id));
                if live {
                    debug!(%id, "duplicate delivery of a live execution; dropping");
                    return self.queue.ack(msg.token).await;
                }
                debug!(%id, "RUNNING record with no live slot; re-dispatching");
            }
            UpsertOutcome::Inserted => {}
        }

        // 3. Resolve and coerce. Failures here are terminal records, not
        //    retries: the id must stay observable.
        let spec = match self.registry.resolve(&request.target) {
            Ok(spec) => spec,
            Err(e) => {
                self.stage_failure_context(&request).await;
                self.fail_execution(id, ErrorKind::TargetNotFound, e.to_string());
                return self.queue.ack(msg.token).await;
            }
        };
        let coerced: Value = match spec.schema.coerce(&request.parameters) {
            Ok(v) => v,
            Err(e) => {
                self.stage_failure_context(&request).await;
                self.fail_execution(id, ErrorKind::InvalidParams, e.to_string());
                return self.queue.ack(msg.token).await;
            }
        };

        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(spec.declared_timeout_seconds)
            .min(self.config.timeout_ceiling_seconds);
        let timeout = Duration::from_secs(timeout_seconds);

        // 4. Worker-facing context, alive for the whole execution window.
        let context = ContextRecord {
            id,
            kind: request.kind,
            target: request.target.clone(),
            parameters: coerced,
            caller: request.caller.clone(),
            config: request.config.clone(),
            timeout_seconds,
            sync: request.sync,
        };
        let context_ttl = timeout + self.config.graceful_shutdown() + CONTEXT_TTL_SLACK;
        self.store
            .set(
                &context_key(id),
                serde_json::to_value(&context).context("context serialization failed")?,
                context_ttl,
            )
            .await?;

        // 5. Hand off to the pool.
        match self.pool.dispatch(id, request.kind, timeout).await? {
            DispatchDecision::Accepted => {
                debug!(%id, target = %request.target, "handed off to pool");
                self.queue.ack(msg.token).await
            }
            DispatchDecision::Saturated => {
                // 6. Re-queue with backoff; POOL_SATURATED never surfaces to
                //    callers or the record.
                debug!(%id, "pool saturated; re-queueing");
                tokio::time::sleep(SATURATION_BACKOFF).await;
                self.queue.publish(msg.payload.clone()).await?;
                self.queue.ack(msg.token).await
            }
        }
    }

    /// Stage a short-lived context for an execution that failed before the
    /// normal context write, so the result path can still see the `sync`
    /// flag and fulfill the submitter's rendezvous.
    async fn stage_failure_context(&self, request: &ExecutionRequest) {
        let context = ContextRecord {
            id: request.id,
            kind: request.kind,
            target: request.target.clone(),
            parameters: request.parameters.clone(),
            caller: request.caller.clone(),
            config: request.config.clone(),
            timeout_seconds: 0,
            sync: request.sync,
        };
        if let Ok(v) = serde_json::to_value(&context) {
            let _ = self
                .store
                .set(&context_key(request.id), v, Duration::from_secs(60))
                .await;
        }
    }

    /// Terminal FAILED record for a dispatch-time error, routed through the
    /// result path so completion publication and rendezvous behavior stay
    /// uniform.
    fn fail_execution(&self, id: bf_ids::ExecutionId, kind: ErrorKind, message: String) {
        info!(%id, kind = %kind, %message, "dispatch-time failure");
        let outcome = ExecutionOutcome::failure(
            ExecutionStatus::Failed,
            kind,
            message,
            ResourceUsage::default(),
        );
        if self
            .completions
            .send(CompletionEvent {
                execution_id: id,
                outcome,
                logs: Vec::new(),
            })
            .is_err()
        {
            warn!(%id, "result path gone; dispatch failure unrecorded");
        }
    }
}
