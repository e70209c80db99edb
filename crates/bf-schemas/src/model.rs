//! Execution request/record types and the event payloads that move between
//! subsystems. Everything here is serde round-trippable: requests live in
//! the ephemeral store, records in Postgres, events on pub/sub channels.

use bf_ids::{ExecutionId, PoolId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{ErrorKind, ExecutionKind, ExecutionStatus};

// ---------------------------------------------------------------------------
// CallerIdentity
// ---------------------------------------------------------------------------

/// Who asked for the execution. Opaque to the scheduler; threaded through to
/// user code via the execution context and used for per-tenant quotas and
/// progress channels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub tenant_id: String,
    pub user_id: String,
    pub org_id: String,
}

// ---------------------------------------------------------------------------
// ExecutionRequest
// ---------------------------------------------------------------------------

/// Staged request, stored under `pending:{id}` with a short TTL until the
/// dispatcher picks it up. The submitter owns it until it is staged; after
/// that the scheduler is the sole mutator of the execution's state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
    /// Opaque reference resolvable by the executable resolver.
    pub target: String,
    pub parameters: Value,
    pub caller: CallerIdentity,
    /// Integration credentials and environment; opaque to the scheduler.
    pub config: Value,
    /// Optional override of the target's declared timeout.
    pub timeout_seconds: Option<u64>,
    /// When true the submitter blocks on the rendezvous list `result:{id}`.
    pub sync: bool,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic submission timestamp, milliseconds since process start.
    pub enqueued_at_monotonic_ms: u64,
}

// ---------------------------------------------------------------------------
// ContextRecord
// ---------------------------------------------------------------------------

/// Worker-facing execution context, written by the dispatcher to
/// `exec:{id}:context` (TTL = timeout + grace), read by the worker, deleted
/// by the result path. Parameters are already coerced against the target's
/// declared schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
    pub target: String,
    pub parameters: Value,
    pub caller: CallerIdentity,
    pub config: Value,
    pub timeout_seconds: u64,
    pub sync: bool,
}

// ---------------------------------------------------------------------------
// ResourceUsage
// ---------------------------------------------------------------------------

/// Resource accounting gathered by the worker and completed by the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: u64,
    pub peak_memory_bytes: Option<u64>,
    pub integrations_invoked: Vec<String>,
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// The durable execution record. Terminal states carry either `result` or
/// the `(error_kind, error_message)` pair, never both.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
    pub target_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub logs_ref: Option<String>,
    pub resource_usage: Option<ResourceUsage>,
}

// ---------------------------------------------------------------------------
// ExecutionOutcome
// ---------------------------------------------------------------------------

/// A structured engine error carried inside an outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal outcome of one execution, produced exactly once per Run by the
/// worker (normal completion) or the pool manager (synthetic timeout /
/// cancel / crash results).
///
/// Invariant: `result` and `error` are mutually exclusive, enforced by the
/// constructors. `status` is always terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<ExecError>,
    pub usage: ResourceUsage,
}

impl ExecutionOutcome {
    pub fn success(result: Value, usage: ResourceUsage) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result: Some(result),
            error: None,
            usage,
        }
    }

    /// User code returned a `{success: false, ...}` sentinel: the execution
    /// completed, but signalled failure through its own contract.
    pub fn completed_with_errors(message: String, usage: ResourceUsage) -> Self {
        Self {
            status: ExecutionStatus::CompletedWithErrors,
            result: None,
            error: Some(ExecError {
                kind: ErrorKind::UserError,
                message,
            }),
            usage,
        }
    }

    pub fn failure(
        status: ExecutionStatus,
        kind: ErrorKind,
        message: String,
        usage: ResourceUsage,
    ) -> Self {
        debug_assert!(status.is_terminal(), "outcome status must be terminal");
        Self {
            status,
            result: None,
            error: Some(ExecError { kind, message }),
            usage,
        }
    }

    pub fn timeout(message: String, usage: ResourceUsage) -> Self {
        Self::failure(ExecutionStatus::Timeout, ErrorKind::Timeout, message, usage)
    }

    pub fn cancelled(message: String, usage: ResourceUsage) -> Self {
        Self::failure(
            ExecutionStatus::Cancelled,
            ErrorKind::Cancelled,
            message,
            usage,
        )
    }

    pub fn worker_crashed(message: String, usage: ResourceUsage) -> Self {
        Self::failure(
            ExecutionStatus::Failed,
            ErrorKind::WorkerCrashed,
            message,
            usage,
        )
    }
}

// ---------------------------------------------------------------------------
// CancelRequest
// ---------------------------------------------------------------------------

/// Pub/sub message on the well-known cancel channel. Anyone with submitter
/// authority may publish; the pool manager subscribes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelRequest {
    pub execution_id: ExecutionId,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Log,
    State,
    Variable,
    Phase,
}

/// Event streamed to subscribers of `progress:{id}` / the per-tenant
/// channel. `seq` is monotonic per execution so late subscribers can detect
/// gaps; history is never replayed (completeness requires the flushed log
/// reference on the record).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub execution_id: ExecutionId,
    pub kind: ProgressKind,
    pub payload: Value,
    pub seq: u64,
}

/// Progress as it leaves the pool manager, before the publisher assigns the
/// per-execution sequence number.
#[derive(Clone, Debug)]
pub struct RawProgress {
    pub execution_id: ExecutionId,
    pub kind: ProgressKind,
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// CompletionEvent
// ---------------------------------------------------------------------------

/// Hand-off from the pool manager to the result path: the terminal outcome
/// plus the log lines buffered during the run.
#[derive(Clone, Debug)]
pub struct CompletionEvent {
    pub execution_id: ExecutionId,
    pub outcome: ExecutionOutcome,
    pub logs: Vec<LogLine>,
}

// ---------------------------------------------------------------------------
// Log lines
// ---------------------------------------------------------------------------

/// One buffered log line from user code, flushed to the log sink by the
/// result path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// WorkerRegistration
// ---------------------------------------------------------------------------

/// Per-process slot snapshot carried inside the heartbeat registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_id: u64,
    pub pid: Option<u32>,
    /// "IDLE" | "BUSY" | "KILLED"
    pub state: String,
    pub current_execution_id: Option<ExecutionId>,
    pub executions_completed: u64,
    pub memory_bytes: Option<u64>,
    pub uptime_seconds: u64,
}

/// Heartbeat payload refreshed under `pool:{pool_id}` with a TTL. Consumers
/// treat absence of the key as pool-gone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: PoolId,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub pool_size: usize,
    pub idle_count: usize,
    pub busy_count: usize,
    pub last_heartbeat: DateTime<Utc>,
    pub processes: Vec<ProcessInfo>,
}
