//! bf-schemas
//!
//! Shared data model for the execution engine: execution requests and
//! records, status/error taxonomies, the pool<->worker control protocol,
//! ephemeral key naming, and the narrow collaborator traits every other
//! crate is written against.
//!
//! This crate owns no behavior beyond validation of its own invariants;
//! all orchestration lives in the consumer crates.

pub mod keys;
pub mod model;
pub mod protocol;
pub mod status;
pub mod stores;

pub use keys::{
    context_key, pending_key, progress_channel, registration_key, result_key,
    tenant_progress_channel, CANCEL_CHANNEL,
};
pub use model::{
    CallerIdentity, CancelRequest, CompletionEvent, ContextRecord, ExecError,
    ExecutionOutcome, ExecutionRecord, ExecutionRequest, LogLine, ProcessInfo, ProgressEvent,
    ProgressKind, RawProgress, ResourceUsage, WorkerRegistration,
};
pub use protocol::{ControlMsg, WorkerMsg};
pub use status::{ErrorKind, ExecutionKind, ExecutionStatus};
pub use stores::{
    AckToken, DispatchMessage, DurableQueue, EphemeralStore, Finalization, FinalizeOutcome,
    LogSink, NewRunningRecord, QueueMessage, RecordStore, Subscription, UpsertOutcome,
};
