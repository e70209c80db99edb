//! bf-testkit
//!
//! Deterministic in-memory collaborators plus an end-to-end harness that
//! wires the real submitter, dispatcher, pool manager, result path, and
//! progress publisher together with task-backed workers. Scenario tests
//! run the whole engine in-process, no Postgres and no child processes.

pub mod harness;
pub mod memstores;
pub mod workers;

pub use harness::EngineHarness;
pub use memstores::{MemoryLogSink, MemoryQueue, MemoryRecordStore};
pub use workers::{TaskLauncher, CRASH_SENTINEL};
