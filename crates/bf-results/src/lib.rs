//! bf-results
//!
//! The tail of every execution: the result path persists terminal
//! outcomes, flushes logs, fulfills synchronous waiters, and cleans up
//! ephemeral state; the progress publisher fans worker/pool events out to
//! per-execution and per-tenant pub/sub channels with a monotonic `seq`.

pub mod path;
pub mod progress;

pub use path::ResultPath;
pub use progress::ProgressPublisher;
