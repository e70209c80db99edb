//! bf-worker
//!
//! The long-lived worker: loads registered targets, runs one execution at a
//! time in isolation from the scheduler, streams logs and phase changes
//! back over the control channel, and emits exactly one terminal `Result`
//! per `Run`.
//!
//! The crate splits into the pure execution core ([`execute`]), reusable by
//! the in-process test workers, and the OS-process shell ([`run_worker`])
//! driven by stdin/stdout JSON lines and POSIX signals.

pub mod execute;
pub mod runloop;
pub mod store_client;
pub mod store_server;

pub use execute::{execute, ContextSource, StoreContextSource};
pub use runloop::{run_worker, WorkerEnv};
pub use store_client::SocketContextSource;
pub use store_server::serve_store;
