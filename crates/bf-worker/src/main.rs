//! bf-worker entry point.
//!
//! Spawned by the pool manager with piped stdio: stdout carries the typed
//! control protocol, so tracing goes to stderr. Everything else lives in
//! the library; this file is wiring only.

use std::sync::Arc;

use bf_resolver::{register_builtins, TargetRegistry};
use bf_worker::runloop::register_process_builtins;
use bf_worker::{run_worker, SocketContextSource, WorkerEnv};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let env = WorkerEnv::from_env()?;

    let registry = TargetRegistry::new();
    register_builtins(&registry);
    register_process_builtins(&registry);

    let source = Arc::new(SocketContextSource::new(env.store_socket.clone()));
    run_worker(env, registry, source).await
}

fn init_tracing() {
    // stdout is the control channel; logs must not touch it.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
