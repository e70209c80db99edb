//! bf-daemon
//!
//! The composition root: connects Postgres, brings up the in-process
//! ephemeral store and its worker-facing socket, and wires submitter,
//! dispatcher, pool manager, result path, and progress publisher into one
//! running engine. The binary in `main.rs` is a thin shell around
//! [`Engine::start`]; embedders (an API layer, an ops tool) use the same
//! entry point and get the [`Engine::submitter`] surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use bf_config::EngineConfig;
use bf_db::{PgLogSink, PgQueue, PgRecordStore};
use bf_dispatch::Dispatcher;
use bf_ephemeral::{spawn_sweeper, MemoryStore};
use bf_pool::{PoolConfig, PoolHandle, PoolManager, ProcessLauncher};
use bf_resolver::{register_builtins, TargetRegistry};
use bf_results::{ProgressPublisher, ResultPath};
use bf_schemas::{DurableQueue, EphemeralStore, LogSink, RecordStore};
use bf_submit::Submitter;
use bf_worker::serve_store;

/// Deployment-level wiring choices that are not engine tunables.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Path to the worker binary the pool spawns.
    pub worker_bin: PathBuf,
    /// Unix socket the workers use to fetch execution context.
    pub store_socket: PathBuf,
}

impl EngineOptions {
    /// Defaults: a `bf-worker` sitting next to the current executable, and
    /// a socket under the system temp directory.
    pub fn discover() -> Result<Self> {
        let worker_bin = std::env::current_exe()
            .context("cannot locate current executable")?
            .with_file_name("bf-worker");
        let store_socket = std::env::temp_dir().join(format!("bifrost-store-{}.sock", std::process::id()));
        Ok(Self {
            worker_bin,
            store_socket,
        })
    }
}

/// A running engine instance.
pub struct Engine {
    pub config: EngineConfig,
    pub store: MemoryStore,
    pub registry: TargetRegistry,
    pub submitter: Submitter,
    pub pool: PoolHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Bring the whole engine up. Returns once every component is running.
    pub async fn start(config: EngineConfig, options: EngineOptions) -> Result<Engine> {
        config.validate()?;

        let db = bf_db::connect_from_env().await?;
        bf_db::migrate(&db).await?;
        info!("database connected and migrated");

        let store = MemoryStore::new();
        spawn_sweeper(store.clone(), std::time::Duration::from_secs(1));
        let store_dyn: Arc<dyn EphemeralStore> = Arc::new(store.clone());
        serve_store(store_dyn.clone(), &options.store_socket).await?;

        let queue: Arc<dyn DurableQueue> = Arc::new(PgQueue::new(
            db.clone(),
            format!("dispatcher-{}", std::process::id()),
            config.queue_visibility_timeout(),
        ));
        let records: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(db.clone()));
        let sink: Arc<dyn LogSink> = Arc::new(PgLogSink::new(db));

        // Targets: the built-ins plus whatever the embedder registers on
        // the returned handle before traffic arrives.
        let registry = TargetRegistry::new();
        register_builtins(&registry);

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let launcher = ProcessLauncher::new(options.worker_bin.display().to_string())
            .env("BF_GRACE_SECONDS", config.graceful_shutdown_seconds.to_string())
            .env("BF_STORE_SOCKET", options.store_socket.display().to_string());
        let pool = PoolManager::start(
            PoolConfig::from_engine(&config),
            Arc::new(launcher),
            store_dyn.clone(),
            completions_tx.clone(),
            progress_tx.clone(),
        );

        let mut tasks = Vec::new();

        let result_path = ResultPath::new(
            records.clone(),
            store_dyn.clone(),
            sink,
            progress_tx,
            config.sync_wait_ceiling(),
        );
        tasks.push(tokio::spawn(result_path.run(completions_rx)));

        let publisher = ProgressPublisher::new(store_dyn.clone(), records.clone());
        tasks.push(tokio::spawn(publisher.run(progress_rx)));

        let dispatcher = Dispatcher::new(
            queue.clone(),
            store_dyn.clone(),
            records.clone(),
            registry.clone(),
            pool.clone(),
            completions_tx,
            config.clone(),
        );
        tasks.push(tokio::spawn(dispatcher.run()));

        let submitter = Submitter::new(
            store_dyn,
            queue,
            records,
            registry.clone(),
            config.clone(),
        );

        info!("engine running");
        Ok(Engine {
            config,
            store,
            registry,
            submitter,
            pool,
            tasks,
        })
    }

    /// Ordered shutdown: stop consuming, drain the pool, stop the tails.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        if let Err(e) = self.pool.shutdown().await {
            tracing::warn!(error = %e, "pool shutdown failed");
        }
        for task in self.tasks {
            task.abort();
        }
    }
}
