//! End-to-end engine harness.
//!
//! Wires the real components (submitter, dispatcher, pool manager, result
//! path, progress publisher) over in-memory collaborators and task-backed
//! workers. Scenario tests drive it through the submitter exactly like a
//! production caller would.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use bf_config::EngineConfig;
use bf_dispatch::Dispatcher;
use bf_ephemeral::{spawn_sweeper, MemoryStore};
use bf_ids::ExecutionId;
use bf_pool::{PoolConfig, PoolHandle, PoolManager};
use bf_resolver::{register_builtins, ParamSchema, TargetRegistry};
use bf_results::{ProgressPublisher, ResultPath};
use bf_schemas::{
    CallerIdentity, DurableQueue, EphemeralStore, ExecutionKind, ExecutionRecord, LogSink,
    RecordStore,
};
use bf_submit::{NewExecution, Submitter};

use crate::memstores::{MemoryLogSink, MemoryQueue, MemoryRecordStore};
use crate::workers::{TaskLauncher, CRASH_SENTINEL};

pub struct EngineHarness {
    pub config: EngineConfig,
    pub store: MemoryStore,
    pub queue: Arc<MemoryQueue>,
    pub records: Arc<MemoryRecordStore>,
    pub sink: Arc<MemoryLogSink>,
    pub registry: TargetRegistry,
    pub submitter: Submitter,
    pub pool: PoolHandle,
}

impl EngineHarness {
    /// Engine config tuned for fast tests: quick queue polling, short
    /// visibility, small quotas untouched.
    pub fn test_config() -> EngineConfig {
        EngineConfig {
            queue_poll_interval_ms: 20,
            queue_visibility_timeout_seconds: 5,
            ..EngineConfig::default()
        }
    }

    /// Pool config tuned for fast tests: one-slot floor, tight timer, and
    /// sub-second grace.
    pub fn test_pool_config() -> PoolConfig {
        PoolConfig {
            min_workers: 1,
            max_workers: 2,
            default_timeout: Duration::from_secs(30),
            graceful_shutdown: Duration::from_millis(500),
            recycle_after_executions: 0,
            heartbeat_interval: Duration::from_millis(200),
            registration_ttl: Duration::from_secs(2),
            scale_up_busy_ratio: 0.8,
            scale_down_cooldown: Duration::from_millis(400),
            timer_tick: Duration::from_millis(20),
        }
    }

    pub async fn start(engine: EngineConfig, pool_cfg: PoolConfig) -> Self {
        let store = MemoryStore::new();
        spawn_sweeper(store.clone(), Duration::from_millis(100));
        let store_dyn: Arc<dyn EphemeralStore> = Arc::new(store.clone());

        let queue = Arc::new(MemoryQueue::new(engine.queue_visibility_timeout()));
        let queue_dyn: Arc<dyn DurableQueue> = queue.clone();
        let records = Arc::new(MemoryRecordStore::new());
        let records_dyn: Arc<dyn RecordStore> = records.clone();
        let sink = Arc::new(MemoryLogSink::new());
        let sink_dyn: Arc<dyn LogSink> = sink.clone();

        let registry = TargetRegistry::new();
        register_builtins(&registry);
        // The crash sentinel resolves like any target; the task worker dies
        // before ever invoking the callable.
        registry.register(
            CRASH_SENTINEL,
            ExecutionKind::Tool,
            30,
            ParamSchema::new().allow_unknown(),
            Arc::new(|_params, _ctx| {
                Box::pin(std::future::pending::<anyhow::Result<serde_json::Value>>())
            }),
        );

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let launcher = Arc::new(TaskLauncher::new(
            registry.clone(),
            store_dyn.clone(),
            pool_cfg.graceful_shutdown,
        ));
        let pool = PoolManager::start(
            pool_cfg,
            launcher,
            store_dyn.clone(),
            completions_tx.clone(),
            progress_tx.clone(),
        );

        let result_path = ResultPath::new(
            records_dyn.clone(),
            store_dyn.clone(),
            sink_dyn,
            progress_tx,
            engine.sync_wait_ceiling(),
        );
        tokio::spawn(result_path.run(completions_rx));

        let publisher = ProgressPublisher::new(store_dyn.clone(), records_dyn.clone());
        tokio::spawn(publisher.run(progress_rx));

        let dispatcher = Dispatcher::new(
            queue_dyn.clone(),
            store_dyn.clone(),
            records_dyn.clone(),
            registry.clone(),
            pool.clone(),
            completions_tx,
            engine.clone(),
        );
        tokio::spawn(dispatcher.run());

        let submitter = Submitter::new(
            store_dyn,
            queue_dyn,
            records_dyn,
            registry.clone(),
            engine.clone(),
        );

        Self {
            config: engine,
            store,
            queue,
            records,
            sink,
            registry,
            submitter,
            pool,
        }
    }

    /// Harness with the standard test tuning.
    pub async fn start_default() -> Self {
        Self::start(Self::test_config(), Self::test_pool_config()).await
    }

    pub fn caller() -> CallerIdentity {
        CallerIdentity {
            tenant_id: "tenant-a".into(),
            user_id: "user-1".into(),
            org_id: "org-1".into(),
        }
    }

    /// A tool request with sane defaults; tests override fields as needed.
    pub fn request(target: &str, parameters: serde_json::Value) -> NewExecution {
        NewExecution {
            kind: ExecutionKind::Tool,
            target: target.into(),
            parameters,
            caller: Self::caller(),
            config: serde_json::json!({}),
            timeout_seconds: None,
            sync: false,
        }
    }

    /// Poll the record store until the execution is terminal.
    ///
    /// Panics after `deadline`, which makes scenario failures loud instead
    /// of hanging the suite.
    pub async fn await_terminal(&self, id: ExecutionId, deadline: Duration) -> ExecutionRecord {
        let end = Instant::now() + deadline;
        loop {
            if let Some(rec) = self.records.get(id).await.expect("record store") {
                if rec.status.is_terminal() {
                    return rec;
                }
            }
            assert!(
                Instant::now() < end,
                "execution {id} did not reach a terminal state within {deadline:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
