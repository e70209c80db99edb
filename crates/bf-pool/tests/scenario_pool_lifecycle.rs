//! Pool-manager lifecycle against scripted workers: placement and
//! saturation, timeout escalation, cancellation, and synthetic results.
//! Workers here are hand-written fakes so each behavior is exact; the full
//! engine paths are covered by the cross-crate harness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use bf_ephemeral::MemoryStore;
use bf_ids::ExecutionId;
use bf_pool::{
    DispatchDecision, PoolConfig, PoolManager, SlotEvent, SlotId, WorkerEvent, WorkerLauncher,
    WorkerProcess,
};
use bf_schemas::{
    CancelRequest, CompletionEvent, ControlMsg, EphemeralStore, ErrorKind, ExecutionKind,
    ExecutionOutcome, ExecutionStatus, RawProgress, ResourceUsage, WorkerMsg, CANCEL_CHANNEL,
};

// ---------------------------------------------------------------------------
// Scripted workers
// ---------------------------------------------------------------------------

/// How a fake worker responds to `Run`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Script {
    /// Reply instantly with a successful result.
    Instant,
    /// Never reply; ignore graceful termination; die only on SIGKILL.
    Wedged,
}

struct FakeWorker {
    control: mpsc::UnboundedSender<ControlMsg>,
    dead: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SlotEvent>,
    slot_id: SlotId,
}

impl WorkerProcess for FakeWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.slot_id as u32)
    }

    fn control(&self) -> &mpsc::UnboundedSender<ControlMsg> {
        &self.control
    }

    fn signal_terminate(&self) {
        // Wedged on purpose: ignores SIGTERM.
    }

    fn signal_kill(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SlotEvent {
                slot_id: self.slot_id,
                event: WorkerEvent::Exited { code: None },
            });
        }
    }
}

struct ScriptedLauncher {
    script: Script,
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn spawn(
        &self,
        slot_id: SlotId,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMsg>();
        let dead = Arc::new(AtomicBool::new(false));
        let script = self.script;

        {
            let events = events.clone();
            let dead = dead.clone();
            tokio::spawn(async move {
                while let Some(msg) = control_rx.recv().await {
                    if dead.load(Ordering::SeqCst) {
                        break;
                    }
                    match (script, msg) {
                        (Script::Instant, ControlMsg::Run { id }) => {
                            let _ = events.send(SlotEvent {
                                slot_id,
                                event: WorkerEvent::Msg(WorkerMsg::Result {
                                    id,
                                    outcome: ExecutionOutcome::success(
                                        serde_json::json!("done"),
                                        ResourceUsage::default(),
                                    ),
                                }),
                            });
                        }
                        (Script::Instant, ControlMsg::Terminate) => {
                            if !dead.swap(true, Ordering::SeqCst) {
                                let _ = events.send(SlotEvent {
                                    slot_id,
                                    event: WorkerEvent::Exited { code: Some(0) },
                                });
                            }
                            break;
                        }
                        (Script::Wedged, _) => {}
                    }
                }
            });
        }

        Ok(Box::new(FakeWorker {
            control: control_tx,
            dead,
            events,
            slot_id,
        }))
    }
}

fn fast_pool(max_workers: usize) -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers,
        default_timeout: Duration::from_secs(30),
        graceful_shutdown: Duration::from_millis(100),
        recycle_after_executions: 0,
        heartbeat_interval: Duration::from_millis(200),
        registration_ttl: Duration::from_secs(2),
        scale_up_busy_ratio: 0.8,
        scale_down_cooldown: Duration::from_secs(30),
        timer_tick: Duration::from_millis(10),
    }
}

struct PoolFixture {
    pool: bf_pool::PoolHandle,
    completions: mpsc::UnboundedReceiver<CompletionEvent>,
    store: MemoryStore,
    _progress: mpsc::UnboundedReceiver<RawProgress>,
}

async fn start_pool(script: Script, max_workers: usize) -> PoolFixture {
    let store = MemoryStore::new();
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let (progress_tx, progress) = mpsc::unbounded_channel();
    let pool = PoolManager::start(
        fast_pool(max_workers),
        Arc::new(ScriptedLauncher { script }),
        Arc::new(store.clone()),
        completions_tx,
        progress_tx,
    );
    // Let the initial spawn settle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    PoolFixture {
        pool,
        completions,
        store,
        _progress: progress,
    }
}

async fn next_completion(
    rx: &mut mpsc::UnboundedReceiver<CompletionEvent>,
    within: Duration,
) -> CompletionEvent {
    tokio::time::timeout(within, rx.recv())
        .await
        .expect("completion within deadline")
        .expect("completion channel open")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_routes_to_a_slot_and_the_result_comes_back() {
    let mut f = start_pool(Script::Instant, 2).await;

    let id = ExecutionId::generate();
    let decision = f
        .pool
        .dispatch(id, ExecutionKind::Tool, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(decision, DispatchDecision::Accepted);

    let completion = next_completion(&mut f.completions, Duration::from_secs(2)).await;
    assert_eq!(completion.execution_id, id);
    assert_eq!(completion.outcome.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn full_pool_with_wedged_workers_reports_saturated() {
    let mut f = start_pool(Script::Wedged, 1).await;

    let first = f
        .pool
        .dispatch(ExecutionId::generate(), ExecutionKind::Tool, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(first, DispatchDecision::Accepted);

    let second = f
        .pool
        .dispatch(ExecutionId::generate(), ExecutionKind::Tool, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(second, DispatchDecision::Saturated);

    // Nothing completed; the wedged worker just sits there.
    assert!(f.completions.try_recv().is_err());
}

#[tokio::test]
async fn deadline_escalates_to_kill_and_emits_a_synthetic_timeout() {
    let mut f = start_pool(Script::Wedged, 1).await;

    let id = ExecutionId::generate();
    f.pool
        .dispatch(id, ExecutionKind::Tool, Duration::from_millis(200))
        .await
        .unwrap();

    let completion = next_completion(&mut f.completions, Duration::from_secs(2)).await;
    assert_eq!(completion.execution_id, id);
    assert_eq!(completion.outcome.status, ExecutionStatus::Timeout);
    assert_eq!(
        completion.outcome.error.as_ref().unwrap().kind,
        ErrorKind::Timeout
    );
    // Deadline 200ms + grace 100ms, with timer slack.
    assert!(completion.outcome.usage.duration_ms >= 200);
}

#[tokio::test]
async fn cancel_request_kills_the_owning_slot() {
    let mut f = start_pool(Script::Wedged, 1).await;

    let id = ExecutionId::generate();
    f.pool
        .dispatch(id, ExecutionKind::Tool, Duration::from_secs(30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    f.store
        .publish(
            CANCEL_CHANNEL,
            serde_json::to_value(CancelRequest {
                execution_id: id,
                reason: Some("test".into()),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let completion = next_completion(&mut f.completions, Duration::from_secs(2)).await;
    assert_eq!(completion.outcome.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn cancel_for_an_unknown_execution_is_ignored() {
    let mut f = start_pool(Script::Instant, 1).await;

    f.store
        .publish(
            CANCEL_CHANNEL,
            serde_json::to_value(CancelRequest {
                execution_id: ExecutionId::generate(),
                reason: None,
            })
            .unwrap(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.completions.try_recv().is_err());
    // The pool is unharmed and still dispatches.
    let decision = f
        .pool
        .dispatch(ExecutionId::generate(), ExecutionKind::Tool, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(decision, DispatchDecision::Accepted);
}

#[tokio::test]
async fn status_reflects_slot_occupancy() {
    let f = start_pool(Script::Wedged, 2).await;

    let id = ExecutionId::generate();
    f.pool
        .dispatch(id, ExecutionKind::Tool, Duration::from_secs(30))
        .await
        .unwrap();

    let status = f.pool.status().await.unwrap();
    assert_eq!(status.busy_count, 1);
    let busy: Vec<_> = status
        .processes
        .iter()
        .filter(|p| p.current_execution_id == Some(id))
        .collect();
    assert_eq!(busy.len(), 1, "exactly one slot owns the execution");
}
