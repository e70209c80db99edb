//! Task-backed workers: the worker Run loop as an in-process tokio task.
//!
//! Speaks the exact control protocol of the OS worker (same [`execute`]
//! core, same message types), with signals mapped to in-process
//! equivalents: graceful terminate is a notify the loop observes between
//! and during runs, forced kill is a task abort. A worker asked to run the
//! crash sentinel returns without emitting a result, which is
//! indistinguishable from a process dying mid-execution.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use bf_pool::{SlotEvent, SlotId, WorkerEvent, WorkerLauncher, WorkerProcess};
use bf_resolver::TargetRegistry;
use bf_schemas::{context_key, ControlMsg, EphemeralStore, WorkerMsg};
use bf_worker::{execute, StoreContextSource};

/// Target reference whose Run makes the task worker die without a result.
pub const CRASH_SENTINEL: &str = "test:crash";

pub struct TaskLauncher {
    registry: TargetRegistry,
    store: Arc<dyn EphemeralStore>,
    graceful_shutdown: Duration,
}

impl TaskLauncher {
    pub fn new(
        registry: TargetRegistry,
        store: Arc<dyn EphemeralStore>,
        graceful_shutdown: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            graceful_shutdown,
        }
    }
}

struct TaskWorker {
    slot_id: SlotId,
    control: mpsc::UnboundedSender<ControlMsg>,
    term: Arc<Notify>,
    abort: AbortHandle,
}

impl WorkerProcess for TaskWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.slot_id as u32)
    }

    fn control(&self) -> &mpsc::UnboundedSender<ControlMsg> {
        &self.control
    }

    fn signal_terminate(&self) {
        self.term.notify_one();
    }

    fn signal_kill(&self) {
        self.abort.abort();
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn spawn(
        &self,
        slot_id: SlotId,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let term = Arc::new(Notify::new());

        let body = worker_task(
            slot_id,
            self.registry.clone(),
            self.store.clone(),
            self.graceful_shutdown,
            control_rx,
            term.clone(),
            events.clone(),
        );
        let handle = tokio::spawn(body);
        let abort = handle.abort_handle();

        // Exit watcher: a finished task is a clean exit, an aborted task is
        // a hard kill.
        {
            let events = events.clone();
            tokio::spawn(async move {
                let code = match handle.await {
                    Ok(code) => Some(code),
                    Err(_) => None,
                };
                let _ = events.send(SlotEvent {
                    slot_id,
                    event: WorkerEvent::Exited { code },
                });
            });
        }

        Ok(Box::new(TaskWorker {
            slot_id,
            control: control_tx,
            term,
            abort,
        }))
    }
}

async fn worker_task(
    slot_id: SlotId,
    registry: TargetRegistry,
    store: Arc<dyn EphemeralStore>,
    graceful_shutdown: Duration,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    term: Arc<Notify>,
    events: mpsc::UnboundedSender<SlotEvent>,
) -> i32 {
    let source = StoreContextSource::new(store.clone());
    let emit = move |msg: WorkerMsg| {
        let _ = events.send(SlotEvent {
            slot_id,
            event: WorkerEvent::Msg(msg),
        });
    };

    emit(WorkerMsg::Ready {
        pid: slot_id as u32,
    });

    loop {
        tokio::select! {
            msg = control_rx.recv() => match msg {
                None => return 0,
                Some(ControlMsg::Terminate) => return 0,
                Some(ControlMsg::Run { id }) => {
                    // Crash sentinel: die the way a segfaulting process
                    // would, mid-run and silent.
                    if let Ok(Some(ctx)) = store.get(&context_key(id)).await {
                        let target = ctx.get("target").and_then(|t| t.as_str());
                        if target == Some(CRASH_SENTINEL) {
                            debug!(slot_id, %id, "crash sentinel: dying without a result");
                            return 7;
                        }
                    }

                    let exec = execute(&registry, &source, id, &emit);
                    tokio::pin!(exec);
                    let mut grace_deadline: Option<Instant> = None;
                    let exited = loop {
                        tokio::select! {
                            outcome = &mut exec => {
                                emit(WorkerMsg::Result { id, outcome });
                                break grace_deadline.is_some();
                            }
                            _ = term.notified(), if grace_deadline.is_none() => {
                                grace_deadline = Some(Instant::now() + graceful_shutdown);
                            }
                            _ = tokio::time::sleep_until(
                                grace_deadline.unwrap_or_else(Instant::now)
                            ), if grace_deadline.is_some() => {
                                debug!(slot_id, %id, "grace expired; abandoning run");
                                break true;
                            }
                        }
                    };
                    if exited {
                        return 0;
                    }
                }
            },
            _ = term.notified() => return 0,
        }
    }
}
