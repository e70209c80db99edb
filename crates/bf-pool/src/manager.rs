//! The pool-manager event loop.
//!
//! One cooperative loop per deployment instance. Every state mutation
//! (slot bookkeeping, spawn/kill decisions, synthetic results) happens
//! inside the loop; the outside world reaches it through [`PoolHandle`]
//! commands, worker events, the cancel subscription, and a bounded timer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use bf_ids::{ExecutionId, PoolId};
use bf_schemas::{
    registration_key, CancelRequest, CompletionEvent, ControlMsg, EphemeralStore,
    ExecutionKind, ExecutionOutcome, LogLine, ProcessInfo, ProgressKind, RawProgress,
    ResourceUsage, Subscription, WorkerMsg, WorkerRegistration, CANCEL_CHANNEL,
};

use crate::launcher::{SlotEvent, WorkerEvent, WorkerLauncher, WorkerProcess};
use crate::slot::{DrainReason, Slot, SlotId};
use crate::PoolConfig;

// ---------------------------------------------------------------------------
// PoolHandle
// ---------------------------------------------------------------------------

/// Outcome of a dispatch hand-off.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchDecision {
    Accepted,
    /// Pool at max_workers with every slot busy; the dispatcher re-queues.
    Saturated,
}

/// Point-in-time pool snapshot (the same payload as the heartbeat
/// registration).
pub type PoolStatus = WorkerRegistration;

enum Cmd {
    Dispatch {
        id: ExecutionId,
        kind: ExecutionKind,
        timeout: Duration,
        reply: oneshot::Sender<DispatchDecision>,
    },
    MarkForRecycle,
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle used by the dispatcher and operators. All methods fail
/// with an error only when the pool loop is gone.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<Cmd>,
}

impl PoolHandle {
    pub async fn dispatch(
        &self,
        id: ExecutionId,
        kind: ExecutionKind,
        timeout: Duration,
    ) -> Result<DispatchDecision> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Dispatch {
                id,
                kind,
                timeout,
                reply,
            })
            .await
            .map_err(|_| anyhow!("pool manager is gone"))?;
        rx.await.context("pool manager dropped the dispatch reply")
    }

    /// Flag every slot for recycling: idle slots die now, busy slots die on
    /// completion. Used after a package install invalidates loaded modules.
    pub async fn mark_for_recycle(&self) -> Result<()> {
        self.tx
            .send(Cmd::MarkForRecycle)
            .await
            .map_err(|_| anyhow!("pool manager is gone"))
    }

    pub async fn status(&self) -> Result<PoolStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Status { reply })
            .await
            .map_err(|_| anyhow!("pool manager is gone"))?;
        rx.await.context("pool manager dropped the status reply")
    }

    /// Stop the loop after terminating all workers.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Shutdown { reply })
            .await
            .map_err(|_| anyhow!("pool manager is gone"))?;
        rx.await.context("pool manager dropped the shutdown reply")
    }
}

// ---------------------------------------------------------------------------
// PoolManager
// ---------------------------------------------------------------------------

struct SlotEntry {
    slot: Slot,
    proc: Box<dyn WorkerProcess>,
}

pub struct PoolManager {
    cfg: PoolConfig,
    pool_id: PoolId,
    launcher: Arc<dyn WorkerLauncher>,
    store: Arc<dyn EphemeralStore>,
    completions: mpsc::UnboundedSender<CompletionEvent>,
    progress: mpsc::UnboundedSender<RawProgress>,

    slots: BTreeMap<SlotId, SlotEntry>,
    next_slot_id: SlotId,
    events_tx: mpsc::UnboundedSender<SlotEvent>,
    events_rx: mpsc::UnboundedReceiver<SlotEvent>,
    cmd_rx: mpsc::Receiver<Cmd>,

    started_at: chrono::DateTime<Utc>,
    last_dispatch_at: Instant,
    high_water_since: Option<Instant>,
    last_heartbeat: Option<Instant>,
    exec_logs: HashMap<ExecutionId, Vec<LogLine>>,
    shutdown_replies: VecDeque<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl PoolManager {
    /// Spawn the manager loop and return its handle. The loop brings the
    /// pool up to `min_workers` before serving its first event.
    pub fn start(
        cfg: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn EphemeralStore>,
        completions: mpsc::UnboundedSender<CompletionEvent>,
        progress: mpsc::UnboundedSender<RawProgress>,
    ) -> PoolHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = PoolManager {
            cfg,
            pool_id: PoolId::generate(),
            launcher,
            store,
            completions,
            progress,
            slots: BTreeMap::new(),
            next_slot_id: 1,
            events_tx,
            events_rx,
            cmd_rx,
            started_at: Utc::now(),
            last_dispatch_at: Instant::now(),
            high_water_since: None,
            last_heartbeat: None,
            exec_logs: HashMap::new(),
            shutdown_replies: VecDeque::new(),
            shutting_down: false,
        };

        tokio::spawn(manager.run());
        PoolHandle { tx: cmd_tx }
    }

    async fn run(mut self) {
        info!(pool_id = %self.pool_id, min = self.cfg.min_workers, max = self.cfg.max_workers, "pool manager starting");

        for _ in 0..self.cfg.min_workers {
            if let Err(e) = self.spawn_slot().await {
                error!(error = %e, "initial worker spawn failed");
            }
        }

        let mut cancel_sub: Option<Subscription> = match self.store.subscribe(CANCEL_CHANNEL).await
        {
            Ok(sub) => Some(sub),
            Err(e) => {
                error!(error = %e, "cancel channel subscription failed");
                None
            }
        };

        let mut ticker = tokio::time::interval(self.cfg.timer_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_cmd(cmd).await;
                }
                Some(ev) = self.events_rx.recv() => {
                    self.handle_slot_event(ev).await;
                }
                raw = recv_cancel(&mut cancel_sub) => {
                    self.handle_cancel(raw);
                }
                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
            }

            if self.shutting_down && self.slots.is_empty() {
                break;
            }
        }

        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        info!(pool_id = %self.pool_id, "pool manager stopped");
    }

    // -- commands ----------------------------------------------------------

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Dispatch {
                id,
                kind,
                timeout,
                reply,
            } => {
                let decision = self.dispatch(id, kind, timeout).await;
                let _ = reply.send(decision);
            }
            Cmd::MarkForRecycle => self.mark_all_for_recycle(),
            Cmd::Status { reply } => {
                let _ = reply.send(self.registration());
            }
            Cmd::Shutdown { reply } => {
                info!(pool_id = %self.pool_id, "pool shutdown requested");
                self.shutting_down = true;
                self.shutdown_replies.push_back(reply);
                // Idle slots die now. Busy slots keep their execution and
                // retire when its result lands; killing them here would
                // drop in-flight results on the floor.
                let idle: Vec<SlotId> = self
                    .slots
                    .values()
                    .filter(|e| e.slot.is_idle())
                    .map(|e| e.slot.id)
                    .collect();
                for slot_id in idle {
                    self.retire_slot(slot_id);
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        id: ExecutionId,
        kind: ExecutionKind,
        timeout: Duration,
    ) -> DispatchDecision {
        if self.shutting_down {
            return DispatchDecision::Saturated;
        }
        self.last_dispatch_at = Instant::now();

        let slot_id = match self.pick_idle_slot() {
            Some(slot_id) => Some(slot_id),
            None if self.slots.len() < self.cfg.max_workers => match self.spawn_slot().await {
                Ok(slot_id) => Some(slot_id),
                Err(e) => {
                    error!(error = %e, "spawn for dispatch failed");
                    None
                }
            },
            None => None,
        };

        let Some(slot_id) = slot_id else {
            debug!(%id, "pool saturated");
            return DispatchDecision::Saturated;
        };

        let entry = self.slots.get_mut(&slot_id).expect("picked slot exists");
        entry.slot.begin(id, Instant::now() + timeout);
        debug!(%id, slot_id, kind = %kind, timeout_s = timeout.as_secs_f64(), "execution dispatched");
        if entry.proc.control().send(ControlMsg::Run { id }).is_err() {
            // The worker's control channel is gone; its exit event will
            // surface a synthetic crash result for this execution.
            warn!(slot_id, "control channel closed at dispatch");
        }
        DispatchDecision::Accepted
    }

    fn mark_all_for_recycle(&mut self) {
        info!(pool_id = %self.pool_id, "marking all slots for recycle");
        let idle: Vec<SlotId> = self
            .slots
            .iter_mut()
            .map(|(id, entry)| {
                entry.slot.marked_for_recycle = true;
                (*id, entry.slot.is_idle())
            })
            .filter_map(|(id, idle)| idle.then_some(id))
            .collect();
        // Idle flagged slots die now; busy ones die on completion.
        for slot_id in idle {
            self.retire_slot(slot_id);
        }
    }

    // -- worker events -----------------------------------------------------

    async fn handle_slot_event(&mut self, ev: SlotEvent) {
        match ev.event {
            WorkerEvent::Msg(msg) => self.handle_worker_msg(ev.slot_id, msg),
            WorkerEvent::Exited { code } => self.handle_exit(ev.slot_id, code).await,
        }
    }

    fn handle_worker_msg(&mut self, slot_id: SlotId, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Ready { pid } => {
                debug!(slot_id, pid, "worker ready");
                if let Some(entry) = self.slots.get_mut(&slot_id) {
                    entry.slot.pid.get_or_insert(pid);
                }
            }
            WorkerMsg::StateChange { id, phase } => {
                self.forward_progress(id, ProgressKind::Phase, serde_json::json!({ "phase": phase }));
            }
            WorkerMsg::Log { id, level, message } => {
                self.exec_logs.entry(id).or_default().push(LogLine {
                    ts: Utc::now(),
                    level: level.clone(),
                    message: message.clone(),
                });
                self.forward_progress(
                    id,
                    ProgressKind::Log,
                    serde_json::json!({ "level": level, "message": message }),
                );
            }
            WorkerMsg::Variable { id, name, snapshot } => {
                self.forward_progress(
                    id,
                    ProgressKind::Variable,
                    serde_json::json!({ "name": name, "snapshot": snapshot }),
                );
            }
            WorkerMsg::Result { id, outcome } => self.handle_result(slot_id, id, outcome),
        }
    }

    fn handle_result(&mut self, slot_id: SlotId, id: ExecutionId, outcome: ExecutionOutcome) {
        let Some(entry) = self.slots.get_mut(&slot_id) else {
            warn!(slot_id, %id, "result from unknown slot dropped");
            return;
        };
        if entry.slot.current_execution_id() != Some(id) {
            // Either a duplicate Result or a stale one arriving after a
            // synthetic outcome was already emitted. One result per
            // execution: drop it.
            warn!(slot_id, %id, "stale or duplicate result dropped");
            return;
        }

        let (exec_id, busy_since, drain) = entry
            .slot
            .take_execution()
            .expect("current execution just checked");

        // A result racing the kill escalation does not win: once the
        // deadline or a cancel started the drain, the terminal state is
        // TIMEOUT / CANCELLED even if user code finished in the window.
        let final_outcome = match drain {
            Some(DrainReason::Timeout) => ExecutionOutcome::timeout(
                "execution exceeded its deadline".into(),
                usage_since(busy_since),
            ),
            Some(DrainReason::Cancel) => ExecutionOutcome::cancelled(
                "cancelled by request".into(),
                usage_since(busy_since),
            ),
            None => {
                let mut outcome = outcome;
                if outcome.usage.duration_ms == 0 {
                    outcome.usage.duration_ms = elapsed_ms(busy_since);
                }
                outcome
            }
        };

        let draining = drain.is_some();
        let due_for_recycle = entry.slot.due_for_recycle(self.cfg.recycle_after_executions);
        let completed = entry.slot.executions_completed;
        if draining {
            // The kill escalation is already under way; the slot must not
            // accept another dispatch while the child dies.
            entry.slot.kill();
        }

        self.emit_completion(exec_id, final_outcome);

        if !draining && (due_for_recycle || self.shutting_down) {
            debug!(slot_id, completed, "slot retiring");
            self.retire_slot(slot_id);
        }
    }

    async fn handle_exit(&mut self, slot_id: SlotId, code: Option<i32>) {
        let Some(mut entry) = self.slots.remove(&slot_id) else {
            return;
        };

        if let Some((exec_id, busy_since, drain)) = entry.slot.take_execution() {
            // The child died while owning an execution: exactly one
            // synthetic result, flavored by why the kill started.
            let outcome = match drain {
                Some(DrainReason::Timeout) => ExecutionOutcome::timeout(
                    "execution exceeded its deadline".into(),
                    usage_since(busy_since),
                ),
                Some(DrainReason::Cancel) => ExecutionOutcome::cancelled(
                    "cancelled by request".into(),
                    usage_since(busy_since),
                ),
                None => ExecutionOutcome::worker_crashed(
                    format!(
                        "worker exited without a result (exit code {})",
                        code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
                    ),
                    usage_since(busy_since),
                ),
            };
            self.emit_completion(exec_id, outcome);
        } else {
            debug!(slot_id, ?code, "idle worker exited");
        }

        if !self.shutting_down && self.slots.len() < self.cfg.min_workers {
            if let Err(e) = self.spawn_slot().await {
                error!(error = %e, "replacement worker spawn failed");
            }
        }
    }

    fn handle_cancel(&mut self, raw: serde_json::Value) {
        let req: CancelRequest = match serde_json::from_value(raw) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "malformed cancel request dropped");
                return;
            }
        };

        let holder = self
            .slots
            .iter_mut()
            .find(|(_, e)| e.slot.current_execution_id() == Some(req.execution_id));

        match holder {
            Some((slot_id, entry)) => {
                info!(
                    execution_id = %req.execution_id,
                    slot_id = *slot_id,
                    reason = ?req.reason,
                    "cancel received, killing slot"
                );
                entry.proc.signal_terminate();
                entry
                    .slot
                    .begin_drain(DrainReason::Cancel, Instant::now() + self.cfg.graceful_shutdown);
            }
            None => {
                // Unknown id: already terminal, not yet dispatched, or
                // simply not ours. At-least-once semantics make this
                // routine, not an error.
                debug!(execution_id = %req.execution_id, "cancel-not-found");
            }
        }
    }

    // -- timer -------------------------------------------------------------

    async fn handle_tick(&mut self) {
        let now = Instant::now();

        // Deadline enforcement and SIGKILL escalation.
        for entry in self.slots.values_mut() {
            match entry.slot.draining() {
                Some((_, terminate_at)) => {
                    if now >= terminate_at {
                        entry.proc.signal_kill();
                    }
                }
                None => {
                    if let Some(deadline) = entry.slot.deadline() {
                        if now >= deadline {
                            debug!(slot_id = entry.slot.id, "deadline reached, SIGTERM");
                            entry.proc.signal_terminate();
                            entry
                                .slot
                                .begin_drain(DrainReason::Timeout, now + self.cfg.graceful_shutdown);
                        }
                    }
                }
            }
        }

        // Heartbeat + scaling on the slower cadence.
        let due = self
            .last_heartbeat
            .map_or(true, |t| now.duration_since(t) >= self.cfg.heartbeat_interval);
        if due {
            self.last_heartbeat = Some(now);
            self.publish_heartbeat().await;
            if !self.shutting_down {
                self.apply_scaling(now).await;
            }
        }
    }

    async fn publish_heartbeat(&mut self) {
        let reg = self.registration();
        let key = registration_key(self.pool_id);
        match serde_json::to_value(&reg) {
            Ok(v) => {
                if let Err(e) = self.store.set(&key, v, self.cfg.registration_ttl).await {
                    warn!(error = %e, "heartbeat registration refresh failed");
                }
            }
            Err(e) => warn!(error = %e, "heartbeat serialization failed"),
        }
    }

    async fn apply_scaling(&mut self, now: Instant) {
        let size = self.slots.len();
        let busy = self.slots.values().filter(|e| e.slot.is_busy()).count();
        let idle = self.slots.values().filter(|e| e.slot.is_idle()).count();

        // Scale-up: sustained busy ratio above the high-water mark.
        let ratio = if size == 0 { 1.0 } else { busy as f64 / size as f64 };
        if ratio > self.cfg.scale_up_busy_ratio && size < self.cfg.max_workers {
            match self.high_water_since {
                None => self.high_water_since = Some(now),
                Some(since) if now.duration_since(since) >= self.cfg.heartbeat_interval => {
                    info!(size, busy, "scale-up: spawning one worker");
                    if let Err(e) = self.spawn_slot().await {
                        error!(error = %e, "scale-up spawn failed");
                    }
                    self.high_water_since = None;
                }
                Some(_) => {}
            }
        } else {
            self.high_water_since = None;
        }

        // Scale-down: surplus idle capacity and a quiet dispatch channel.
        if idle > self.cfg.min_workers
            && now.duration_since(self.last_dispatch_at) >= self.cfg.scale_down_cooldown
        {
            if let Some(slot_id) = self.pick_idle_slot() {
                info!(slot_id, idle, "scale-down: retiring one idle worker");
                self.retire_slot(slot_id);
            }
        }
    }

    // -- helpers -----------------------------------------------------------

    async fn spawn_slot(&mut self) -> Result<SlotId> {
        let slot_id = self.next_slot_id;
        self.next_slot_id += 1;

        let proc = self
            .launcher
            .spawn(slot_id, self.events_tx.clone())
            .await
            .context("worker spawn failed")?;

        let mut slot = Slot::new(slot_id);
        slot.pid = proc.pid();
        info!(slot_id, pid = ?slot.pid, pool_size = self.slots.len() + 1, "pool_online: worker spawned");
        self.slots.insert(slot_id, SlotEntry { slot, proc });
        Ok(slot_id)
    }

    /// Least-recently-used idle slot, skipping recycle-flagged ones.
    fn pick_idle_slot(&self) -> Option<SlotId> {
        self.slots
            .values()
            .filter(|e| e.slot.is_idle() && !e.slot.marked_for_recycle)
            .min_by_key(|e| e.slot.last_released)
            .map(|e| e.slot.id)
    }

    /// Ask a slot to die: clean Terminate over the control channel, with a
    /// signal as the fallback for an already-wedged child. Removal happens
    /// when the exit event arrives.
    fn retire_slot(&mut self, slot_id: SlotId) {
        let Some(entry) = self.slots.get_mut(&slot_id) else {
            return;
        };
        entry.slot.kill();
        if entry.proc.control().send(ControlMsg::Terminate).is_err() {
            entry.proc.signal_terminate();
        }
    }

    fn emit_completion(&mut self, id: ExecutionId, outcome: ExecutionOutcome) {
        let logs = self.exec_logs.remove(&id).unwrap_or_default();
        debug!(%id, status = %outcome.status, "completion emitted");
        if self
            .completions
            .send(CompletionEvent {
                execution_id: id,
                outcome,
                logs,
            })
            .is_err()
        {
            error!(%id, "result path is gone; completion dropped");
        }
    }

    fn forward_progress(&self, id: ExecutionId, kind: ProgressKind, payload: serde_json::Value) {
        let _ = self.progress.send(RawProgress {
            execution_id: id,
            kind,
            payload,
        });
    }

    fn registration(&self) -> WorkerRegistration {
        let processes: Vec<ProcessInfo> = self
            .slots
            .values()
            .map(|e| ProcessInfo {
                process_id: e.slot.id,
                pid: e.slot.pid,
                state: e.slot.state_name().to_string(),
                current_execution_id: e.slot.current_execution_id(),
                executions_completed: e.slot.executions_completed,
                memory_bytes: None,
                uptime_seconds: e.slot.uptime_seconds(),
            })
            .collect();

        WorkerRegistration {
            worker_id: self.pool_id,
            host: hostname(),
            started_at: self.started_at,
            pool_size: self.slots.len(),
            idle_count: self.slots.values().filter(|e| e.slot.is_idle()).count(),
            busy_count: self.slots.values().filter(|e| e.slot.is_busy()).count(),
            last_heartbeat: Utc::now(),
            processes,
        }
    }
}

/// Next cancel message. Pends forever when the subscription is absent or
/// closed so the select branch simply never fires.
async fn recv_cancel(sub: &mut Option<Subscription>) -> serde_json::Value {
    match sub {
        Some(s) => match s.recv().await {
            Some(v) => v,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn usage_since(busy_since: Instant) -> ResourceUsage {
    ResourceUsage {
        duration_ms: elapsed_ms(busy_since),
        peak_memory_bytes: None,
        integrations_invoked: Vec::new(),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
