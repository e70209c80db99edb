//! Slot bookkeeping and its state machine.
//!
//! ```text
//!   (spawn) ──► IDLE ──dispatch──► BUSY ──result──► IDLE
//!                │                  │
//!                │                  ├─deadline──► BUSY(draining) ──exit──► KILLED
//!                │                  └─cancel────► BUSY(draining) ──exit──► KILLED
//!                └─retire──► KILLED
//! ```
//!
//! A slot never accepts a second dispatch until the prior terminal event
//! has been fully processed: the manager only routes to `Idle` slots, and
//! `take_execution` clears `current_execution_id` exactly once, which is
//! what makes synthetic results single-shot.

use bf_ids::ExecutionId;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub type SlotId = u64;

/// Why a busy slot entered the draining window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrainReason {
    /// Execution deadline passed; SIGTERM sent, SIGKILL at `terminate_at`.
    Timeout,
    /// A cancel request targeted the running execution.
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy {
        execution_id: ExecutionId,
        deadline: Instant,
        busy_since: Instant,
        /// Set once the kill escalation has started.
        draining: Option<(DrainReason, Instant)>,
    },
    /// Kill decided or child known dead; the slot is removed once reaped.
    Killed,
}

#[derive(Debug)]
pub struct Slot {
    pub id: SlotId,
    pub pid: Option<u32>,
    pub state: SlotState,
    pub executions_completed: u64,
    pub started_at: DateTime<Utc>,
    pub started_at_mono: Instant,
    pub marked_for_recycle: bool,
    /// Last moment the slot finished an execution; drives LRU placement.
    pub last_released: Instant,
}

impl Slot {
    pub fn new(id: SlotId) -> Self {
        let now = Instant::now();
        Self {
            id,
            pid: None,
            state: SlotState::Idle,
            executions_completed: 0,
            started_at: Utc::now(),
            started_at_mono: now,
            marked_for_recycle: false,
            last_released: now,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SlotState::Idle)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, SlotState::Busy { .. })
    }

    pub fn current_execution_id(&self) -> Option<ExecutionId> {
        match &self.state {
            SlotState::Busy { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }

    /// IDLE -> BUSY. Caller must have checked `is_idle`.
    pub fn begin(&mut self, execution_id: ExecutionId, deadline: Instant) {
        debug_assert!(self.is_idle(), "dispatch to a non-idle slot");
        self.state = SlotState::Busy {
            execution_id,
            deadline,
            busy_since: Instant::now(),
            draining: None,
        };
    }

    /// Take the in-flight execution out of the slot, transitioning
    /// BUSY -> IDLE. Returns `None` when the slot held nothing, which is
    /// the duplicate-suppression guard for synthetic results.
    pub fn take_execution(&mut self) -> Option<(ExecutionId, Instant, Option<DrainReason>)> {
        match std::mem::replace(&mut self.state, SlotState::Idle) {
            SlotState::Busy {
                execution_id,
                busy_since,
                draining,
                ..
            } => {
                self.executions_completed += 1;
                self.last_released = Instant::now();
                Some((execution_id, busy_since, draining.map(|(r, _)| r)))
            }
            prior => {
                self.state = prior;
                None
            }
        }
    }

    /// Begin the SIGTERM -> SIGKILL escalation window. No-op if already
    /// draining (the first reason wins).
    pub fn begin_drain(&mut self, reason: DrainReason, terminate_at: Instant) {
        if let SlotState::Busy { draining, .. } = &mut self.state {
            if draining.is_none() {
                *draining = Some((reason, terminate_at));
            }
        }
    }

    pub fn draining(&self) -> Option<(DrainReason, Instant)> {
        match &self.state {
            SlotState::Busy { draining, .. } => *draining,
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            SlotState::Busy { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    pub fn kill(&mut self) {
        self.state = SlotState::Killed;
    }

    /// Whether the slot should be retired instead of going back to IDLE.
    pub fn due_for_recycle(&self, recycle_after: u64) -> bool {
        self.marked_for_recycle
            || (recycle_after > 0 && self.executions_completed >= recycle_after)
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            SlotState::Idle => "IDLE",
            SlotState::Busy { .. } => "BUSY",
            SlotState::Killed => "KILLED",
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at_mono.elapsed().as_secs()
    }
}
