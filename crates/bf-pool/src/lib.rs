//! bf-pool
//!
//! The process-pool manager: a single-threaded cooperative event loop that
//! owns a fleet of worker processes, routes executions to idle slots,
//! enforces timeouts with SIGTERM -> SIGKILL escalation, detects crashes,
//! honors cancel requests, scales and recycles the pool, and advertises
//! liveness through TTL'd heartbeat registrations.
//!
//! Nothing outside the loop mutates pool state. Workers communicate over a
//! typed control channel; the dispatcher talks to the loop through
//! [`PoolHandle`]; results and progress leave on mpsc channels consumed by
//! the result path.

pub mod launcher;
pub mod manager;
pub mod slot;

pub use launcher::{ProcessLauncher, SlotEvent, WorkerEvent, WorkerLauncher, WorkerProcess};
pub use manager::{DispatchDecision, PoolHandle, PoolManager, PoolStatus};
pub use slot::{DrainReason, Slot, SlotId, SlotState};

use std::time::Duration;

use bf_config::EngineConfig;

/// Pool-manager tunables, derived from the engine config.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub default_timeout: Duration,
    pub graceful_shutdown: Duration,
    /// 0 disables auto-recycling.
    pub recycle_after_executions: u64,
    pub heartbeat_interval: Duration,
    pub registration_ttl: Duration,
    pub scale_up_busy_ratio: f64,
    pub scale_down_cooldown: Duration,
    /// Upper bound on timer latency for deadlines and liveness.
    pub timer_tick: Duration,
}

impl PoolConfig {
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self {
            min_workers: cfg.min_workers,
            max_workers: cfg.max_workers,
            default_timeout: cfg.execution_timeout(),
            graceful_shutdown: cfg.graceful_shutdown(),
            recycle_after_executions: cfg.recycle_after_executions,
            heartbeat_interval: cfg.heartbeat_interval(),
            registration_ttl: cfg.registration_ttl(),
            scale_up_busy_ratio: cfg.scale_up_busy_ratio,
            scale_down_cooldown: cfg.scale_down_cooldown(),
            timer_tick: Duration::from_millis(100),
        }
    }
}
