//! bf-config
//!
//! Engine configuration: one flat struct with the documented defaults,
//! overridable via `BIFROST_*` environment variables, validated before any
//! component starts. Per-crate configs are derived from this, never read
//! from the environment directly.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lower bound on pool size.
    pub min_workers: usize,
    /// Upper bound on pool size.
    pub max_workers: usize,
    /// Default deadline per execution when the request carries no override.
    pub execution_timeout_seconds: u64,
    /// SIGTERM -> SIGKILL grace. Fractional seconds supported.
    pub graceful_shutdown_seconds: f64,
    /// 0 disables; otherwise a worker is recycled after this many
    /// completed executions (failures included).
    pub recycle_after_executions: u64,
    /// Registration refresh cadence.
    pub worker_heartbeat_interval_seconds: u64,
    /// Registration liveness TTL; absence of the key means pool-gone.
    pub worker_registration_ttl_seconds: u64,
    /// Cap on `wait_for_result` timeouts.
    pub sync_wait_ceiling_seconds: u64,
    /// Platform ceiling on per-request timeout overrides.
    pub timeout_ceiling_seconds: u64,
    /// Per-tenant concurrent-submission quota.
    pub tenant_submission_quota: usize,
    /// Dispatcher poll cadence when the queue is empty.
    pub queue_poll_interval_ms: u64,
    /// Claimed-but-unacked queue messages become visible again after this.
    pub queue_visibility_timeout_seconds: u64,
    /// Busy-ratio high-water mark that triggers scale-up.
    pub scale_up_busy_ratio: f64,
    /// Idle period with no dispatches before one idle slot is retired.
    pub scale_down_cooldown_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            execution_timeout_seconds: 300,
            graceful_shutdown_seconds: 5.0,
            recycle_after_executions: 0,
            worker_heartbeat_interval_seconds: 10,
            worker_registration_ttl_seconds: 30,
            sync_wait_ceiling_seconds: 1800,
            timeout_ceiling_seconds: 3600,
            tenant_submission_quota: 100,
            queue_poll_interval_ms: 200,
            queue_visibility_timeout_seconds: 60,
            scale_up_busy_ratio: 0.8,
            scale_down_cooldown_seconds: 30,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `BIFROST_*` environment overrides, then
    /// validated.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        read_env("BIFROST_MIN_WORKERS", &mut cfg.min_workers)?;
        read_env("BIFROST_MAX_WORKERS", &mut cfg.max_workers)?;
        read_env(
            "BIFROST_EXECUTION_TIMEOUT_SECONDS",
            &mut cfg.execution_timeout_seconds,
        )?;
        read_env(
            "BIFROST_GRACEFUL_SHUTDOWN_SECONDS",
            &mut cfg.graceful_shutdown_seconds,
        )?;
        read_env(
            "BIFROST_RECYCLE_AFTER_EXECUTIONS",
            &mut cfg.recycle_after_executions,
        )?;
        read_env(
            "BIFROST_WORKER_HEARTBEAT_INTERVAL_SECONDS",
            &mut cfg.worker_heartbeat_interval_seconds,
        )?;
        read_env(
            "BIFROST_WORKER_REGISTRATION_TTL_SECONDS",
            &mut cfg.worker_registration_ttl_seconds,
        )?;
        read_env(
            "BIFROST_SYNC_WAIT_CEILING_SECONDS",
            &mut cfg.sync_wait_ceiling_seconds,
        )?;
        read_env(
            "BIFROST_TIMEOUT_CEILING_SECONDS",
            &mut cfg.timeout_ceiling_seconds,
        )?;
        read_env(
            "BIFROST_TENANT_SUBMISSION_QUOTA",
            &mut cfg.tenant_submission_quota,
        )?;
        read_env(
            "BIFROST_QUEUE_POLL_INTERVAL_MS",
            &mut cfg.queue_poll_interval_ms,
        )?;
        read_env(
            "BIFROST_QUEUE_VISIBILITY_TIMEOUT_SECONDS",
            &mut cfg.queue_visibility_timeout_seconds,
        )?;
        read_env("BIFROST_SCALE_UP_BUSY_RATIO", &mut cfg.scale_up_busy_ratio)?;
        read_env(
            "BIFROST_SCALE_DOWN_COOLDOWN_SECONDS",
            &mut cfg.scale_down_cooldown_seconds,
        )?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be > 0");
        }
        if self.min_workers > self.max_workers {
            bail!(
                "min_workers ({}) must be <= max_workers ({})",
                self.min_workers,
                self.max_workers
            );
        }
        if self.execution_timeout_seconds == 0 {
            bail!("execution_timeout_seconds must be > 0");
        }
        if self.graceful_shutdown_seconds < 0.0 {
            bail!("graceful_shutdown_seconds must be >= 0");
        }
        if self.worker_registration_ttl_seconds <= self.worker_heartbeat_interval_seconds {
            bail!(
                "worker_registration_ttl_seconds ({}) must exceed the heartbeat interval ({})",
                self.worker_registration_ttl_seconds,
                self.worker_heartbeat_interval_seconds
            );
        }
        if self.timeout_ceiling_seconds < self.execution_timeout_seconds {
            bail!("timeout_ceiling_seconds must be >= execution_timeout_seconds");
        }
        if self.tenant_submission_quota == 0 {
            bail!("tenant_submission_quota must be > 0");
        }
        if !(self.scale_up_busy_ratio > 0.0 && self.scale_up_busy_ratio <= 1.0) {
            bail!(
                "scale_up_busy_ratio must be in (0, 1], got {}",
                self.scale_up_busy_ratio
            );
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs_f64(self.graceful_shutdown_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_interval_seconds)
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_registration_ttl_seconds)
    }

    pub fn sync_wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.sync_wait_ceiling_seconds)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn queue_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_timeout_seconds)
    }

    /// TTL for the staged `pending:{id}` request: must outlive the queue's
    /// visibility window or a redelivered message would find nothing.
    pub fn pending_ttl(&self) -> Duration {
        self.queue_visibility_timeout() * 2
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_seconds)
    }
}

fn read_env<T>(name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = env::var(name) {
        *slot = raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
    }
    Ok(())
}
