//! Status and error taxonomies.
//!
//! `ExecutionStatus` is an explicit state machine: transitions are validated
//! via [`ExecutionStatus::can_transition_to`], terminal states are
//! write-once, and storage layers must treat an observed terminal status as
//! final.

use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ExecutionKind
// ---------------------------------------------------------------------------

/// The category of user-authored target being executed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Workflow,
    Tool,
    DataProvider,
    InlineCode,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Workflow => "workflow",
            ExecutionKind::Tool => "tool",
            ExecutionKind::DataProvider => "data_provider",
            ExecutionKind::InlineCode => "inline_code",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "workflow" => Ok(ExecutionKind::Workflow),
            "tool" => Ok(ExecutionKind::Tool),
            "data_provider" => Ok(ExecutionKind::DataProvider),
            "inline_code" => Ok(ExecutionKind::InlineCode),
            other => Err(anyhow!("unknown execution kind: {}", other)),
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution record.
///
/// ```text
///   PENDING ──► RUNNING ──► SUCCESS
///                  │    ──► COMPLETED_WITH_ERRORS
///                  │    ──► FAILED
///                  │    ──► TIMEOUT
///                  └──────► CANCELLED
/// ```
///
/// Everything right of RUNNING is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    CompletedWithErrors,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Whether `self -> next` is a legal transition of the state machine.
    /// Self-transitions are not legal; terminal states accept nothing.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Pending => {
                matches!(next, ExecutionStatus::Running) || next.is_terminal()
            }
            ExecutionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "COMPLETED_WITH_ERRORS" => Ok(ExecutionStatus::CompletedWithErrors),
            "TIMEOUT" => Ok(ExecutionStatus::Timeout),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            other => Err(anyhow!("invalid execution status: {}", other)),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Engine-level error taxonomy, independent of where the error surfaced.
///
/// `PoolSaturated` is internal only: it drives a re-queue and is never
/// written to a record or surfaced to a caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidParams,
    TargetNotFound,
    PoolSaturated,
    WorkerCrashed,
    Timeout,
    Cancelled,
    UserError,
    Unavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::InvalidParams => "INVALID_PARAMS",
            ErrorKind::TargetNotFound => "TARGET_NOT_FOUND",
            ErrorKind::PoolSaturated => "POOL_SATURATED",
            ErrorKind::WorkerCrashed => "WORKER_CRASHED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::UserError => "USER_ERROR",
            ErrorKind::Unavailable => "UNAVAILABLE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INVALID_REQUEST" => Ok(ErrorKind::InvalidRequest),
            "INVALID_PARAMS" => Ok(ErrorKind::InvalidParams),
            "TARGET_NOT_FOUND" => Ok(ErrorKind::TargetNotFound),
            "POOL_SATURATED" => Ok(ErrorKind::PoolSaturated),
            "WORKER_CRASHED" => Ok(ErrorKind::WorkerCrashed),
            "TIMEOUT" => Ok(ErrorKind::Timeout),
            "CANCELLED" => Ok(ErrorKind::Cancelled),
            "USER_ERROR" => Ok(ErrorKind::UserError),
            "UNAVAILABLE" => Ok(ErrorKind::Unavailable),
            other => Err(anyhow!("invalid error kind: {}", other)),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_accept_no_transitions() {
        for terminal in [
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::CompletedWithErrors,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(ExecutionStatus::Running));
            assert!(!terminal.can_transition_to(ExecutionStatus::Success));
        }
    }

    #[test]
    fn running_transitions_only_to_terminal() {
        let r = ExecutionStatus::Running;
        assert!(!r.can_transition_to(ExecutionStatus::Pending));
        assert!(!r.can_transition_to(ExecutionStatus::Running));
        assert!(r.can_transition_to(ExecutionStatus::Timeout));
        assert!(r.can_transition_to(ExecutionStatus::Cancelled));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::CompletedWithErrors,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(ExecutionStatus::parse("EXPLODED").is_err());
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for k in [
            ExecutionKind::Workflow,
            ExecutionKind::Tool,
            ExecutionKind::DataProvider,
            ExecutionKind::InlineCode,
        ] {
            assert_eq!(ExecutionKind::parse(k.as_str()).unwrap(), k);
        }
    }
}
