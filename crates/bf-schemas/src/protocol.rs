//! Pool <-> worker control-channel protocol.
//!
//! Messages are serde-tagged JSON, one object per line, written over the
//! child's stdin (control) and stdout (events). The same types drive the
//! in-process task workers used by the test harness, so wire behavior and
//! test behavior cannot drift apart.

use bf_ids::ExecutionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ExecutionOutcome;

// ---------------------------------------------------------------------------
// ControlMsg: manager -> worker
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMsg {
    /// Start the given execution. A worker owns at most one Run at a time;
    /// the manager never sends a second Run before the prior terminal event.
    Run { id: ExecutionId },
    /// Finish the current execution if possible, then exit cleanly.
    Terminate,
}

// ---------------------------------------------------------------------------
// WorkerMsg: worker -> manager
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMsg {
    /// Emitted once after startup, before the first Run is accepted.
    Ready { pid: u32 },
    /// Optional phase boundary inside the current execution.
    StateChange { id: ExecutionId, phase: String },
    /// A log line from user code.
    Log {
        id: ExecutionId,
        level: String,
        message: String,
    },
    /// A traced variable snapshot (optional; absent when tracing is off).
    Variable {
        id: ExecutionId,
        name: String,
        snapshot: Value,
    },
    /// Terminal outcome. Emitted exactly once per Run.
    Result {
        id: ExecutionId,
        outcome: ExecutionOutcome,
    },
}

impl WorkerMsg {
    /// Encode as one JSON line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

impl ControlMsg {
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceUsage;

    #[test]
    fn control_messages_round_trip_as_lines() {
        let id = ExecutionId::generate();
        let msg = ControlMsg::Run { id };
        let line = msg.to_line().unwrap();
        assert!(!line.contains('\n'), "one message per line");
        match ControlMsg::from_line(&line).unwrap() {
            ControlMsg::Run { id: got } => assert_eq!(got, id),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn result_messages_carry_the_outcome() {
        let id = ExecutionId::generate();
        let msg = WorkerMsg::Result {
            id,
            outcome: ExecutionOutcome::success(serde_json::json!("ok"), ResourceUsage::default()),
        };
        let line = msg.to_line().unwrap();
        match WorkerMsg::from_line(&line).unwrap() {
            WorkerMsg::Result { outcome, .. } => {
                assert_eq!(outcome.result, Some(serde_json::json!("ok")));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
