//! The context object injected into user code for one execution.
//!
//! Carries caller identity and integration config, and exposes the log /
//! phase / checkpoint surface. Everything user code emits flows out as
//! [`UserEvent`]s on an unbounded channel owned by the worker; the context
//! itself holds no worker state, so dropping it at the end of a Run clears
//! all per-execution state unconditionally.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use bf_ids::ExecutionId;
use bf_schemas::CallerIdentity;
use serde_json::Value;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// UserEvent
// ---------------------------------------------------------------------------

/// Events emitted by user code through the context, consumed by the worker
/// loop and forwarded on the control channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserEvent {
    Log { level: String, message: String },
    Phase { name: String },
    /// Explicit variable snapshot (the checkpoint API). Optional; targets
    /// that never call it degrade to log-only progress.
    Variable { name: String, snapshot: String },
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Per-execution context handed to the callable. Cheap to clone; user code
/// may move clones into tasks it spawns, all bounded by the Run.
#[derive(Clone)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    caller: CallerIdentity,
    config: Value,
    events: mpsc::UnboundedSender<UserEvent>,
    integrations_used: Arc<Mutex<BTreeSet<String>>>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: ExecutionId,
        caller: CallerIdentity,
        config: Value,
        events: mpsc::UnboundedSender<UserEvent>,
    ) -> Self {
        Self {
            execution_id,
            caller,
            config,
            events,
            integrations_used: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    /// Integration config block by name, recording the access for resource
    /// accounting. Returns `None` when the integration is not configured.
    pub fn integration(&self, name: &str) -> Option<Value> {
        let block = self.config.get(name).cloned()?;
        if let Ok(mut used) = self.integrations_used.lock() {
            used.insert(name.to_string());
        }
        Some(block)
    }

    /// Integrations touched so far, sorted. Read by the worker after the
    /// callable returns.
    pub fn integrations_invoked(&self) -> Vec<String> {
        self.integrations_used
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn log(&self, level: &str, message: impl Into<String>) {
        let _ = self.events.send(UserEvent::Log {
            level: level.to_string(),
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log("info", message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log("error", message);
    }

    /// Mark a phase boundary. Surfaces as a `state` progress event.
    pub fn phase(&self, name: impl Into<String>) {
        let _ = self.events.send(UserEvent::Phase { name: name.into() });
    }

    /// Snapshot a named value. Surfaces as a `variable` progress event.
    pub fn checkpoint(&self, name: &str, value: &Value) {
        let _ = self.events.send(UserEvent::Variable {
            name: name.to_string(),
            snapshot: value.to_string(),
        });
    }
}
