//! Explicit target registry.
//!
//! Maps an opaque target reference to its callable and declared metadata.
//! Populated at startup by whoever owns the process (daemon, worker binary,
//! test harness); dispatch never scans anything.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use bf_schemas::ExecutionKind;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::schema::ParamSchema;

/// Boxed future returned by a target callable.
pub type TargetFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// The callable behind a target. Receives the coerced parameters and the
/// per-execution context; an `Err` is the moral equivalent of an uncaught
/// exception in user code.
pub type TargetCallable = Arc<dyn Fn(Value, ExecutionContext) -> TargetFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// TargetSpec
// ---------------------------------------------------------------------------

/// One registered target: callable plus the metadata the dispatcher
/// validates against.
#[derive(Clone)]
pub struct TargetSpec {
    pub kind: ExecutionKind,
    pub declared_timeout_seconds: u64,
    pub schema: ParamSchema,
    pub callable: TargetCallable,
}

impl fmt::Debug for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSpec")
            .field("kind", &self.kind)
            .field("declared_timeout_seconds", &self.declared_timeout_seconds)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ResolveError
// ---------------------------------------------------------------------------

/// The registry has no entry for the requested target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveError {
    pub target: String,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target not found: {:?}", self.target)
    }
}

impl std::error::Error for ResolveError {}

// ---------------------------------------------------------------------------
// TargetRegistry
// ---------------------------------------------------------------------------

/// Shared registry. Registration happens at startup; `resolve` is the hot
/// path and takes a read lock only.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    targets: Arc<RwLock<HashMap<String, Arc<TargetSpec>>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target under `name`. Re-registering replaces the prior
    /// entry (package installs re-register with fresh code).
    pub fn register(
        &self,
        name: &str,
        kind: ExecutionKind,
        declared_timeout_seconds: u64,
        schema: ParamSchema,
        callable: TargetCallable,
    ) {
        let spec = Arc::new(TargetSpec {
            kind,
            declared_timeout_seconds,
            schema,
            callable,
        });
        self.targets
            .write()
            .expect("target registry lock poisoned")
            .insert(name.to_string(), spec);
    }

    pub fn resolve(&self, target: &str) -> Result<Arc<TargetSpec>, ResolveError> {
        self.targets
            .read()
            .expect("target registry lock poisoned")
            .get(target)
            .cloned()
            .ok_or_else(|| ResolveError {
                target: target.to_string(),
            })
    }

    pub fn contains(&self, target: &str) -> bool {
        self.targets
            .read()
            .expect("target registry lock poisoned")
            .contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.targets
            .read()
            .expect("target registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ParamType;

    fn noop_callable() -> TargetCallable {
        Arc::new(|params, _ctx| Box::pin(async move { Ok(params) }))
    }

    #[test]
    fn resolve_returns_registered_spec() {
        let reg = TargetRegistry::new();
        reg.register(
            "wf:sync",
            ExecutionKind::Workflow,
            60,
            ParamSchema::new().required("x", ParamType::Integer),
            noop_callable(),
        );

        let spec = reg.resolve("wf:sync").unwrap();
        assert_eq!(spec.kind, ExecutionKind::Workflow);
        assert_eq!(spec.declared_timeout_seconds, 60);
    }

    #[test]
    fn resolve_unknown_target_errors() {
        let reg = TargetRegistry::new();
        let err = reg.resolve("wf:ghost").unwrap_err();
        assert_eq!(err.target, "wf:ghost");
    }

    #[test]
    fn re_registration_replaces_the_entry() {
        let reg = TargetRegistry::new();
        reg.register(
            "t",
            ExecutionKind::Tool,
            10,
            ParamSchema::empty(),
            noop_callable(),
        );
        reg.register(
            "t",
            ExecutionKind::Tool,
            20,
            ParamSchema::empty(),
            noop_callable(),
        );
        assert_eq!(reg.resolve("t").unwrap().declared_timeout_seconds, 20);
        assert_eq!(reg.len(), 1);
    }
}
