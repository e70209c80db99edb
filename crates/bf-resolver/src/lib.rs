//! bf-resolver
//!
//! The executable resolver: an explicit registry mapping target references
//! to callables with their declared metadata (kind, parameter schema,
//! timeout). Nothing is discovered by scanning; every target is registered
//! at startup. The dispatcher resolves metadata for validation and
//! coercion, workers resolve the callable itself.

pub mod builtins;
pub mod context;
pub mod registry;
pub mod schema;

pub use builtins::{register_builtins, ECHO, FAIL_WITH, SLEEP_MS, SOFT_FAIL};
pub use context::{ExecutionContext, UserEvent};
pub use registry::{ResolveError, TargetCallable, TargetRegistry, TargetSpec};
pub use schema::{CoercionError, ParamField, ParamSchema, ParamType};
