//! Built-in targets.
//!
//! A small set of always-available targets used by the scenario tests and
//! by operators smoke-testing a deployment. They exercise every outcome
//! class: success, user error, the `{success: false}` sentinel, and
//! arbitrary sleeps for timeout/cancel testing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bf_schemas::ExecutionKind;
use serde_json::{json, Value};

use crate::registry::TargetRegistry;
use crate::schema::{ParamSchema, ParamType};

/// Target that echoes its `value` parameter back as the result.
pub const ECHO: &str = "builtin:echo";
/// Target that sleeps `duration_ms` then reports how long it slept.
pub const SLEEP_MS: &str = "builtin:sleep_ms";
/// Target that fails with an error, like an uncaught user exception.
pub const FAIL_WITH: &str = "builtin:fail_with";
/// Target that completes but returns the `{success: false}` sentinel.
pub const SOFT_FAIL: &str = "builtin:soft_fail";

pub fn register_builtins(registry: &TargetRegistry) {
    registry.register(
        ECHO,
        ExecutionKind::Tool,
        30,
        ParamSchema::new().required("value", ParamType::Json),
        Arc::new(|params, ctx| {
            Box::pin(async move {
                ctx.info("echoing value");
                Ok(params.get("value").cloned().unwrap_or(Value::Null))
            })
        }),
    );

    registry.register(
        SLEEP_MS,
        ExecutionKind::Tool,
        300,
        ParamSchema::new().required("duration_ms", ParamType::Integer),
        Arc::new(|params, ctx| {
            Box::pin(async move {
                let ms = params
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                ctx.phase("sleeping");
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ctx.phase("done");
                Ok(json!({"slept_ms": ms}))
            })
        }),
    );

    registry.register(
        FAIL_WITH,
        ExecutionKind::Tool,
        30,
        ParamSchema::new().optional("message", ParamType::String, Some(json!("boom"))),
        Arc::new(|params, _ctx| {
            Box::pin(async move {
                let msg = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("boom")
                    .to_string();
                Err(anyhow!(msg))
            })
        }),
    );

    registry.register(
        SOFT_FAIL,
        ExecutionKind::Tool,
        30,
        ParamSchema::new().optional("error", ParamType::String, Some(json!("step failed"))),
        Arc::new(|params, ctx| {
            Box::pin(async move {
                ctx.error("target reported partial failure");
                let err = params
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("step failed");
                Ok(json!({"success": false, "error": err}))
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use bf_ids::ExecutionId;
    use bf_schemas::CallerIdentity;
    use tokio::sync::mpsc;

    fn test_ctx() -> ExecutionContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        ExecutionContext::new(
            ExecutionId::generate(),
            CallerIdentity {
                tenant_id: "t".into(),
                user_id: "u".into(),
                org_id: "o".into(),
            },
            json!({}),
            tx,
        )
    }

    #[tokio::test]
    async fn echo_returns_its_value() {
        let reg = TargetRegistry::new();
        register_builtins(&reg);
        let spec = reg.resolve(ECHO).unwrap();
        let params = spec.schema.coerce(&json!({"value": 42})).unwrap();
        let out = (spec.callable)(params, test_ctx()).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn fail_with_surfaces_the_message() {
        let reg = TargetRegistry::new();
        register_builtins(&reg);
        let spec = reg.resolve(FAIL_WITH).unwrap();
        let params = spec.schema.coerce(&json!({"message": "kaput"})).unwrap();
        let err = (spec.callable)(params, test_ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "kaput");
    }

    #[tokio::test]
    async fn soft_fail_returns_the_sentinel_shape() {
        let reg = TargetRegistry::new();
        register_builtins(&reg);
        let spec = reg.resolve(SOFT_FAIL).unwrap();
        let params = spec.schema.coerce(&json!({})).unwrap();
        let out = (spec.callable)(params, test_ctx()).await.unwrap();
        assert_eq!(out["success"], json!(false));
    }
}
