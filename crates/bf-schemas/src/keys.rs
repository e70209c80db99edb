//! Ephemeral key and channel naming.
//!
//! Every key has exactly one writer at a time (see the ownership rules on
//! the types in [`crate::model`]); centralizing the naming here keeps the
//! writer/reader pairs honest.

use bf_ids::{ExecutionId, PoolId};

/// Staged request, written by the submitter, consumed by the dispatcher.
pub fn pending_key(id: ExecutionId) -> String {
    format!("pending:{id}")
}

/// Worker-facing context, written by the dispatcher, read by the worker,
/// deleted by the result path.
pub fn context_key(id: ExecutionId) -> String {
    format!("exec:{id}:context")
}

/// Rendezvous list for synchronous waiters, pushed by the result path.
pub fn result_key(id: ExecutionId) -> String {
    format!("result:{id}")
}

/// Pool heartbeat registration, refreshed by the pool manager.
pub fn registration_key(pool_id: PoolId) -> String {
    format!("pool:{pool_id}")
}

/// Well-known cancel pub/sub channel.
pub const CANCEL_CHANNEL: &str = "cancel";

/// Per-execution progress channel.
pub fn progress_channel(id: ExecutionId) -> String {
    format!("progress:{id}")
}

/// Per-tenant progress channel.
pub fn tenant_progress_channel(tenant_id: &str) -> String {
    format!("progress:tenant:{tenant_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_embed_the_execution_id() {
        let id = ExecutionId::generate();
        assert_eq!(pending_key(id), format!("pending:{id}"));
        assert_eq!(context_key(id), format!("exec:{id}:context"));
        assert_eq!(result_key(id), format!("result:{id}"));
        assert_eq!(progress_channel(id), format!("progress:{id}"));
    }
}
