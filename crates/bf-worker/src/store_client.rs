//! Worker-side client for the scheduler's store socket.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use bf_ids::ExecutionId;
use bf_schemas::{context_key, ContextRecord};

use crate::execute::ContextSource;

/// Fetches execution context over the parent's Unix socket. A connection
/// per request: context is read once per Run, and reconnecting keeps the
/// client free of broken-pipe bookkeeping.
pub struct SocketContextSource {
    socket_path: PathBuf,
}

impl SocketContextSource {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn request(&self, payload: Value) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connect store socket {}", self.socket_path.display()))?;
        let (reader, mut writer) = stream.into_split();

        let mut line = payload.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;

        let mut lines = BufReader::new(reader).lines();
        let response = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("store socket closed before responding"))?;
        let response: Value = serde_json::from_str(&response)?;

        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown store error");
            return Err(anyhow!("store request failed: {err}"));
        }
        Ok(response.get("value").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ContextSource for SocketContextSource {
    async fn fetch(&self, id: ExecutionId) -> Result<Option<ContextRecord>> {
        let value = self
            .request(json!({"op": "get", "key": context_key(id)}))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}
