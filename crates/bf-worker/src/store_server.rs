//! Parent-side ephemeral-store endpoint for spawned workers.
//!
//! Workers running as OS children cannot share the in-process store, so the
//! scheduler serves a minimal get/delete line protocol over a Unix socket.
//! One JSON object per line in each direction:
//!
//! ```text
//! -> {"op":"get","key":"exec:<id>:context"}
//! <- {"ok":true,"value":{...}}
//! ```
//!
//! Only the operations a worker needs are exposed; everything else stays
//! inside the scheduler process.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use bf_schemas::EphemeralStore;

#[derive(Deserialize)]
struct StoreRequest {
    op: String,
    key: String,
}

/// Bind the socket and serve store requests until the task is dropped.
/// Returns once the listener is bound, spawning the accept loop.
pub async fn serve_store(store: Arc<dyn EphemeralStore>, socket_path: &Path) -> Result<()> {
    // A stale socket file from a previous run would make bind fail.
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind store socket {}", socket_path.display()))?;
    debug!(path = %socket_path.display(), "store socket listening");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let store = store.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(store, stream).await {
                            debug!(error = %e, "store connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "store socket accept failed");
                    break;
                }
            }
        }
    });

    Ok(())
}

async fn serve_connection(store: Arc<dyn EphemeralStore>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<StoreRequest>(&line) {
            Ok(req) => handle_request(&store, req).await,
            Err(e) => json!({"ok": false, "error": format!("malformed request: {e}")}),
        };
        let mut out = response.to_string();
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn handle_request(store: &Arc<dyn EphemeralStore>, req: StoreRequest) -> Value {
    match req.op.as_str() {
        "get" => match store.get(&req.key).await {
            Ok(value) => json!({"ok": true, "value": value}),
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        },
        "delete" => match store.delete(&req.key).await {
            Ok(()) => json!({"ok": true, "value": null}),
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        },
        other => json!({"ok": false, "error": format!("unsupported op: {other}")}),
    }
}
