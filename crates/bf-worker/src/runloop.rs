//! The worker's Run loop and process shell.
//!
//! Startup order: read env config, install the SIGTERM handler, populate
//! the registry, announce `Ready`, then serve `Run` messages one at a time.
//! SIGTERM while idle exits immediately; SIGTERM while busy gives the
//! current execution the grace window to finish, then abandons it (the
//! manager emits the synthetic result) and exits 0.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bf_ids::ExecutionId;
use bf_resolver::{ParamSchema, ParamType, TargetRegistry};
use bf_schemas::{ControlMsg, ExecutionKind, WorkerMsg};

use crate::execute::{execute, ContextSource};

/// Target that terminates the worker process without emitting a result;
/// exists to exercise crash detection. Only registered in the OS worker.
pub const EXIT_NOW: &str = "builtin:exit_now";

/// Register targets that only make sense inside a disposable OS process.
pub fn register_process_builtins(registry: &TargetRegistry) {
    registry.register(
        EXIT_NOW,
        ExecutionKind::Tool,
        30,
        ParamSchema::new().optional("code", ParamType::Integer, Some(json!(7))),
        Arc::new(|params, _ctx| {
            Box::pin(async move {
                let code = params.get("code").and_then(Value::as_i64).unwrap_or(7);
                process::exit(code as i32);
            })
        }),
    );
}

// ---------------------------------------------------------------------------
// WorkerEnv
// ---------------------------------------------------------------------------

/// Process-level configuration, read from the spawn environment.
#[derive(Clone, Debug)]
pub struct WorkerEnv {
    pub pool_id: Option<String>,
    pub process_id: u64,
    pub graceful_shutdown: Duration,
    pub store_socket: std::path::PathBuf,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self> {
        let process_id = std::env::var("BF_PROCESS_ID")
            .context("missing env var BF_PROCESS_ID")?
            .parse()
            .context("BF_PROCESS_ID must be an integer")?;
        let graceful_shutdown = std::env::var("BF_GRACE_SECONDS")
            .ok()
            .map(|s| s.parse::<f64>())
            .transpose()
            .context("BF_GRACE_SECONDS must be a number")?
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(5));
        let store_socket = std::env::var("BF_STORE_SOCKET")
            .context("missing env var BF_STORE_SOCKET")?
            .into();

        Ok(Self {
            pool_id: std::env::var("BF_POOL_ID").ok(),
            process_id,
            graceful_shutdown,
            store_socket,
        })
    }
}

// ---------------------------------------------------------------------------
// run_worker
// ---------------------------------------------------------------------------

enum AfterRun {
    Continue,
    Exit,
}

/// Serve the control channel until Terminate, stdin EOF, or SIGTERM.
pub async fn run_worker(
    env: WorkerEnv,
    registry: TargetRegistry,
    source: Arc<dyn ContextSource>,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    // All outbound messages funnel through one writer task so lines never
    // interleave.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerMsg>();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = out_rx.recv().await {
            let Ok(mut line) = msg.to_line() else { continue };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let emit = {
        let out_tx = out_tx.clone();
        move |msg: WorkerMsg| {
            let _ = out_tx.send(msg);
        }
    };

    let _ = out_tx.send(WorkerMsg::Ready {
        pid: process::id(),
    });
    info!(process_id = env.process_id, pool_id = ?env.pool_id, "worker ready");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                match line.context("control channel read failed")? {
                    None => {
                        debug!("control channel closed; exiting");
                        break;
                    }
                    Some(line) => match ControlMsg::from_line(&line) {
                        Ok(ControlMsg::Run { id }) => {
                            match run_one(&env, &registry, source.as_ref(), id, &emit, &mut sigterm)
                                .await
                            {
                                AfterRun::Continue => {}
                                AfterRun::Exit => break,
                            }
                        }
                        Ok(ControlMsg::Terminate) => {
                            debug!("terminate received; exiting");
                            break;
                        }
                        Err(e) => warn!(error = %e, "unparseable control line: {line:?}"),
                    },
                }
            }
            _ = sigterm.recv() => {
                debug!("SIGTERM while idle; exiting");
                break;
            }
        }
    }

    Ok(())
}

/// Drive one execution, racing it against graceful shutdown. Emits exactly
/// one `Result` unless the grace window expires first, in which case the
/// execution is abandoned and the manager's synthetic result stands.
async fn run_one(
    env: &WorkerEnv,
    registry: &TargetRegistry,
    source: &dyn ContextSource,
    id: ExecutionId,
    emit: &(dyn Fn(WorkerMsg) + Send + Sync),
    sigterm: &mut tokio::signal::unix::Signal,
) -> AfterRun {
    let exec = execute(registry, source, id, emit);
    tokio::pin!(exec);

    let mut grace_deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            outcome = &mut exec => {
                emit(WorkerMsg::Result { id, outcome });
                return if grace_deadline.is_some() {
                    AfterRun::Exit
                } else {
                    AfterRun::Continue
                };
            }
            _ = sigterm.recv(), if grace_deadline.is_none() => {
                debug!(%id, grace_s = env.graceful_shutdown.as_secs_f64(),
                    "SIGTERM while busy; entering grace window");
                grace_deadline = Some(Instant::now() + env.graceful_shutdown);
            }
            _ = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)),
                if grace_deadline.is_some() =>
            {
                warn!(%id, "grace window expired; abandoning execution");
                return AfterRun::Exit;
            }
        }
    }
}
