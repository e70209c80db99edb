//! Worker spawning and the control-channel transport.
//!
//! [`ProcessLauncher`] is the production implementation: it spawns the
//! worker binary with piped stdio, pumps newline-delimited JSON in both
//! directions, and reports child exit as a [`WorkerEvent::Exited`]. The
//! test harness provides a task-backed launcher behind the same
//! [`WorkerLauncher`] trait, so the manager's logic is exercised without
//! OS processes.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use bf_schemas::{ControlMsg, WorkerMsg};

use crate::slot::SlotId;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What a worker surface can report back to the manager.
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    Msg(WorkerMsg),
    /// The child is gone. `code` is the exit status when observable.
    Exited { code: Option<i32> },
}

/// A worker event tagged with the slot that produced it. All workers of a
/// pool share one event channel into the manager loop.
#[derive(Clone, Debug)]
pub struct SlotEvent {
    pub slot_id: SlotId,
    pub event: WorkerEvent,
}

// ---------------------------------------------------------------------------
// WorkerProcess / WorkerLauncher
// ---------------------------------------------------------------------------

/// A live worker owned by one slot. Control messages go through `control`;
/// kills go through the signal methods (graceful first, forced after the
/// grace window).
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;
    fn control(&self) -> &mpsc::UnboundedSender<ControlMsg>;
    /// Graceful stop: SIGTERM for OS children.
    fn signal_terminate(&self);
    /// Forced stop: SIGKILL for OS children.
    fn signal_kill(&self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker for `slot_id`, wiring its events into `events`.
    async fn spawn(
        &self,
        slot_id: SlotId,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<Box<dyn WorkerProcess>>;
}

// ---------------------------------------------------------------------------
// ProcessLauncher
// ---------------------------------------------------------------------------

/// Spawns the worker binary as an OS child process.
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

struct ChildProcess {
    pid: u32,
    control: mpsc::UnboundedSender<ControlMsg>,
}

impl ChildProcess {
    fn send_signal(&self, sig: Signal) {
        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = kill(pid, sig) {
            // ESRCH just means the child already exited; the wait task
            // reports that through the event channel.
            debug!(pid = self.pid, signal = ?sig, error = %e, "signal not delivered");
        }
    }
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn control(&self) -> &mpsc::UnboundedSender<ControlMsg> {
        &self.control
    }

    fn signal_terminate(&self) {
        self.send_signal(Signal::SIGTERM);
    }

    fn signal_kill(&self) {
        self.send_signal(Signal::SIGKILL);
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn spawn(
        &self,
        slot_id: SlotId,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("BF_PROCESS_ID", slot_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker: {}", self.program))?;
        let pid = child.id().context("spawned worker has no pid")?;

        let stdin = child.stdin.take().context("worker stdin not piped")?;
        let stdout = child.stdout.take().context("worker stdout not piped")?;

        // Control writer: serialize ControlMsg as JSON lines onto stdin.
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMsg>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = control_rx.recv().await {
                let Ok(mut line) = msg.to_line() else { continue };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Event reader: parse WorkerMsg JSON lines off stdout.
        {
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match WorkerMsg::from_line(&line) {
                        Ok(msg) => {
                            if events
                                .send(SlotEvent {
                                    slot_id,
                                    event: WorkerEvent::Msg(msg),
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(slot_id, error = %e, "unparseable worker line: {line:?}");
                        }
                    }
                }
            });
        }

        // Exit watcher: reap the child and report its status.
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(slot_id, error = %e, "wait on worker child failed");
                    None
                }
            };
            let _ = events.send(SlotEvent {
                slot_id,
                event: WorkerEvent::Exited { code },
            });
        });

        Ok(Box::new(ChildProcess {
            pid,
            control: control_tx,
        }))
    }
}
