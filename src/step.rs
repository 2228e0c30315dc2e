//! Step executor: one shell command, one [`RetVal`].
//!
//! Commands run through a real shell (`sh -c`) so pipes, redirects,
//! globs, and variable expansion behave the way a test author expects.
//! That is the point of the tool, not an accident: no argv-exec, no
//! sandboxing.
//!
//! The execution mode is chosen by a prefix on the command string:
//!
//! - `spawn:<cmd>`: fire and forget; returns immediately, no output
//!   captured, no handle retained.
//! - `timeout<N>:<cmd>`: bounded wait; the command is killed and reaped
//!   at N seconds, reporting whatever output was captured by then.
//! - anything else: wait for natural completion.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::RetVal;

/// Grace period for draining output pipes after a timeout kill.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How a step's command is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StepMode {
    /// Wait for natural completion, capture output.
    Normal,
    /// Launch and return immediately; the child is not tracked.
    Spawn,
    /// Wait up to `seconds`, then kill and reap.
    Timeout {
        /// Deadline in whole seconds.
        seconds: u64,
    },
}

/// One command plus its execution mode.
///
/// Created from configuration, owned by exactly one [`Phase`](crate::phase::Phase),
/// never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// The shell command, with any mode prefix already stripped.
    pub command: String,
    /// Execution mode.
    #[serde(flatten)]
    pub mode: StepMode,
}

impl Step {
    /// Creates a step with an explicit mode.
    pub fn new(command: impl Into<String>, mode: StepMode) -> Self {
        Self {
            command: command.into(),
            mode,
        }
    }

    /// Parses a raw command string, honoring the mode prefixes.
    ///
    /// Prefixes are case-sensitive and checked in priority order:
    /// `spawn:` first, then `timeout<N>:`. A string that merely
    /// resembles a prefix (`timeoutx:`, `Spawn:`) is a normal command.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(cmd) = raw.strip_prefix("spawn:") {
            return Self::new(cmd, StepMode::Spawn);
        }
        if let Some(rest) = raw.strip_prefix("timeout") {
            if let Some((digits, cmd)) = rest.split_once(':') {
                if !digits.is_empty() {
                    if let Ok(seconds) = digits.parse::<u64>() {
                        return Self::new(cmd, StepMode::Timeout { seconds });
                    }
                }
            }
        }
        Self::new(raw, StepMode::Normal)
    }

    /// Executes this step, producing exactly one result.
    ///
    /// Never returns an error: launch failures, non-zero exits, and
    /// missing executables are all degraded to `RetVal{Error, reason}`.
    pub async fn run(&self) -> RetVal {
        debug!(command = %self.command, mode = ?self.mode, "executing step");
        match self.mode {
            StepMode::Spawn => self.run_spawn(),
            StepMode::Normal => self.run_normal().await,
            StepMode::Timeout { seconds } => self.run_with_timeout(seconds).await,
        }
    }

    fn shell(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command).stdin(Stdio::null());
        cmd
    }

    /// Fire-and-forget launch. The child's lifetime is intentionally
    /// decoupled from the executor; cleanup belongs to a Reset step.
    fn run_spawn(&self) -> RetVal {
        let mut cmd = self.shell();
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        match cmd.spawn() {
            Ok(child) => {
                debug!(command = %self.command, pid = child.id(), "spawned");
                drop(child);
                RetVal::ok("spawned")
            }
            Err(e) => RetVal::error(format!("failed to spawn '{}': {e}", self.command)),
        }
    }

    async fn run_normal(&self) -> RetVal {
        match self.shell().output().await {
            Ok(output) => {
                let text = combined_output(&output.stdout, &output.stderr);
                if output.status.success() {
                    RetVal::ok(text)
                } else {
                    RetVal::error(format!("{text}\n{}", output.status))
                }
            }
            Err(e) => RetVal::error(format!("failed to run '{}': {e}", self.command)),
        }
    }

    /// Bounded wait. The deadline kill targets the direct `sh` child
    /// only; grandchildren it launched keep running and may hold the
    /// output pipes open, which is why the drains are finished with a
    /// grace period instead of waiting for EOF.
    async fn run_with_timeout(&self, seconds: u64) -> RetVal {
        let mut cmd = self.shell();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return RetVal::error(format!("failed to run '{}': {e}", self.command)),
        };

        let stdout_drain = PipeDrain::start(child.stdout.take());
        let stderr_drain = PipeDrain::start(child.stderr.take());

        match tokio::time::timeout(Duration::from_secs(seconds), child.wait()).await {
            Ok(Ok(status)) => {
                let text = combined_output(
                    &stdout_drain.finish(None).await,
                    &stderr_drain.finish(None).await,
                );
                if status.success() {
                    RetVal::ok(text)
                } else {
                    RetVal::error(format!("{text}\n{status}"))
                }
            }
            Ok(Err(e)) => RetVal::error(format!("failed to wait for '{}': {e}", self.command)),
            Err(_) => {
                warn!(command = %self.command, seconds, "deadline reached, killing");
                if let Err(e) = child.start_kill() {
                    warn!(command = %self.command, "kill failed: {e}");
                }
                // Reap before reporting; the kill is not complete until
                // the child has been waited on.
                let _ = child.wait().await;
                let text = combined_output(
                    &stdout_drain.finish(Some(KILL_DRAIN_GRACE)).await,
                    &stderr_drain.finish(Some(KILL_DRAIN_GRACE)).await,
                );
                RetVal::ok(format!("killed after {seconds}s\n{text}"))
            }
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            StepMode::Normal => write!(f, "{}", self.command),
            StepMode::Spawn => write!(f, "spawn:{}", self.command),
            StepMode::Timeout { seconds } => write!(f, "timeout{seconds}:{}", self.command),
        }
    }
}

/// Incremental drain of one output pipe.
///
/// Chunks are appended to a shared buffer as they arrive, so output
/// captured before a timeout kill survives even when a grandchild keeps
/// the pipe open and the reader never sees EOF.
struct PipeDrain {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl PipeDrain {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncReadExt + Send + Unpin + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut reader| {
            let sink = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut guard) = sink.lock() {
                                guard.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Waits for the reader and takes whatever was captured.
    ///
    /// With a grace period, a reader still blocked on an open pipe is
    /// aborted once the period elapses; the buffered bytes are kept.
    async fn finish(self, grace: Option<Duration>) -> Vec<u8> {
        if let Some(task) = self.task {
            match grace {
                None => {
                    let _ = task.await;
                }
                Some(grace) => {
                    let abort = task.abort_handle();
                    if tokio::time::timeout(grace, task).await.is_err() {
                        abort.abort();
                    }
                }
            }
        }
        self.buf.lock().map(|mut g| std::mem::take(&mut *g)).unwrap_or_default()
    }
}

/// Concatenates stdout and stderr with lossy UTF-8 decoding.
fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(stderr));
    text
}
