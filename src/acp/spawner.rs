//! Agent process spawning and supervision.
//!
//! Spawns the ACP agent child with all three stdio streams piped and
//! `kill_on_drop(true)` so the process is cleaned up automatically. The
//! child inherits the parent environment verbatim (credential resolution is
//! the agent's own business) plus any explicitly passed variables.
//!
//! On Windows the command is run through `%COMSPEC% /C` so `.cmd` script
//! shims resolve; elsewhere it is executed directly.
//!
//! The exit monitor task is the sole owner of the [`Child`] handle: it
//! awaits process exit, publishes an [`ExitInfo`] on a watch channel, and —
//! when the kill token fires — runs the SIGTERM → 1 s grace → SIGKILL
//! escalation itself so nobody else needs mutable access to the child.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::AgentMessage;
use crate::transport::TransportHooks;
use crate::{AppError, Result};

/// Grace period between the termination signal and the forced kill.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// A resolved agent invocation: program, arguments, extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    /// Build a command with no extra environment.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    /// The invocation as a single loggable string.
    #[must_use]
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Human-readable exit description.
    pub reason: String,
}

/// Piped stdio handles of a freshly spawned agent.
pub struct SpawnedAgent {
    /// Child handle; hand it to [`monitor_exit`].
    pub child: Child,
    /// OS process id, when still available.
    pub pid: Option<u32>,
    /// Agent's stdin for the JSON-RPC writer task.
    pub stdin: ChildStdin,
    /// Agent's stdout for the JSON-RPC reader task.
    pub stdout: ChildStdout,
    /// Agent's stderr for the logger task.
    pub stderr: ChildStderr,
}

/// Spawn the agent process with piped stdio.
///
/// # Errors
///
/// Returns [`AppError::Spawn`] with the classified OS detail (`ENOENT`,
/// `EACCES`, …) when the process cannot be started, or when a stdio handle
/// cannot be captured.
pub fn spawn_agent(command: &AgentCommand) -> Result<SpawnedAgent> {
    let mut cmd = build_command(command);

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|err| AppError::from_spawn_io(&err))?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    info!(command = %command.display(), pid, "agent process spawned");

    Ok(SpawnedAgent {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

#[cfg(windows)]
fn build_command(command: &AgentCommand) -> Command {
    // Script shims (.cmd/.bat) only resolve through the command interpreter.
    let comspec = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_owned());
    let mut cmd = Command::new(comspec);
    cmd.arg("/C").arg(&command.program).args(&command.args);
    cmd
}

#[cfg(not(windows))]
fn build_command(command: &AgentCommand) -> Command {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd
}

// ── Exit monitor ─────────────────────────────────────────────────────────────

/// Spawn the task that owns the child and supervises its exit.
///
/// The task resolves in one of two ways:
///
/// - The child exits on its own: the [`ExitInfo`] is published on
///   `exit_tx` immediately.
/// - `kill` fires: the child receives SIGTERM (a plain kill on platforms
///   without it), gets [`KILL_GRACE`] to exit, is then SIGKILLed, and the
///   resulting [`ExitInfo`] is published.
#[must_use]
pub fn monitor_exit(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let info = exit_info_from_wait(result);
                info!(reason = %info.reason, "agent process exited");
                let _ = exit_tx.send(Some(info));
            }
            () = kill.cancelled() => {
                terminate(&mut child, pid).await;
                let result = child.wait().await;
                let info = exit_info_from_wait(result);
                debug!(reason = %info.reason, "agent process terminated on request");
                let _ = exit_tx.send(Some(info));
            }
        }
    })
}

/// Graceful-then-forced termination of the child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if send_term_signal(pid) {
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => return,
            Err(_) => {
                warn!("agent did not exit within the grace period, forcing kill");
            }
        }
    }
    if let Err(err) = child.kill().await {
        warn!(%err, "failed to force-kill agent process");
    }
}

/// Ask the process to terminate gracefully. Returns `false` when no
/// graceful signal could be delivered (the caller then force-kills).
#[cfg(unix)]
fn send_term_signal(pid: Option<u32>) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    #[allow(clippy::cast_possible_wrap)]
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(%err, pid, "SIGTERM delivery failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_term_signal(_pid: Option<u32>) -> bool {
    // No graceful signal on this platform; escalate straight to kill.
    false
}

fn exit_info_from_wait(result: std::io::Result<std::process::ExitStatus>) -> ExitInfo {
    match result {
        Ok(status) => {
            let code = status.code();
            let reason = code.map_or_else(
                || "process terminated by signal".to_owned(),
                |code| format!("process exited with code {code}"),
            );
            ExitInfo { code, reason }
        }
        Err(err) => ExitInfo {
            code: None,
            reason: format!("wait error: {err}"),
        },
    }
}

// ── Stderr logger ────────────────────────────────────────────────────────────

/// Spawn the task that drains the agent's stderr.
///
/// Every line is logged; the transport's
/// [`handle_stderr`](TransportHooks::handle_stderr) hook may additionally
/// synthesize an agent-message, which is forwarded to `events`.
#[must_use]
pub fn spawn_stderr_logger(
    stderr: ChildStderr,
    hooks: Arc<dyn TransportHooks>,
    events: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(stderr = %line, "agent stderr");
                            if let Some(msg) = hooks.handle_stderr(&line) {
                                if events.send(msg).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(%err, "agent stderr read failed, stopping logger");
                            break;
                        }
                    }
                }
            }
        }
    })
}
