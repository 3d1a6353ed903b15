//! Child-process runner guarded by two independent watchdogs.
//!
//! The absolute deadline bounds total runtime; the idle deadline resets on
//! every chunk of observed output. Whichever fires first kills the child and
//! tags the failure with its timeout kind.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ExecError, TimeoutKind};

#[derive(Debug, Clone, Copy)]
pub struct WatchdogLimits {
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Successful command result. Serializable so it can live in the result
/// cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOutcome {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

enum StreamEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<StreamEvent>, wrap: fn(Vec<u8>) -> StreamEvent)
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Run `command` to completion under both watchdogs. Non-zero exit and
/// spawn failure are errors carrying the captured output and duration.
pub async fn run(
    command: &str,
    args: &[String],
    cwd: Option<&Path>,
    limits: &WatchdogLimits,
) -> Result<CommandOutcome, ExecError> {
    let started = std::time::Instant::now();

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| ExecError::CommandFailed {
        message: format!("failed to spawn {}: {}", command, e),
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration: started.elapsed(),
    })?;

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone(), StreamEvent::Stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx.clone(), StreamEvent::Stderr);
    }
    drop(tx);

    let hard_deadline = Instant::now() + limits.command_timeout;
    let mut idle_deadline = Instant::now() + limits.idle_timeout;
    let mut stdout_buf: Vec<u8> = Vec::new();
    let mut stderr_buf: Vec<u8> = Vec::new();

    let status = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(StreamEvent::Stdout(chunk)) => {
                    stdout_buf.extend_from_slice(&chunk);
                    idle_deadline = Instant::now() + limits.idle_timeout;
                }
                Some(StreamEvent::Stderr(chunk)) => {
                    stderr_buf.extend_from_slice(&chunk);
                    idle_deadline = Instant::now() + limits.idle_timeout;
                }
                // Both pipes closed; only exit (or a watchdog) remains.
                None => match wait_with_deadlines(&mut child, hard_deadline, idle_deadline).await {
                    Ok(status) => break status,
                    Err(kind) => {
                        return Err(
                            killed(&mut child, kind, command, stdout_buf, stderr_buf, started)
                                .await,
                        );
                    }
                },
            },
            _ = tokio::time::sleep_until(hard_deadline) => {
                return Err(killed(
                    &mut child,
                    TimeoutKind::Command,
                    command,
                    stdout_buf,
                    stderr_buf,
                    started,
                )
                .await);
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                return Err(killed(
                    &mut child,
                    TimeoutKind::Idle,
                    command,
                    stdout_buf,
                    stderr_buf,
                    started,
                )
                .await);
            }
        }
    };

    let duration = started.elapsed();
    let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

    if status.success() {
        debug!(command, duration_ms = duration.as_millis() as u64, "Command succeeded");
        return Ok(CommandOutcome {
            code: 0,
            stdout,
            stderr,
            duration_ms: duration.as_millis() as u64,
            success: true,
        });
    }

    let code = status.code();
    warn!(command, code = ?code, "Command failed");
    Err(ExecError::CommandFailed {
        message: match code {
            Some(c) => format!("{} exited with code {}", command, c),
            None => format!("{} terminated by signal", command),
        },
        exit_code: code,
        stdout,
        stderr,
        duration,
    })
}

/// Await exit after the pipes closed, still bounded by both deadlines. A
/// child that closed its pipes can no longer make observable progress, so
/// the idle deadline keeps running.
async fn wait_with_deadlines(
    child: &mut Child,
    hard_deadline: Instant,
    idle_deadline: Instant,
) -> Result<std::process::ExitStatus, TimeoutKind> {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Ok(status),
            // wait() failing after a successful spawn means the child is
            // unreapable; report it on the absolute-deadline path.
            Err(_) => Err(TimeoutKind::Command),
        },
        _ = tokio::time::sleep_until(hard_deadline) => Err(TimeoutKind::Command),
        _ = tokio::time::sleep_until(idle_deadline) => Err(TimeoutKind::Idle),
    }
}

async fn killed(
    child: &mut Child,
    kind: TimeoutKind,
    command: &str,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    started: std::time::Instant,
) -> ExecError {
    warn!(command, timeout = %kind, "Watchdog killing command");
    if child.start_kill().is_ok() {
        let _ = child.wait().await;
    }
    ExecError::TimeoutKilled {
        kind,
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        duration: started.elapsed(),
    }
}

impl WatchdogLimits {
    pub fn new(command_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            command_timeout,
            idle_timeout,
        }
    }
}
