//! External command invocation with process-group cleanup.
//!
//! Every command is started as the leader of a new process group. A monitor
//! task owns the child: it reaps it on normal exit, or kills the whole group
//! when the caller's [`OpContext`] finishes or a [`InvokeResult::wait_for`]
//! deadline elapses. Because only the monitor touches the child handle, the
//! kill path and the reap path can never both act on the same process.

use crate::context::OpContext;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to keep reading output after the leader exits. Background
/// children may hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to start '{executable}': {source}")]
    Start {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out")]
    TimedOut,

    #[error("command cancelled")]
    Cancelled,

    #[error("'{executable}' exited with {status}: {output}")]
    Exited {
        executable: String,
        status: ExitStatus,
        output: String,
    },

    #[error("'{executable}' finished without printing {expected:?}")]
    OutputNotFound { executable: String, expected: String },

    #[error("waiting for '{executable}' failed: {reason}")]
    Wait { executable: String, reason: String },
}

/// Starts external commands.
pub trait Invoker: Send + Sync {
    /// Starts `executable` and returns as soon as it is running.
    ///
    /// `env` entries are `KEY=value` strings added on top of the inherited
    /// environment.
    fn invoke(
        &self,
        ctx: &OpContext,
        executable: &str,
        args: &[String],
        env: &[String],
    ) -> Result<Box<dyn InvokeResult>, InvokeError>;
}

/// Handle to a started command.
#[async_trait]
pub trait InvokeResult: Send + Sync {
    /// Waits for the command to finish. A non-zero exit is an error.
    async fn wait(&self) -> Result<(), InvokeError>;

    /// Waits until `text` appears in stdout or stderr.
    ///
    /// If the deadline passes first the process group is killed and
    /// [`InvokeError::TimedOut`] is returned. An empty `text` is satisfied by
    /// any exit of the command.
    async fn wait_for(&self, text: &str, timeout: Duration) -> Result<(), InvokeError>;

    fn stdout(&self) -> String;

    fn stderr(&self) -> String;

    fn pid(&self) -> Option<u32>;
}

/// Runs commands as real child processes, each in its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupInvoker;

impl Invoker for ProcessGroupInvoker {
    fn invoke(
        &self,
        ctx: &OpContext,
        executable: &str,
        args: &[String],
        env: &[String],
    ) -> Result<Box<dyn InvokeResult>, InvokeError> {
        let mut cmd = Command::new(executable);
        cmd.args(args)
            .envs(parse_env(env))
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|source| InvokeError::Start {
            executable: executable.to_string(),
            source,
        })?;
        let pid = child.id();
        debug!(executable, ?args, ?pid, "started process");

        let stdout = OutputBuffer::default();
        let stderr = OutputBuffer::default();
        let readers = [
            capture(child.stdout.take(), stdout.clone()),
            capture(child.stderr.take(), stderr.clone()),
        ];

        let (tx, rx) = watch::channel(None);
        let kill = CancellationToken::new();
        tokio::spawn(monitor(
            child,
            ctx.clone(),
            kill.clone(),
            readers,
            tx,
            executable.to_string(),
        ));

        Ok(Box::new(ProcessHandle {
            executable: executable.to_string(),
            pid,
            stdout,
            stderr,
            exit: rx,
            kill,
        }))
    }
}

fn parse_env(env: &[String]) -> Vec<(&str, &str)> {
    env.iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some(pair) => Some(pair),
            None => {
                warn!(entry = %entry, "ignoring environment entry without '='");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum StopReason {
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
enum Outcome {
    Exited(ExitStatus),
    Stopped(StopReason),
    Failed(String),
}

#[derive(Debug, Clone, Default)]
struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, chunk: &[u8]) {
        self.lock().extend_from_slice(chunk);
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }
}

fn capture<R>(pipe: Option<R>, buf: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buf.append(&chunk[..n]),
                Err(e) => {
                    debug!(error = %e, "output capture stopped");
                    break;
                }
            }
        }
    })
}

enum Race {
    Exited(std::io::Result<ExitStatus>),
    Stop(StopReason),
}

async fn monitor(
    mut child: Child,
    ctx: OpContext,
    kill: CancellationToken,
    readers: [JoinHandle<()>; 2],
    tx: watch::Sender<Option<Outcome>>,
    executable: String,
) {
    let race = tokio::select! {
        status = child.wait() => Race::Exited(status),
        reason = stop_requested(&ctx, &kill) => Race::Stop(reason),
    };

    let outcome = match race {
        Race::Exited(Ok(status)) => Outcome::Exited(status),
        Race::Exited(Err(e)) => Outcome::Failed(e.to_string()),
        Race::Stop(reason) => stop(&mut child, reason, &executable).await,
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    debug!(executable = %executable, ?outcome, "process finished");
    tx.send_replace(Some(outcome));
}

async fn stop_requested(ctx: &OpContext, kill: &CancellationToken) -> StopReason {
    tokio::select! {
        _ = ctx.done() => {
            if ctx.deadline().is_some_and(|d| Instant::now() >= d) {
                StopReason::TimedOut
            } else {
                StopReason::Cancelled
            }
        }
        _ = kill.cancelled() => StopReason::TimedOut,
    }
}

async fn stop(child: &mut Child, reason: StopReason, executable: &str) -> Outcome {
    match child.try_wait() {
        Ok(Some(status)) => {
            info!(executable, "not killing process due to already finished");
            return Outcome::Exited(status);
        }
        Ok(None) => {}
        Err(e) => warn!(executable, error = %e, "failed to poll process before kill"),
    }

    // Not reaped yet, so the pid still names our process group.
    if let Some(pid) = child.id() {
        kill_group(pid);
    }

    match child.wait().await {
        Ok(_) => Outcome::Stopped(reason),
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

fn kill_group(pid: u32) {
    match signal::kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "killed process group"),
        Err(Errno::ESRCH) => info!(pid, "process group already gone"),
        Err(e) => warn!(pid, error = %e, "failed to kill process group"),
    }
}

enum Step {
    Poll,
    MonitorGone,
    Deadline,
}

struct ProcessHandle {
    executable: String,
    pid: Option<u32>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    exit: watch::Receiver<Option<Outcome>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    fn contains(&self, text: &str) -> bool {
        self.stdout.contents().contains(text) || self.stderr.contents().contains(text)
    }

    fn combined_output(&self) -> String {
        let mut out = self.stdout.contents();
        out.push_str(&self.stderr.contents());
        out.trim().to_string()
    }

    fn monitor_gone(&self) -> InvokeError {
        InvokeError::Wait {
            executable: self.executable.clone(),
            reason: "process monitor stopped".to_string(),
        }
    }

    async fn outcome(&self) -> Result<Outcome, InvokeError> {
        let mut exit = self.exit.clone();
        let finished = exit.wait_for(Option::is_some).await;
        match finished {
            Ok(outcome) => (*outcome).clone().ok_or_else(|| self.monitor_gone()),
            Err(_) => Err(self.monitor_gone()),
        }
    }

    fn finish(&self, outcome: Outcome) -> Result<(), InvokeError> {
        match outcome {
            Outcome::Exited(status) if status.success() => Ok(()),
            Outcome::Exited(status) => Err(InvokeError::Exited {
                executable: self.executable.clone(),
                status,
                output: self.combined_output(),
            }),
            Outcome::Stopped(StopReason::TimedOut) => Err(InvokeError::TimedOut),
            Outcome::Stopped(StopReason::Cancelled) => Err(InvokeError::Cancelled),
            Outcome::Failed(reason) => Err(InvokeError::Wait {
                executable: self.executable.clone(),
                reason,
            }),
        }
    }
}

#[async_trait]
impl InvokeResult for ProcessHandle {
    async fn wait(&self) -> Result<(), InvokeError> {
        let outcome = self.outcome().await?;
        self.finish(outcome)
    }

    async fn wait_for(&self, text: &str, timeout: Duration) -> Result<(), InvokeError> {
        let deadline = Instant::now() + timeout;
        let mut exit = self.exit.clone();
        loop {
            if !text.is_empty() && self.contains(text) {
                return Ok(());
            }

            let finished = (*exit.borrow_and_update()).clone();
            if let Some(outcome) = finished {
                return match outcome {
                    Outcome::Exited(_) if text.is_empty() || self.contains(text) => Ok(()),
                    Outcome::Exited(status) if status.success() => {
                        Err(InvokeError::OutputNotFound {
                            executable: self.executable.clone(),
                            expected: text.to_string(),
                        })
                    }
                    other => self.finish(other),
                };
            }

            let step = tokio::select! {
                changed = exit.changed() => match changed {
                    Ok(()) => Step::Poll,
                    Err(_) => Step::MonitorGone,
                },
                _ = tokio::time::sleep(POLL_INTERVAL) => Step::Poll,
                _ = tokio::time::sleep_until(deadline) => Step::Deadline,
            };
            match step {
                Step::Poll => {}
                Step::MonitorGone => return Err(self.monitor_gone()),
                Step::Deadline => {
                    self.kill.cancel();
                    // Return only once the group is gone.
                    let _ = exit.wait_for(Option::is_some).await;
                    return Err(InvokeError::TimedOut);
                }
            }
        }
    }

    fn stdout(&self) -> String {
        self.stdout.contents()
    }

    fn stderr(&self) -> String {
        self.stderr.contents()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_skips_malformed() {
        let env = vec![
            "FOO=bar".to_string(),
            "BROKEN".to_string(),
            "EMPTY=".to_string(),
            "EQ=a=b".to_string(),
        ];
        assert_eq!(
            parse_env(&env),
            vec![("FOO", "bar"), ("EMPTY", ""), ("EQ", "a=b")]
        );
    }

    #[test]
    fn test_output_buffer_is_shared() {
        let buf = OutputBuffer::default();
        let other = buf.clone();
        buf.append(b"hello ");
        other.append(b"world");
        assert_eq!(buf.contents(), "hello world");
    }
}
