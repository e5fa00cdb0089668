//! ffmpeg subprocess lifecycle.
//!
//! A [`ProcessRunner`] owns exactly one child process for one session. The
//! three pipes are split up at spawn time so that each has a single owner:
//!
//! - stdin stays on the runner and is written by the session's receive loop;
//! - stdout is handed out once via [`ProcessRunner::take_output`] and read by
//!   the output relay task;
//! - stderr is drained by a background task that logs it and keeps a short
//!   tail for the exit report.
//!
//! The child itself is moved into a supervisor task which waits for exit and
//! terminates the process when the session's cancellation token fires.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::output::OutputReader;

/// Default size of a single stdout read.
pub const DEFAULT_OUTPUT_CHUNK_SIZE: usize = 4096;

/// Number of stderr lines kept for [`ExitResult::stderr_tail`].
const STDERR_TAIL_LINES: usize = 20;

/// How long `wait` lingers for the stderr drain once the process has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for spawning a transcode process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path to the binary (`ffmpeg` by default).
    pub program: PathBuf,
    /// Grace period between SIGINT and SIGKILL on cancellation.
    pub terminate_timeout: Duration,
    /// Size of a single stdout read.
    pub output_chunk_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            terminate_timeout: Duration::from_secs(5),
            output_chunk_size: DEFAULT_OUTPUT_CHUNK_SIZE,
        }
    }
}

impl RunnerConfig {
    /// Create a config for the given binary with default timings.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Set the SIGINT → SIGKILL grace period.
    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Set the stdout read size.
    #[must_use]
    pub const fn with_output_chunk_size(mut self, size: usize) -> Self {
        self.output_chunk_size = size;
        self
    }
}

/// Lifecycle of a spawned process as seen by its runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Process started, stdin open.
    Running,
    /// stdin closed; the process may still be producing output.
    InputClosed,
    /// Process exit has been observed through [`ProcessRunner::wait`].
    Exited,
}

/// Why the process stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited on its own.
    Completed,
    /// The process was terminated because the session was cancelled.
    Cancelled,
    /// Exit status could not be determined.
    IoFailure(String),
}

/// Termination report for a process.
#[derive(Debug, Clone)]
pub struct ExitResult {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if any (unix only).
    pub signal: Option<i32>,
    pub reason: ExitReason,
    /// Last lines the process wrote to stderr.
    pub stderr_tail: Vec<String>,
}

impl ExitResult {
    fn from_status(status: ExitStatus, reason: ExitReason) -> Self {
        Self {
            code: status.code(),
            signal: exit_signal(status),
            reason,
            stderr_tail: Vec::new(),
        }
    }

    fn io_failure(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: None,
            reason: ExitReason::IoFailure(reason.into()),
            stderr_tail: Vec::new(),
        }
    }

    /// Whether the process completed on its own with exit code 0.
    pub fn success(&self) -> bool {
        self.reason == ExitReason::Completed && self.code == Some(0)
    }
}

impl fmt::Display for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.reason, self.code, self.signal) {
            (ExitReason::IoFailure(reason), _, _) => write!(f, "unknown exit status ({reason})"),
            (reason, Some(code), _) => write!(f, "exit code {code} ({reason:?})"),
            (reason, None, Some(signal)) => write!(f, "killed by signal {signal} ({reason:?})"),
            (reason, None, None) => write!(f, "no exit status ({reason:?})"),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Handle to one running transcode process.
pub struct ProcessRunner {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<OutputReader>,
    state: RunnerState,
    supervisor: Option<JoinHandle<ExitResult>>,
    stderr_drain: Option<JoinHandle<Vec<String>>>,
}

impl ProcessRunner {
    /// Spawn the configured program with `args`, bound to `cancel`.
    ///
    /// Cancelling the token at any later point terminates the process. If
    /// pipe setup fails after the process started, the child is killed when
    /// it is dropped, so no partial state is left running.
    pub fn spawn(
        config: &RunnerConfig,
        cancel: CancellationToken,
        args: &[String],
    ) -> Result<Self, SubprocessError> {
        info!(
            program = %config.program.display(),
            ?args,
            "Spawning transcode subprocess"
        );

        let mut cmd = Command::new(&config.program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            program: config.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or(SubprocessError::PipeUnavailable("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SubprocessError::PipeUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SubprocessError::PipeUnavailable("stderr"))?;

        let stderr_drain = tokio::spawn(drain_stderr(stderr, pid));
        let supervisor = tokio::spawn(supervise(child, cancel, config.terminate_timeout, pid));

        debug!(pid, "Subprocess running");

        Ok(Self {
            pid,
            stdin: Some(stdin),
            stdout: Some(OutputReader::new(stdout, config.output_chunk_size, pid)),
            state: RunnerState::Running,
            supervisor: Some(supervisor),
            stderr_drain: Some(stderr_drain),
        })
    }

    /// OS process id, if the platform reported one.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub const fn state(&self) -> RunnerState {
        self.state
    }

    /// Write raw bytes to the process's stdin.
    ///
    /// An empty chunk is a no-op, even after input was closed.
    pub async fn write_input(&mut self, chunk: &[u8]) -> Result<(), SubprocessError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let stdin = self.stdin.as_mut().ok_or(SubprocessError::InputClosed)?;
        stdin
            .write_all(chunk)
            .await
            .map_err(|e| SubprocessError::WriteFailed {
                reason: e.to_string(),
            })
    }

    /// Close stdin so the process sees end-of-input. Idempotent.
    ///
    /// stdout is not touched: it belongs to whoever took the [`OutputReader`].
    pub fn close_input(&mut self) {
        if self.stdin.take().is_some() {
            debug!(pid = self.pid, "Closed subprocess stdin");
        }
        if self.state == RunnerState::Running {
            self.state = RunnerState::InputClosed;
        }
    }

    /// Take the stdout reader. Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<OutputReader> {
        self.stdout.take()
    }

    /// Wait for the process to exit and report how it ended.
    ///
    /// Closes stdin first if it is still open. Only the first call observes
    /// the real exit; later calls report an `IoFailure`.
    pub async fn wait(&mut self) -> ExitResult {
        self.close_input();

        let Some(supervisor) = self.supervisor.take() else {
            return ExitResult::io_failure("process already awaited");
        };
        let mut result = supervisor
            .await
            .unwrap_or_else(|e| ExitResult::io_failure(format!("supervisor task failed: {e}")));

        if let Some(drain) = self.stderr_drain.take() {
            match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, drain).await {
                Ok(Ok(tail)) => result.stderr_tail = tail,
                Ok(Err(e)) => debug!(pid = self.pid, error = %e, "stderr drain task failed"),
                Err(_) => debug!(pid = self.pid, "stderr still open after exit"),
            }
        }

        self.state = RunnerState::Exited;
        result
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        // Aborting the supervisor drops the child, and kill_on_drop reaps it.
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Own the child until it exits or the session is cancelled.
async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    terminate_timeout: Duration,
    pid: Option<u32>,
) -> ExitResult {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                debug!(pid, ?status, "Subprocess exited");
                ExitResult::from_status(status, ExitReason::Completed)
            }
            Err(e) => {
                warn!(pid, error = %e, "Error waiting for subprocess");
                ExitResult::io_failure(e.to_string())
            }
        },
        () = cancel.cancelled() => terminate(&mut child, terminate_timeout, pid).await,
    }
}

/// SIGINT first so ffmpeg can finalize, SIGKILL after `timeout`.
async fn terminate(child: &mut Child, timeout: Duration, pid: Option<u32>) -> ExitResult {
    debug!(pid, "Terminating subprocess");

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process ID obtained from our own Child handle,
            // which has not been reaped yet. kill(2) with SIGINT is safe to call.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGINT");
            }
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pid, ?status, "Subprocess exited after interrupt");
            ExitResult::from_status(status, ExitReason::Cancelled)
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Error waiting for interrupted subprocess, killing");
            child.kill().await.ok();
            cancelled_without_status()
        }
        Err(_) => {
            warn!(pid, "Timeout waiting for graceful shutdown, killing");
            child.kill().await.ok();
            match child.wait().await {
                Ok(status) => ExitResult::from_status(status, ExitReason::Cancelled),
                Err(_) => cancelled_without_status(),
            }
        }
    }
}

const fn cancelled_without_status() -> ExitResult {
    ExitResult {
        code: None,
        signal: None,
        reason: ExitReason::Cancelled,
        stderr_tail: Vec::new(),
    }
}

/// Keep stderr flowing so the process never blocks on a full pipe.
async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                if text.is_empty() {
                    continue;
                }
                debug!(pid, "stderr: {}", text);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(text);
            }
            Err(e) => {
                debug!(pid, error = %e, "stderr read failed");
                break;
            }
        }
    }
    debug!(pid, "stderr reader finished");
    tail.into()
}

/// Errors from subprocess operations.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to capture subprocess {0}")]
    PipeUnavailable(&'static str),

    #[error("Subprocess input already closed")]
    InputClosed,

    #[error("Failed to write to subprocess stdin: {reason}")]
    WriteFailed { reason: String },
}
