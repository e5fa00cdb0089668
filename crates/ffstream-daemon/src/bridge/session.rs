//! Per-session state.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::BridgeError;
use crate::subprocess::ExitResult;

/// Protocol state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the argument message.
    WaitingArgs,
    /// Process spawned, relay not started yet.
    Spawned,
    /// Forwarding client chunks to the process.
    Streaming,
    /// Input closed, waiting for the process and the output relay.
    Draining,
    /// `done` sent.
    Completed,
    Aborted,
}

/// Why a session was cancelled from outside its receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    /// The caller's token fired. Under the gRPC server that is shutdown.
    CallerCancelled,
    /// The client stopped listening for responses.
    ClientDisconnected,
    /// The configured session time limit elapsed.
    DeadlineExceeded(Duration),
    /// Forwarding output to the client failed.
    RelayFailed(String),
}

/// Cancellation signal shared by every task of a session.
///
/// Any task may trigger it with a cause; the first cause wins. A token that
/// was cancelled without a cause was cancelled through its parent.
#[derive(Debug, Clone)]
pub struct SessionAbort {
    token: CancellationToken,
    cause: Arc<OnceLock<AbortCause>>,
}

impl SessionAbort {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            cause: Arc::new(OnceLock::new()),
        }
    }

    /// Record `cause` (unless one is already set) and cancel the session.
    pub fn trigger(&self, cause: AbortCause) {
        if self.cause.set(cause.clone()).is_ok() {
            debug!(?cause, "Session abort triggered");
        }
        self.token.cancel();
    }

    /// Cancel without recording a cause (teardown after a local error).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn cause(&self) -> AbortCause {
        self.cause.get().cloned().unwrap_or(AbortCause::CallerCancelled)
    }

    /// The error a cancelled session reports.
    pub fn error(&self) -> BridgeError {
        self.cause().into()
    }
}

/// One client stream, from first message to `done`.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub argv: Vec<String>,
    pub abort: SessionAbort,
    pub bytes_in: u64,
    pub chunks_in: u64,
}

impl Session {
    pub fn new(abort: SessionAbort) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::WaitingArgs,
            argv: Vec::new(),
            abort,
            bytes_in: 0,
            chunks_in: 0,
        }
    }

    pub fn transition(&mut self, next: SessionState) {
        debug!(session_id = %self.id, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    pub fn record_input(&mut self, len: usize) {
        self.bytes_in += len as u64;
        self.chunks_in += 1;
    }
}

/// What a completed session did.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub argv: Vec<String>,
    pub bytes_in: u64,
    pub chunks_in: u64,
    pub bytes_out: u64,
    pub chunks_out: u64,
    pub exit: ExitResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cause_wins() {
        let abort = SessionAbort::new(CancellationToken::new());
        abort.trigger(AbortCause::ClientDisconnected);
        abort.trigger(AbortCause::RelayFailed("late".into()));
        assert!(abort.is_cancelled());
        assert_eq!(abort.cause(), AbortCause::ClientDisconnected);
    }

    #[test]
    fn parent_cancellation_reads_as_caller_cancelled() {
        let parent = CancellationToken::new();
        let abort = SessionAbort::new(parent.child_token());
        parent.cancel();
        assert!(abort.is_cancelled());
        assert_eq!(abort.cause(), AbortCause::CallerCancelled);
    }

    #[test]
    fn clones_share_state() {
        let abort = SessionAbort::new(CancellationToken::new());
        let other = abort.clone();
        other.trigger(AbortCause::DeadlineExceeded(Duration::from_secs(3)));
        assert_eq!(
            abort.cause(),
            AbortCause::DeadlineExceeded(Duration::from_secs(3))
        );
    }

    #[test]
    fn session_starts_waiting_for_args() {
        let mut session = Session::new(SessionAbort::new(CancellationToken::new()));
        assert_eq!(session.state, SessionState::WaitingArgs);
        session.record_input(10);
        session.record_input(5);
        assert_eq!(session.bytes_in, 15);
        assert_eq!(session.chunks_in, 2);
    }
}
