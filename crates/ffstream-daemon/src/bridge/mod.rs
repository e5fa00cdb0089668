//! Stream ↔ process bridge.
//!
//! Data flow for one session:
//! ```text
//! ProcessRequest{args}   → tokenize → spawn
//! ProcessRequest{chunk}  → subprocess stdin
//! ProcessRequest{eof}    → close stdin → wait for exit
//! subprocess stdout      → ProcessResponse{chunk}   (relay task)
//! exit + relay finished  → ProcessResponse{done}
//! ```
//!
//! The receive loop runs on the caller's task. stdout is read by a separate
//! relay task that owns the pipe; a watchdog task turns client disconnects
//! and the optional session deadline into cancellation. Every task shares
//! one [`SessionAbort`], and the process is bound to its token.

mod error;
mod session;

pub use error::BridgeError;
pub use session::{AbortCause, Session, SessionAbort, SessionState, SessionSummary};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use ffstream_core::tokenize;
use ffstream_proto::v1::{ProcessRequest, ProcessResponse};

use crate::subprocess::{
    OutputReader, ProcessRunner, RelayOutcome, RelayReport, RunnerConfig, SubprocessError,
};

/// Outbound half of a session stream.
pub type Outbound = mpsc::Sender<Result<ProcessResponse, Status>>;

/// Bridge configuration shared by every session.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// How transcode processes are spawned.
    pub runner: RunnerConfig,
    /// Upper bound on a whole session, if any.
    pub session_timeout: Option<Duration>,
}

impl BridgeConfig {
    pub const fn new(runner: RunnerConfig) -> Self {
        Self {
            runner,
            session_timeout: None,
        }
    }

    /// Set the session time limit.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }
}

/// Runs transcode sessions.
#[derive(Debug, Clone)]
pub struct StreamBridge {
    config: Arc<BridgeConfig>,
}

impl StreamBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run one session to completion.
    ///
    /// Reads requests from `inbound`, writes responses to `outbound` and
    /// returns once `done` has been sent. Cancelling `cancel` terminates the
    /// process and aborts the session without a `done` message. The session
    /// runs under a child of `cancel` and never cancels it itself.
    ///
    /// On error nothing has been sent for the failure itself; the caller
    /// reports it on the stream.
    pub async fn run_session<S>(
        &self,
        inbound: S,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, BridgeError>
    where
        S: Stream<Item = Result<ProcessRequest, Status>> + Unpin + Send,
    {
        let abort = SessionAbort::new(cancel.child_token());
        let mut session = Session::new(abort.clone());
        let watchdog = spawn_watchdog(abort, outbound.clone(), self.config.session_timeout);

        let result = self.drive(&mut session, inbound, &outbound).await;
        watchdog.abort();

        match &result {
            Ok(summary) => {
                session.transition(SessionState::Completed);
                info!(
                    session_id = %summary.session_id,
                    bytes_in = summary.bytes_in,
                    bytes_out = summary.bytes_out,
                    exit = %summary.exit,
                    "Session completed"
                );
            }
            Err(e) => {
                session.transition(SessionState::Aborted);
                warn!(session_id = %session.id, state = ?session.state, error = %e, "Session aborted");
            }
        }
        result
    }

    async fn drive<S>(
        &self,
        session: &mut Session,
        mut inbound: S,
        outbound: &Outbound,
    ) -> Result<SessionSummary, BridgeError>
    where
        S: Stream<Item = Result<ProcessRequest, Status>> + Unpin + Send,
    {
        let first = tokio::select! {
            biased;
            () = session.abort.cancelled() => return Err(session.abort.error()),
            next = inbound.next() => next,
        };
        let first = match first {
            Some(Ok(request)) => request,
            Some(Err(status)) => return Err(BridgeError::TransportReceive(status)),
            None => return Err(BridgeError::NoArguments),
        };
        if !first.chunk.is_empty() || first.eof {
            warn!(
                session_id = %session.id,
                chunk_len = first.chunk.len(),
                eof = first.eof,
                "Ignoring chunk/eof on argument message"
            );
        }

        session.argv = tokenize(&first.args);
        info!(session_id = %session.id, argv = ?session.argv, "Starting transcode session");

        let mut runner = ProcessRunner::spawn(
            &self.config.runner,
            session.abort.token().clone(),
            &session.argv,
        )
        .map_err(BridgeError::Spawn)?;
        session.transition(SessionState::Spawned);

        let reader = runner
            .take_output()
            .ok_or(BridgeError::Spawn(SubprocessError::PipeUnavailable("stdout")))?;
        let relay = spawn_output_relay(reader, session.abort.clone(), outbound.clone());
        session.transition(SessionState::Streaming);

        if let Err(e) = receive_loop(session, &mut inbound, &mut runner).await {
            teardown(&session.abort, &mut runner, relay).await;
            return Err(e);
        }

        session.transition(SessionState::Draining);
        runner.close_input();
        let exit = runner.wait().await;
        let report = join_relay(relay).await;

        if session.abort.is_cancelled() {
            return Err(session.abort.error());
        }
        if report.outcome != RelayOutcome::EndOfStream {
            // Only reachable if the relay stopped without cancelling the session.
            return Err(BridgeError::Relay(format!("{:?}", report.outcome)));
        }

        if exit.success() {
            debug!(session_id = %session.id, %exit, "Process finished");
        } else {
            warn!(
                session_id = %session.id,
                %exit,
                stderr = ?exit.stderr_tail,
                "Process exited with error"
            );
        }

        outbound
            .send(Ok(ProcessResponse {
                chunk: Vec::new(),
                done: true,
            }))
            .await
            .map_err(|_| BridgeError::from(AbortCause::ClientDisconnected))?;

        Ok(SessionSummary {
            session_id: session.id.clone(),
            argv: session.argv.clone(),
            bytes_in: session.bytes_in,
            chunks_in: session.chunks_in,
            bytes_out: report.bytes,
            chunks_out: report.chunks,
            exit,
        })
    }
}

/// Forward client chunks to stdin until EOF, stream end or failure.
async fn receive_loop<S>(
    session: &mut Session,
    inbound: &mut S,
    runner: &mut ProcessRunner,
) -> Result<(), BridgeError>
where
    S: Stream<Item = Result<ProcessRequest, Status>> + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            biased;
            () = session.abort.cancelled() => return Err(session.abort.error()),
            next = inbound.next() => next,
        };
        let request = match next {
            Some(Ok(request)) => request,
            Some(Err(status)) => return Err(BridgeError::TransportReceive(status)),
            None => {
                debug!(session_id = %session.id, "Client closed its send side without eof");
                return Ok(());
            }
        };

        if !request.chunk.is_empty() {
            let written = tokio::select! {
                biased;
                () = session.abort.cancelled() => return Err(session.abort.error()),
                written = runner.write_input(&request.chunk) => written,
            };
            if let Err(e) = written {
                // A write racing the abort fails with EPIPE; report the abort instead.
                if session.abort.is_cancelled() {
                    return Err(session.abort.error());
                }
                return Err(BridgeError::Write(e));
            }
            session.record_input(request.chunk.len());
        }

        if request.eof {
            debug!(session_id = %session.id, bytes_in = session.bytes_in, "Client sent eof");
            return Ok(());
        }
    }
}

/// Read stdout into `outbound` on its own task.
///
/// A failed send aborts the whole session.
fn spawn_output_relay(
    reader: OutputReader,
    abort: SessionAbort,
    outbound: Outbound,
) -> JoinHandle<RelayReport> {
    tokio::spawn(async move {
        let report = reader
            .relay(abort.token(), |chunk| {
                outbound.send(Ok(ProcessResponse { chunk, done: false }))
            })
            .await;
        match &report.outcome {
            RelayOutcome::SinkFailed(reason) => {
                abort.trigger(AbortCause::RelayFailed(reason.clone()));
            }
            RelayOutcome::ReadFailed(reason) => {
                abort.trigger(AbortCause::RelayFailed(format!(
                    "reading process output: {reason}"
                )));
            }
            RelayOutcome::EndOfStream | RelayOutcome::Cancelled => {}
        }
        report
    })
}

async fn join_relay(relay: JoinHandle<RelayReport>) -> RelayReport {
    relay.await.unwrap_or_else(|e| RelayReport {
        outcome: RelayOutcome::ReadFailed(format!("relay task failed: {e}")),
        bytes: 0,
        chunks: 0,
    })
}

/// Cancel the session and wait until the process and relay have stopped.
async fn teardown(abort: &SessionAbort, runner: &mut ProcessRunner, relay: JoinHandle<RelayReport>) {
    abort.cancel();
    runner.close_input();
    let exit = runner.wait().await;
    let report = join_relay(relay).await;
    debug!(%exit, relay = ?report.outcome, "Session torn down");
}

/// Cancel the session when the client goes away or the time limit passes.
fn spawn_watchdog(
    abort: SessionAbort,
    outbound: Outbound,
    session_timeout: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = async {
            match session_timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = abort.cancelled() => {}
            () = outbound.closed() => abort.trigger(AbortCause::ClientDisconnected),
            limit = deadline => abort.trigger(AbortCause::DeadlineExceeded(limit)),
        }
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::ReceiverStream;

    fn args(args: &str) -> ProcessRequest {
        ProcessRequest {
            args: args.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_arguments_is_an_error() {
        let bridge = StreamBridge::new(BridgeConfig::new(RunnerConfig::new("cat")));
        let (out_tx, _out_rx) = mpsc::channel(8);
        let inbound = tokio_stream::empty::<Result<ProcessRequest, Status>>();

        let err = bridge
            .run_session(inbound, out_tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoArguments));
    }

    #[tokio::test]
    async fn receive_error_before_args_is_transport_error() {
        let bridge = StreamBridge::new(BridgeConfig::new(RunnerConfig::new("cat")));
        let (out_tx, _out_rx) = mpsc::channel(8);
        let inbound = tokio_stream::iter(vec![Err(Status::unavailable("reset"))]);

        let err = bridge
            .run_session(inbound, out_tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportReceive(_)));
    }

    #[tokio::test]
    async fn spawn_failure_sends_nothing() {
        let bridge = StreamBridge::new(BridgeConfig::new(RunnerConfig::new(
            "/nonexistent/ffstream-test-binary",
        )));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let inbound = tokio_stream::iter(vec![Ok(args("-y"))]);

        let err = bridge
            .run_session(inbound, out_tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Spawn(_)));
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn receive_error_mid_stream_aborts() {
        let bridge = StreamBridge::new(BridgeConfig::new(RunnerConfig::new("cat")));
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        in_tx.send(Ok(args(""))).await.unwrap();
        in_tx.send(Err(Status::internal("broken"))).await.unwrap();

        let err = bridge
            .run_session(ReceiverStream::new(in_rx), out_tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportReceive(_)));
    }

    #[tokio::test]
    async fn caller_cancellation_is_reported_neutrally() {
        let bridge = StreamBridge::new(BridgeConfig::new(RunnerConfig::new("cat")));
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        in_tx.send(Ok(args(""))).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bridge
            .run_session(ReceiverStream::new(in_rx), out_tx, cancel)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Session cancelled: session cancelled by caller");
        assert_eq!(Status::from(err).code(), tonic::Code::Cancelled);
    }

    #[tokio::test]
    async fn session_abort_leaves_caller_token_alone() {
        let bridge = StreamBridge::new(BridgeConfig::new(RunnerConfig::new("cat")));
        let (out_tx, _out_rx) = mpsc::channel(8);
        let inbound = tokio_stream::iter(vec![Ok(args("")), Err(Status::internal("broken"))]);
        let cancel = CancellationToken::new();

        let err = bridge
            .run_session(inbound, out_tx, cancel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportReceive(_)));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn bridge_config_defaults() {
        let config = BridgeConfig::default();
        assert!(config.session_timeout.is_none());
        assert_eq!(config.runner.program, std::path::PathBuf::from("ffmpeg"));
    }

    #[test]
    fn bridge_exposes_its_config() {
        let bridge = StreamBridge::new(
            BridgeConfig::new(RunnerConfig::new("cat"))
                .with_session_timeout(Some(Duration::from_secs(7))),
        );
        assert_eq!(bridge.config().session_timeout, Some(Duration::from_secs(7)));
        assert_eq!(bridge.config().runner.program, std::path::PathBuf::from("cat"));
    }
}
