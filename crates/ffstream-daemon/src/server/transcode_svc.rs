//! `TranscodeService` gRPC implementation.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument};

use ffstream_proto::v1::{ProcessRequest, ProcessResponse, transcode_service_server::TranscodeService};

use crate::bridge::StreamBridge;

/// Responses buffered per session before the relay waits on the client.
const OUTBOUND_BUFFER: usize = 128;

/// `TranscodeService` implementation backed by a [`StreamBridge`].
#[derive(Clone)]
pub struct TranscodeServiceImpl {
    bridge: StreamBridge,
    shutdown: CancellationToken,
    sessions: Arc<Semaphore>,
    max_sessions: usize,
}

impl TranscodeServiceImpl {
    /// Create a new `TranscodeService`.
    ///
    /// Every session runs under a child of `shutdown`.
    pub fn new(bridge: StreamBridge, shutdown: CancellationToken, max_sessions: usize) -> Self {
        Self {
            bridge,
            shutdown,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
        }
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.max_sessions - self.sessions.available_permits()
    }
}

type ProcessResponseStream = Pin<Box<dyn Stream<Item = Result<ProcessResponse, Status>> + Send>>;

#[tonic::async_trait]
impl TranscodeService for TranscodeServiceImpl {
    type ProcessStreamStream = ProcessResponseStream;

    #[instrument(skip(self, request), fields(rpc = "ProcessStream"))]
    async fn process_stream(
        &self,
        request: Request<Streaming<ProcessRequest>>,
    ) -> Result<Response<Self::ProcessStreamStream>, Status> {
        let permit = Arc::clone(&self.sessions)
            .try_acquire_owned()
            .map_err(|_| {
                Status::resource_exhausted(format!(
                    "Session limit of {} reached",
                    self.max_sessions
                ))
            })?;

        let peer = request.remote_addr();
        let in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<ProcessResponse, Status>>(OUTBOUND_BUFFER);

        let bridge = self.bridge.clone();
        let cancel = self.shutdown.child_token();

        info!(?peer, "Transcode stream opened");
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = bridge.run_session(in_stream, tx.clone(), cancel).await {
                if tx.send(Err(e.into())).await.is_err() {
                    debug!("Client gone before the error could be reported");
                }
            }
            debug!(?peer, "Transcode stream ended");
        });

        let out_stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(out_stream)))
    }
}
