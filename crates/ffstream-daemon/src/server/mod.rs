//! gRPC server for the ffstream daemon.

mod config;
mod transcode_svc;

pub use config::ServerConfig;
pub use transcode_svc::TranscodeServiceImpl;

use std::future::Future;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::transport::server::Router;
use tracing::info;

use ffstream_proto::v1::transcode_service_server::TranscodeServiceServer;

use crate::bridge::{BridgeConfig, StreamBridge};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// gRPC server handle.
pub struct GrpcServer {
    config: ServerConfig,
    bridge: StreamBridge,
    shutdown: CancellationToken,
}

impl GrpcServer {
    /// Create a new gRPC server.
    pub fn new(config: ServerConfig, bridge_config: BridgeConfig) -> Self {
        Self {
            config,
            bridge: StreamBridge::new(bridge_config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the server configuration.
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Token cancelled when the server shuts down; every session runs under
    /// a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build a `TranscodeServiceImpl` sharing this server's bridge and
    /// shutdown token.
    pub fn transcode_service_impl(&self) -> TranscodeServiceImpl {
        TranscodeServiceImpl::new(
            self.bridge.clone(),
            self.shutdown.clone(),
            self.config.max_sessions,
        )
    }

    async fn router(&self) -> Router {
        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<TranscodeServiceServer<TranscodeServiceImpl>>()
            .await;

        Server::builder()
            .http2_keepalive_interval(Some(self.config.keepalive_interval))
            .http2_keepalive_timeout(Some(self.config.keepalive_timeout))
            .add_service(health_service)
            .add_service(TranscodeServiceServer::new(self.transcode_service_impl()))
    }

    /// Wrap `signal` so that firing it also cancels every live session.
    fn shutdown_signal(
        &self,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> impl Future<Output = ()> + Send + 'static {
        let shutdown = self.shutdown.clone();
        async move {
            signal.await;
            info!("Shutting down, cancelling active sessions");
            shutdown.cancel();
        }
    }

    /// Serve on the configured TCP address until `signal` resolves.
    pub async fn serve_tcp(
        self,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self.config.addr;
        let router = self.router().await;
        let signal = self.shutdown_signal(signal);

        info!(%addr, "Starting gRPC server on TCP");
        router.serve_with_shutdown(addr, signal).await?;
        Ok(())
    }

    /// Serve on an already-bound listener until `signal` resolves.
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let router = self.router().await;
        let signal = self.shutdown_signal(signal);

        info!(%addr, "Starting gRPC server on bound listener");
        router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await?;
        Ok(())
    }
}
