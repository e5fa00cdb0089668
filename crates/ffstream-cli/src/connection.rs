//! Daemon connection client.

use std::time::Duration;

use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use ffstream_proto::v1::transcode_service_client::TranscodeServiceClient;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Daemon address, e.g. `http://localhost:50051`.
    pub addr: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Address of a daemon listening on `port` on this machine.
    pub fn localhost(port: u16) -> Self {
        Self {
            addr: format!("http://localhost:{port}"),
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: "http://localhost:50051".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a channel to the daemon.
pub async fn connect(
    config: &ConnectionConfig,
) -> Result<TranscodeServiceClient<Channel>, ConnectionError> {
    let endpoint = Endpoint::from_shared(config.addr.clone())
        .map_err(|e| ConnectionError::InvalidAddress(e.to_string()))?
        .connect_timeout(config.connect_timeout)
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10));

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;

    info!(addr = %config.addr, "Connected to daemon");
    Ok(TranscodeServiceClient::new(channel))
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_targets_local_daemon() {
        let config = ConnectionConfig::default();
        assert_eq!(config.addr, "http://localhost:50051");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn localhost_uses_port() {
        assert_eq!(ConnectionConfig::localhost(6000).addr, "http://localhost:6000");
    }

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let config = ConnectionConfig {
            addr: "not a uri".to_string(),
            ..ConnectionConfig::default()
        };
        let err = connect(&config).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidAddress(_)));
    }
}
