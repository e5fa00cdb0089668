//! Bridge error types.

use std::time::Duration;

use thiserror::Error;
use tonic::Status;

use super::session::AbortCause;
use crate::subprocess::SubprocessError;

/// Reasons a session ends without a `done` message.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Stream closed before arguments were received")]
    NoArguments,

    #[error("Error receiving stream data: {}", .0.message())]
    TransportReceive(Status),

    #[error("Failed to start process: {0}")]
    Spawn(SubprocessError),

    #[error("Error writing to process stdin: {0}")]
    Write(SubprocessError),

    #[error("Failed to relay process output: {0}")]
    Relay(String),

    #[error("Session cancelled: {0}")]
    Cancelled(&'static str),

    #[error("Session exceeded its {0:?} time limit")]
    DeadlineExceeded(Duration),
}

impl From<AbortCause> for BridgeError {
    fn from(cause: AbortCause) -> Self {
        match cause {
            AbortCause::CallerCancelled => Self::Cancelled("session cancelled by caller"),
            AbortCause::ClientDisconnected => Self::Cancelled("client disconnected"),
            AbortCause::DeadlineExceeded(limit) => Self::DeadlineExceeded(limit),
            AbortCause::RelayFailed(reason) => Self::Relay(reason),
        }
    }
}

impl From<BridgeError> for Status {
    fn from(err: BridgeError) -> Self {
        let message = err.to_string();
        match err {
            BridgeError::NoArguments => Self::invalid_argument(message),
            BridgeError::TransportReceive(status) => Self::new(status.code(), message),
            BridgeError::Spawn(_) => Self::failed_precondition(message),
            BridgeError::Write(_) => Self::aborted(message),
            BridgeError::Relay(_) => Self::unavailable(message),
            BridgeError::Cancelled(_) => Self::cancelled(message),
            BridgeError::DeadlineExceeded(_) => Self::deadline_exceeded(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn status_codes() {
        let cases = [
            (BridgeError::NoArguments, Code::InvalidArgument),
            (
                BridgeError::TransportReceive(Status::data_loss("reset")),
                Code::DataLoss,
            ),
            (
                BridgeError::Spawn(SubprocessError::PipeUnavailable("stdin")),
                Code::FailedPrecondition,
            ),
            (BridgeError::Write(SubprocessError::InputClosed), Code::Aborted),
            (BridgeError::Relay("gone".into()), Code::Unavailable),
            (BridgeError::Cancelled("bye"), Code::Cancelled),
            (
                BridgeError::DeadlineExceeded(Duration::from_secs(1)),
                Code::DeadlineExceeded,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn transport_status_message_is_prefixed() {
        let status = Status::from(BridgeError::TransportReceive(Status::internal("boom")));
        assert_eq!(status.message(), "Error receiving stream data: boom");
    }

    #[test]
    fn abort_causes_map_to_errors() {
        assert_eq!(
            BridgeError::from(AbortCause::CallerCancelled).to_string(),
            "Session cancelled: session cancelled by caller"
        );
        assert!(matches!(
            BridgeError::from(AbortCause::ClientDisconnected),
            BridgeError::Cancelled("client disconnected")
        ));
        assert!(matches!(
            BridgeError::from(AbortCause::RelayFailed("x".into())),
            BridgeError::Relay(reason) if reason == "x"
        ));
    }
}
