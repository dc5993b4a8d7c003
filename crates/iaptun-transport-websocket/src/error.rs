//! Relay transport errors

use iaptun_proto::{CloseCode, CodecError};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Access denied by relay: {0}")]
    AccessDenied(String),

    #[error("Relay failed to connect to backend: {0}")]
    BackendUnreachable(String),

    #[error("Target not found: {0}")]
    NotFound(String),

    #[error("Relay closed connection: {code}: {reason}")]
    ConnectionClosed { code: CloseCode, reason: String },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Failed to obtain access token: {0}")]
    TokenError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Map a relay close status to an error
    pub fn from_close(code: CloseCode, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match code {
            CloseCode::NotAuthorized => RelayError::AccessDenied(reason),
            CloseCode::FailedToConnectToBackend => RelayError::BackendUnreachable(reason),
            CloseCode::LookupFailed | CloseCode::LookupFailedReconnect => {
                RelayError::NotFound(reason)
            }
            code => RelayError::ConnectionClosed { code, reason },
        }
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        RelayError::ProtocolError(err.to_string())
    }
}

impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let status = response.status();
                let reason = format!("HTTP {}", status);
                match status {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        RelayError::AccessDenied(reason)
                    }
                    StatusCode::NOT_FOUND => RelayError::NotFound(reason),
                    _ => RelayError::ConnectionError(format!(
                        "WebSocket handshake rejected: {}",
                        reason
                    )),
                }
            }
            tungstenite::Error::Io(e) => RelayError::Io(e),
            tungstenite::Error::Protocol(e) => RelayError::ProtocolError(e.to_string()),
            other => RelayError::ConnectionError(other.to_string()),
        }
    }
}
