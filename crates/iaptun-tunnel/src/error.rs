//! Tunnel errors

use iaptun_transport_websocket::RelayError;
use std::time::Duration;
use thiserror::Error;

/// Tunnel errors.
///
/// Cloneable so that one creation result can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tunnel is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<RelayError> for TunnelError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::AccessDenied(msg) => TunnelError::AccessDenied(msg),
            RelayError::BackendUnreachable(msg) => TunnelError::BackendUnreachable(msg),
            RelayError::NotFound(msg) => TunnelError::NotFound(msg),
            RelayError::Timeout(timeout) => TunnelError::Timeout(timeout),
            RelayError::ProtocolError(msg) => TunnelError::ProtocolError(msg),
            RelayError::TokenError(msg) => TunnelError::AccessDenied(msg),
            RelayError::Configuration(msg) => TunnelError::Configuration(msg),
            RelayError::Io(e) => TunnelError::Io(e.to_string()),
            err @ (RelayError::ConnectionClosed { .. } | RelayError::ConnectionError(_)) => {
                TunnelError::ConnectionError(err.to_string())
            }
        }
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::Io(err.to_string())
    }
}
