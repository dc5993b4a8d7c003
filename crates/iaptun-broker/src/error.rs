//! Broker errors

use iaptun_tunnel::{TunnelDestination, TunnelError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No tunnel to {0}")]
    NotFound(TunnelDestination),

    #[error("Failed to create tunnel to {destination}: {source}")]
    CreationFailed {
        destination: TunnelDestination,
        source: TunnelError,
    },

    #[error("Probe of tunnel to {destination} failed: {source}")]
    ProbeFailed {
        destination: TunnelDestination,
        source: TunnelError,
    },

    #[error("Failed to close tunnel to {destination}: {source}")]
    CloseFailed {
        destination: TunnelDestination,
        source: TunnelError,
    },

    #[error("Failed to disconnect {} tunnel(s)", .0.len())]
    Teardown(Vec<BrokerError>),
}

impl BrokerError {
    /// Destination the error is about, if it concerns a single one
    pub fn destination(&self) -> Option<&TunnelDestination> {
        match self {
            BrokerError::NotFound(destination)
            | BrokerError::CreationFailed { destination, .. }
            | BrokerError::ProbeFailed { destination, .. }
            | BrokerError::CloseFailed { destination, .. } => Some(destination),
            BrokerError::Teardown(_) => None,
        }
    }
}
