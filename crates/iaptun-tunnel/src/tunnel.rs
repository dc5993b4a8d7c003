//! Tunnel abstraction

use async_trait::async_trait;
use std::time::Duration;

use crate::destination::TunnelDestination;
use crate::error::TunnelError;

/// Traffic through a tunnel since it was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStatistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A local listening endpoint bridged to a destination.
///
/// Lifecycle is `Listening -> Closed`; a closed tunnel never listens again.
#[async_trait]
pub trait Tunnel: Send + Sync + std::fmt::Debug {
    fn destination(&self) -> &TunnelDestination;

    /// Port local clients connect to
    fn local_port(&self) -> u16;

    /// Id of the relay policy guarding the listener
    fn policy_id(&self) -> &str;

    fn statistics(&self) -> TunnelStatistics;

    fn is_closed(&self) -> bool;

    /// Check that the relay still accepts connections to the destination.
    ///
    /// Finishes within `timeout`. A failed probe leaves the tunnel open.
    /// Fails with [`TunnelError::Closed`] once the tunnel is closed.
    async fn probe(&self, timeout: Duration) -> Result<(), TunnelError>;

    /// Stop the listener and release the local port.
    ///
    /// Idempotent. Returns once the listener has stopped.
    async fn close(&self) -> Result<(), TunnelError>;
}
