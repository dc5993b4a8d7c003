//! Stable local port selection
//!
//! Reconnecting to the same destination should land on the same local port,
//! so that saved client configurations keep working across runs. The
//! preferred port is a hash of the seeds; when it is taken the OS picks one.

use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::debug;

use crate::destination::TunnelDestination;

/// Lowest preferred port
pub const PORT_RANGE_START: u16 = 10000;

/// Start of the usual OS ephemeral range, never preferred
pub const PORT_RANGE_END: u16 = 49152;

#[derive(Debug, Clone, Default)]
pub struct PortFinder {
    hasher: Sha256,
}

impl PortFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds for a tunnel destination: project, zone, instance and port
    pub fn for_destination(destination: &TunnelDestination) -> Self {
        let instance = destination.instance();
        Self::new()
            .with_seed(&instance.project_id)
            .with_seed(&instance.zone)
            .with_seed(&instance.name)
            .with_seed(&destination.remote_port().to_string())
    }

    pub fn with_seed(mut self, seed: &str) -> Self {
        // Length prefix keeps ("ab", "c") distinct from ("a", "bc")
        self.hasher.update((seed.len() as u64).to_be_bytes());
        self.hasher.update(seed.as_bytes());
        self
    }

    pub fn preferred_port(&self) -> u16 {
        let digest = self.hasher.clone().finalize();
        let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let span = u32::from(PORT_RANGE_END - PORT_RANGE_START);
        PORT_RANGE_START + (value % span) as u16
    }

    /// Bind the preferred port on `ip`, or any free port if that fails
    pub async fn bind(&self, ip: IpAddr) -> std::io::Result<TcpListener> {
        let preferred = SocketAddr::new(ip, self.preferred_port());

        match TcpListener::bind(preferred).await {
            Ok(listener) => Ok(listener),
            Err(e) => {
                debug!(
                    "Preferred port {} unavailable ({}), using an ephemeral port",
                    preferred, e
                );
                TcpListener::bind(SocketAddr::new(ip, 0)).await
            }
        }
    }
}
