//! Tunnel creation

use async_trait::async_trait;
use iaptun_transport_websocket::{RelayConfig, RelayEndpoint, RelayTarget, TokenSource};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::destination::TunnelDestination;
use crate::error::TunnelError;
use crate::policy::RelayPolicy;
use crate::port_finder::PortFinder;
use crate::relay_tunnel::RelayTunnel;
use crate::tunnel::Tunnel;

/// Creates listening tunnels
#[async_trait]
pub trait TunnelService: Send + Sync {
    async fn create_tunnel(
        &self,
        destination: &TunnelDestination,
        policy: Arc<dyn RelayPolicy>,
    ) -> Result<Arc<dyn Tunnel>, TunnelError>;
}

/// Tunnel service configuration
#[derive(Debug, Clone)]
pub struct TunnelServiceConfig {
    /// Relay transport settings
    pub relay: RelayConfig,

    /// Address local listeners bind to; must be loopback
    pub bind_address: IpAddr,

    /// Probe the relay before binding the listener.
    ///
    /// Catches denied or unreachable destinations before a port is taken.
    pub preflight_timeout: Option<Duration>,
}

impl Default for TunnelServiceConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            preflight_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TunnelServiceConfig {
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn with_preflight_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.preflight_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if !self.bind_address.is_loopback() {
            return Err(TunnelError::Configuration(format!(
                "Tunnels must bind to a loopback address, not {}",
                self.bind_address
            )));
        }

        self.relay.validate()?;
        Ok(())
    }
}

/// Creates [`RelayTunnel`]s
#[derive(Debug)]
pub struct RelayTunnelService {
    config: TunnelServiceConfig,
    relay_config: Arc<RelayConfig>,
    tokens: Arc<dyn TokenSource>,
}

impl RelayTunnelService {
    pub fn new(
        config: TunnelServiceConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, TunnelError> {
        config.validate()?;

        Ok(Self {
            relay_config: Arc::new(config.relay.clone()),
            config,
            tokens,
        })
    }
}

#[async_trait]
impl TunnelService for RelayTunnelService {
    async fn create_tunnel(
        &self,
        destination: &TunnelDestination,
        policy: Arc<dyn RelayPolicy>,
    ) -> Result<Arc<dyn Tunnel>, TunnelError> {
        let endpoint = Arc::new(RelayEndpoint::new(
            self.relay_config.clone(),
            RelayTarget::from(destination),
            self.tokens.clone(),
        ));

        if let Some(timeout) = self.config.preflight_timeout {
            debug!("Checking relay access to {}", destination);
            endpoint.probe(timeout).await?;
        }

        let listener = PortFinder::for_destination(destination)
            .bind(self.config.bind_address)
            .await?;

        let tunnel = RelayTunnel::start(destination.clone(), listener, endpoint, policy)?;
        Ok(Arc::new(tunnel))
    }
}
