//! Relay transport configuration

use std::time::Duration;
use url::Url;

use crate::error::{RelayError, RelayResult};

/// Default relay endpoint
pub const DEFAULT_RELAY_URL: &str = "wss://tunnel.cloudproxy.app";

/// Relay-specific configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Relay base URL (ws:// or wss://)
    pub url: String,

    /// Connect path appended to the base URL
    pub path: String,

    /// WebSocket subprotocol announced during the handshake
    pub subprotocol: String,

    /// Value of the Origin header
    pub origin: String,

    /// Network interface used when the target does not name one
    pub interface: String,

    /// Upper bound for the WebSocket handshake plus CONNECT_SUCCESS_SID
    pub connect_timeout: Duration,

    /// How long backend data is still relayed after the local client
    /// finished sending
    pub half_close_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            path: format!("/v{}/connect", iaptun_proto::PROTOCOL_VERSION),
            subprotocol: "relay.tunnel.cloudproxy.app".to_string(),
            origin: "bot:iap-tunneler".to_string(),
            interface: "nic0".to_string(),
            connect_timeout: Duration::from_secs(30),
            half_close_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Set relay base URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set connect path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = interface.to_string();
        self
    }

    /// Set handshake timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_half_close_timeout(mut self, timeout: Duration) -> Self {
        self.half_close_timeout = timeout;
        self
    }

    pub fn validate(&self) -> RelayResult<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| RelayError::Configuration(format!("Invalid relay URL: {}", e)))?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(RelayError::Configuration(format!(
                "Relay URL must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if !self.path.starts_with('/') {
            return Err(RelayError::Configuration(
                "Connect path must start with '/'".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(RelayError::Configuration(
                "Connect timeout must not be zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the connect URL for a target
    pub fn connect_url(&self, target: &RelayTarget) -> RelayResult<Url> {
        self.validate()?;

        let base = self.url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{}{}", base, self.path))
            .map_err(|e| RelayError::Configuration(format!("Invalid relay URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("project", &target.project_id)
            .append_pair("zone", &target.zone)
            .append_pair("instance", &target.instance)
            .append_pair(
                "interface",
                target.interface.as_deref().unwrap_or(&self.interface),
            )
            .append_pair("port", &target.port.to_string())
            .append_pair("newWebsocket", "true");

        Ok(url)
    }
}

/// Backend the relay connects to on our behalf
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayTarget {
    pub project_id: String,
    pub zone: String,
    pub instance: String,
    pub port: u16,
    /// Overrides [`RelayConfig::interface`]
    pub interface: Option<String>,
}

impl RelayTarget {
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            instance: instance.into(),
            port,
            interface: None,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}
