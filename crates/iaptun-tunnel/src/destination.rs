//! Tunnel destinations

use iaptun_transport_websocket::RelayTarget;
use std::fmt;
use std::str::FromStr;

use crate::error::TunnelError;

/// Fully qualified VM instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceLocator {
    pub project_id: String,
    pub zone: String,
    pub name: String,
}

impl InstanceLocator {
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project_id, self.zone, self.name
        )
    }
}

impl FromStr for InstanceLocator {
    type Err = TunnelError;

    /// Parse `projects/<project>/zones/<zone>/instances/<name>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();

        match parts.as_slice() {
            ["projects", project, "zones", zone, "instances", name]
                if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(*project, *zone, *name))
            }
            _ => Err(TunnelError::Configuration(format!(
                "Invalid instance locator '{}', expected projects/<project>/zones/<zone>/instances/<name>",
                s
            ))),
        }
    }
}

/// Instance plus remote port; the key of the broker cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelDestination {
    instance: InstanceLocator,
    remote_port: u16,
}

impl TunnelDestination {
    pub fn new(instance: InstanceLocator, remote_port: u16) -> Self {
        Self {
            instance,
            remote_port,
        }
    }

    pub fn instance(&self) -> &InstanceLocator {
        &self.instance
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

impl fmt::Display for TunnelDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance.name, self.remote_port)
    }
}

impl From<&TunnelDestination> for RelayTarget {
    fn from(destination: &TunnelDestination) -> Self {
        RelayTarget::new(
            destination.instance.project_id.clone(),
            destination.instance.zone.clone(),
            destination.instance.name.clone(),
            destination.remote_port,
        )
    }
}
