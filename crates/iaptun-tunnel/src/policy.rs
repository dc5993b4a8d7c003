//! Relay access policies
//!
//! A policy decides which local clients may use a tunnel. The listener
//! consults it for every accepted connection; denied clients are dropped
//! before a relay session is opened.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::TunnelError;

pub trait RelayPolicy: Send + Sync + std::fmt::Debug {
    /// Stable identifier, shown next to open tunnels
    fn id(&self) -> &str;

    fn is_client_allowed(&self, peer: &SocketAddr) -> bool;
}

/// Lets every client through
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllRelayPolicy;

impl RelayPolicy for AllowAllRelayPolicy {
    fn id(&self) -> &str {
        "allowAll"
    }

    fn is_client_allowed(&self, _peer: &SocketAddr) -> bool {
        true
    }
}

/// Only clients connecting from a loopback address
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackRelayPolicy;

impl RelayPolicy for LoopbackRelayPolicy {
    fn id(&self) -> &str {
        "loopback"
    }

    fn is_client_allowed(&self, peer: &SocketAddr) -> bool {
        peer.ip().to_canonical().is_loopback()
    }
}

/// Clients whose address matches one of a set of IPs or CIDR ranges.
///
/// An empty list admits nobody.
#[derive(Debug, Clone, PartialEq)]
pub struct IpAllowListPolicy {
    id: String,
    networks: Vec<IpNetwork>,
}

impl IpAllowListPolicy {
    /// Build from entries like `"10.0.0.0/8"`, `"192.168.1.7"` or `"::1"`
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Result<Self, TunnelError> {
        let networks = entries
            .iter()
            .map(|entry| IpNetwork::from_str(entry.as_ref().trim()))
            .collect::<Result<Vec<_>, _>>()?;

        let ranges: Vec<String> = networks.iter().map(IpNetwork::to_string).collect();

        Ok(Self {
            id: format!("ipAllowList:{}", ranges.join(",")),
            networks,
        })
    }
}

impl RelayPolicy for IpAllowListPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_client_allowed(&self, peer: &SocketAddr) -> bool {
        let ip = peer.ip().to_canonical();
        self.networks.iter().any(|network| network.contains(&ip))
    }
}

/// Address plus prefix length
#[derive(Debug, Clone, PartialEq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl FromStr for IpNetwork {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TunnelError::Configuration(format!("Invalid IP range: {}", s));

        let (addr, prefix_len) = match s.split_once('/') {
            Some((ip, prefix)) => {
                let addr = IpAddr::from_str(ip).map_err(|_| invalid())?;
                let prefix_len = prefix.parse::<u8>().map_err(|_| invalid())?;
                (addr, prefix_len)
            }
            None => {
                let addr = IpAddr::from_str(s).map_err(|_| invalid())?;
                (addr, max_prefix(&addr))
            }
        };

        if prefix_len > max_prefix(&addr) {
            return Err(invalid());
        }

        Ok(Self { addr, prefix_len })
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl IpNetwork {
    fn contains(&self, ip: &IpAddr) -> bool {
        if self.prefix_len == 0 {
            return matches!(
                (self.addr, ip),
                (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
            );
        }

        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = !0u32 << (32 - self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = !0u128 << (128 - self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}
