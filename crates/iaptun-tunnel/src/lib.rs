//! Local tunnels bridged to a cloud instance through the relay
//!
//! A [`Tunnel`] is a loopback TCP listener. Every client that connects to it
//! gets its own relay session to the [`TunnelDestination`]; a [`RelayPolicy`]
//! decides which local clients are let through.
//!
//! Tunnels are created by a [`TunnelService`]. The production implementation,
//! [`RelayTunnelService`], checks relay access first and then binds the
//! listener on a port derived from the destination (see [`PortFinder`]).

pub mod destination;
pub mod error;
pub mod policy;
pub mod port_finder;
pub mod relay_tunnel;
pub mod service;
pub mod tunnel;

pub use destination::{InstanceLocator, TunnelDestination};
pub use error::TunnelError;
pub use policy::{AllowAllRelayPolicy, IpAllowListPolicy, LoopbackRelayPolicy, RelayPolicy};
pub use port_finder::PortFinder;
pub use relay_tunnel::RelayTunnel;
pub use service::{RelayTunnelService, TunnelService, TunnelServiceConfig};
pub use tunnel::{Tunnel, TunnelStatistics};
