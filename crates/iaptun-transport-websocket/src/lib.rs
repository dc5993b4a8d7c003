//! WebSocket relay transport using tokio-tungstenite
//!
//! A relay connection is a single WebSocket carrying the SSH relay framing
//! from `iaptun-proto`. Every local TCP client gets its own connection; the
//! relay forwards the payload to a port on the target instance.
//!
//! # Connection lifecycle
//!
//! 1. Build the connect URL from a [`RelayTarget`] (project, zone, instance,
//!    interface, port)
//! 2. Open the WebSocket with a bearer token from a [`TokenSource`]
//! 3. Wait for `CONNECT_SUCCESS_SID`
//! 4. Pump DATA/ACK frames until either side closes
//!
//! A probe is steps 1-3 followed by an immediate close.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod stats;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{RelayConfig, RelayTarget};
pub use connection::RelayConnection;
pub use endpoint::RelayEndpoint;
pub use error::{RelayError, RelayResult};
pub use stats::RelayStatistics;
pub use token::{StaticTokenSource, TokenSource};
