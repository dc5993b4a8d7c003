//! Tunnel broker
//!
//! Keeps at most one tunnel per destination. Concurrent connects to the same
//! destination share a single creation; every tunnel is probed before it is
//! handed out, and tunnels that fail their probe are evicted so the next
//! connect starts fresh.
//!
//! ```ignore
//! let broker = TunnelBroker::new(service, Arc::new(NoopEventSink));
//! let tunnel = broker
//!     .connect(&destination, Arc::new(LoopbackRelayPolicy), Duration::from_secs(5))
//!     .await?;
//! println!("connect to localhost:{}", tunnel.local_port());
//! broker.disconnect_all().await?;
//! ```

pub mod broker;
pub mod error;
pub mod events;

pub use broker::TunnelBroker;
pub use error::BrokerError;
pub use events::{BroadcastEventSink, EventSink, NoopEventSink, TunnelEvent};
