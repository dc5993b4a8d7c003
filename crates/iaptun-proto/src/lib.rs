//! SSH Relay Protocol Definitions
//!
//! This crate defines the framing used between a tunnel client and the
//! identity-aware relay: message tags, their binary layout, and the
//! WebSocket close codes the relay uses to report failures.

pub mod close;
pub mod messages;

pub use close::CloseCode;
pub use messages::{CodecError, MessageTag, RelayMessage};

/// Protocol version spoken on the connect path
pub const PROTOCOL_VERSION: u32 = 4;

/// Maximum payload of a single DATA message (16KB)
pub const MAX_DATA_PAYLOAD: usize = 16 * 1024;

/// Largest message the relay will ever send (DATA header + payload)
pub const MAX_MESSAGE_SIZE: usize = MAX_DATA_PAYLOAD + 6;
