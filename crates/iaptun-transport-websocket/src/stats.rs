//! Traffic counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters shared by all connections of one tunnel
#[derive(Debug, Default)]
pub struct RelayStatistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl RelayStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Payload bytes sent to the relay
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Payload bytes received from the relay
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}
