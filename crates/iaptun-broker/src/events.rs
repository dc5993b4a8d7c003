//! Tunnel lifecycle notifications

use iaptun_tunnel::TunnelDestination;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A newly created tunnel passed its first probe
    Opened(TunnelDestination),
    /// A tunnel was disconnected
    Closed(TunnelDestination),
}

impl TunnelEvent {
    pub fn destination(&self) -> &TunnelDestination {
        match self {
            TunnelEvent::Opened(destination) | TunnelEvent::Closed(destination) => destination,
        }
    }
}

/// Fire-and-forget receiver of tunnel events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn publish(&self, event: TunnelEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: TunnelEvent) {}
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<TunnelEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: TunnelEvent) {
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            trace!("Tunnel event dropped, no subscribers");
        }
    }
}
