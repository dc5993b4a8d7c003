//! Tunnel backed by the WebSocket relay

use async_trait::async_trait;
use iaptun_transport_websocket::RelayEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::destination::TunnelDestination;
use crate::error::TunnelError;
use crate::policy::RelayPolicy;
use crate::tunnel::{Tunnel, TunnelStatistics};

/// Local listener that opens one relay session per accepted client
#[derive(Debug)]
pub struct RelayTunnel {
    destination: TunnelDestination,
    local_addr: SocketAddr,
    policy: Arc<dyn RelayPolicy>,
    endpoint: Arc<RelayEndpoint>,
    cancel: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTunnel {
    /// Start serving `listener`; the tunnel owns it from now on
    pub fn start(
        destination: TunnelDestination,
        listener: TcpListener,
        endpoint: Arc<RelayEndpoint>,
        policy: Arc<dyn RelayPolicy>,
    ) -> Result<Self, TunnelError> {
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let listener_task = tokio::spawn(Self::run_local_server(
            listener,
            destination.clone(),
            endpoint.clone(),
            policy.clone(),
            cancel.clone(),
        ));

        info!(
            "Tunnel to {} listening on {} (policy {})",
            destination,
            local_addr,
            policy.id()
        );

        Ok(Self {
            destination,
            local_addr,
            policy,
            endpoint,
            cancel,
            listener_task: Mutex::new(Some(listener_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run_local_server(
        listener: TcpListener,
        destination: TunnelDestination,
        endpoint: Arc<RelayEndpoint>,
        policy: Arc<dyn RelayPolicy>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cancellation requested, stopping listener for {}", destination);
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((tcp_stream, peer_addr)) => {
                            if !policy.is_client_allowed(&peer_addr) {
                                warn!(
                                    "Rejecting {} for {}: denied by policy {}",
                                    peer_addr,
                                    destination,
                                    policy.id()
                                );
                                continue;
                            }

                            debug!("Accepted {} for {}", peer_addr, destination);
                            tokio::spawn(Self::handle_client(
                                tcp_stream,
                                peer_addr,
                                endpoint.clone(),
                                cancel.child_token(),
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept local connection for {}: {}", destination, e);
                        }
                    }
                }
            }
        }

        info!("Listener for {} stopped", destination);
    }

    async fn handle_client(
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        endpoint: Arc<RelayEndpoint>,
        cancel: CancellationToken,
    ) {
        let connection = tokio::select! {
            _ = cancel.cancelled() => return,
            connection = endpoint.connect() => connection,
        };

        match connection {
            Ok(connection) => {
                let sid = connection.sid().to_string();
                match connection.pump(tcp_stream, cancel).await {
                    Ok(()) => debug!("Relay session {} for {} finished", sid, peer_addr),
                    Err(e) => warn!("Relay session {} for {} failed: {}", sid, peer_addr, e),
                }
            }
            Err(e) => {
                error!("Failed to open relay session for {}: {}", peer_addr, e);
            }
        }
    }
}

#[async_trait]
impl Tunnel for RelayTunnel {
    fn destination(&self) -> &TunnelDestination {
        &self.destination
    }

    fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn policy_id(&self) -> &str {
        self.policy.id()
    }

    fn statistics(&self) -> TunnelStatistics {
        let stats = self.endpoint.statistics();
        TunnelStatistics {
            bytes_sent: stats.bytes_sent(),
            bytes_received: stats.bytes_received(),
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn probe(&self, timeout: Duration) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        self.endpoint.probe(timeout).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.cancel.cancel();

        // Held across the await so concurrent callers also wait for the listener
        let mut listener_task = self.listener_task.lock().await;
        if let Some(handle) = listener_task.take() {
            handle.await.map_err(|e| {
                TunnelError::ConnectionError(format!(
                    "Listener task for {} failed: {}",
                    self.destination, e
                ))
            })?;
            info!("Tunnel to {} closed", self.destination);
        }

        Ok(())
    }
}

impl Drop for RelayTunnel {
    fn drop(&mut self) {
        // Stops the listener loop even if close() was never called
        self.cancel.cancel();
    }
}
