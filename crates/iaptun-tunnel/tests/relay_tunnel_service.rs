//! End-to-end tunnel creation against an in-process relay

use iaptun_transport_websocket::testing::{RelayBehavior, TestRelay};
use iaptun_transport_websocket::{RelayConfig, StaticTokenSource};
use iaptun_tunnel::{
    InstanceLocator, LoopbackRelayPolicy, PortFinder, RelayTunnelService, TunnelDestination,
    TunnelError, TunnelService, TunnelServiceConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn service_for(relay: &TestRelay) -> RelayTunnelService {
    let config = TunnelServiceConfig::default()
        .with_relay(
            RelayConfig::default()
                .with_url(relay.url())
                .with_connect_timeout(Duration::from_secs(5)),
        )
        .with_preflight_timeout(Some(Duration::from_secs(5)));

    RelayTunnelService::new(config, Arc::new(StaticTokenSource::new("token"))).unwrap()
}

fn destination(name: &str, port: u16) -> TunnelDestination {
    TunnelDestination::new(InstanceLocator::new("service-tests", "zone-a", name), port)
}

#[tokio::test]
async fn test_create_tunnel_and_relay_traffic() {
    let relay = TestRelay::start(RelayBehavior::Echo).await.unwrap();
    let service = service_for(&relay);
    let destination = destination("create-and-relay", 22);

    let tunnel = service
        .create_tunnel(&destination, Arc::new(LoopbackRelayPolicy))
        .await
        .unwrap();
    assert_eq!(tunnel.destination(), &destination);
    assert_eq!(tunnel.policy_id(), "loopback");

    let mut client = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
        .await
        .unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    drop(client);
    tunnel.close().await.unwrap();

    // Counters are updated by the session task, which may still be finishing
    let mut stats = tunnel.statistics();
    for _ in 0..50 {
        if stats.bytes_received == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        stats = tunnel.statistics();
    }
    assert_eq!(stats.bytes_sent, 5);
    assert_eq!(stats.bytes_received, 5);
}

#[tokio::test]
async fn test_preflight_denial_fails_creation() {
    let relay = TestRelay::start(RelayBehavior::CloseWith(4033))
        .await
        .unwrap();
    let service = service_for(&relay);

    let result = service
        .create_tunnel(&destination("denied", 22), Arc::new(LoopbackRelayPolicy))
        .await;
    assert!(matches!(result, Err(TunnelError::AccessDenied(_))));
}

#[tokio::test]
async fn test_unknown_instance_fails_creation() {
    let relay = TestRelay::start(RelayBehavior::RejectHttp(404))
        .await
        .unwrap();
    let service = service_for(&relay);

    let result = service
        .create_tunnel(&destination("missing", 22), Arc::new(LoopbackRelayPolicy))
        .await;
    assert!(matches!(result, Err(TunnelError::NotFound(_))));
}

#[tokio::test]
async fn test_same_destination_reuses_local_port() {
    let relay = TestRelay::start(RelayBehavior::Echo).await.unwrap();
    let service = service_for(&relay);
    let destination = destination("stable-port", 3389);
    let preferred = PortFinder::for_destination(&destination).preferred_port();

    let first = service
        .create_tunnel(&destination, Arc::new(LoopbackRelayPolicy))
        .await
        .unwrap();
    let first_port = first.local_port();
    first.close().await.unwrap();

    let second = service
        .create_tunnel(&destination, Arc::new(LoopbackRelayPolicy))
        .await
        .unwrap();

    // Only comparable when the preferred port was free on this machine
    if first_port == preferred {
        assert_eq!(second.local_port(), first_port);
    }
    second.close().await.unwrap();
}
