//! Tunnel lifecycle against real client sockets

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use burrow_control::{BridgeState, RegistryConfig, TunnelRegistry};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const GRACE: Duration = Duration::from_millis(300);

fn registry() -> TunnelRegistry {
    TunnelRegistry::new(RegistryConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        grace_period: GRACE,
        ..Default::default()
    })
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_reconnect_within_grace_keeps_tunnel() {
    let registry = registry();
    let allocation = registry.allocate(Some("steady")).await.unwrap();
    let tunnel = registry.get("steady").unwrap();

    let socket = TcpStream::connect(("127.0.0.1", allocation.port)).await.unwrap();
    eventually("online", || tunnel.bridge().state() == BridgeState::Online).await;

    drop(socket);
    eventually("offline", || tunnel.bridge().state() == BridgeState::Offline).await;

    let _socket = TcpStream::connect(("127.0.0.1", allocation.port)).await.unwrap();
    eventually("back online", || tunnel.bridge().state() == BridgeState::Online).await;

    sleep(GRACE * 3).await;
    assert!(registry.contains("steady"));
    assert_eq!(tunnel.connected_sockets(), 1);
    assert_eq!(registry.stats().tunnels, 1);
}

#[tokio::test]
async fn test_offline_past_grace_frees_id() {
    let registry = registry();
    let allocation = registry.allocate(Some("fleeting")).await.unwrap();

    let socket = TcpStream::connect(("127.0.0.1", allocation.port)).await.unwrap();
    let tunnel = registry.get("fleeting").unwrap();
    eventually("online", || tunnel.connected_sockets() == 1).await;
    drop(tunnel);

    drop(socket);
    eventually("removal", || !registry.contains("fleeting")).await;
    assert_eq!(registry.stats().tunnels, 0);

    // The id is free again
    let again = registry.allocate(Some("fleeting")).await.unwrap();
    assert_eq!(again.id, "fleeting");
}

#[tokio::test]
async fn test_fresh_tunnel_without_client_stays() {
    let registry = registry();
    registry.allocate(Some("patient")).await.unwrap();

    sleep(GRACE * 3).await;
    assert!(registry.contains("patient"));
    assert_eq!(
        registry.get("patient").unwrap().bridge().state(),
        BridgeState::Created
    );
}
