//! STUN discovery against fake servers on loopback.

use std::time::Duration;
use tokio::net::UdpSocket;
use vesper_integration_tests::{StunBehavior, spawn_stun_server};
use vesper_nathole::{DiscoveryConfig, NatType, StunError, classify_nat_feature, discover};

fn quick() -> DiscoveryConfig {
    DiscoveryConfig {
        request_timeout: Duration::from_millis(300),
        ..DiscoveryConfig::default()
    }
}

#[tokio::test]
async fn test_discover_and_classify() {
    let first = spawn_stun_server(StunBehavior::Xor).await;
    let second = spawn_stun_server(StunBehavior::Xor).await;

    let discovery = discover(&[first.to_string(), second.to_string()], None, &quick())
        .await
        .unwrap();
    assert_eq!(discovery.external_addrs.len(), 2);

    // Loopback never remaps, so both servers agree
    let feature = classify_nat_feature(&discovery.mapped_addrs(), &[]).unwrap();
    assert_eq!(feature.nat_type, NatType::Easy);
}

#[tokio::test]
async fn test_other_address_adds_sample() {
    let alternate = spawn_stun_server(StunBehavior::Xor).await;
    let primary = spawn_stun_server(StunBehavior::WithOther(alternate)).await;

    let discovery = discover(&[primary.to_string()], None, &quick()).await.unwrap();
    assert_eq!(discovery.external_addrs.len(), 2);
}

#[tokio::test]
async fn test_changed_address_adds_sample() {
    let alternate = spawn_stun_server(StunBehavior::Legacy).await;
    let primary = spawn_stun_server(StunBehavior::WithChanged(alternate)).await;

    let discovery = discover(&[primary.to_string()], None, &quick()).await.unwrap();
    assert_eq!(discovery.external_addrs.len(), 2);
    assert_eq!(discovery.external_addrs[0], discovery.external_addrs[1]);
}

#[tokio::test]
async fn test_legacy_mapped_address() {
    let server = spawn_stun_server(StunBehavior::Legacy).await;
    let discovery = discover(&[server.to_string()], None, &quick()).await.unwrap();
    assert_eq!(
        discovery.external_addrs[0].port(),
        discovery.local_addr.port()
    );
}

#[tokio::test]
async fn test_stray_transaction_skipped() {
    let server = spawn_stun_server(StunBehavior::Noisy).await;
    let discovery = discover(&[server.to_string()], None, &quick()).await.unwrap();
    assert_eq!(discovery.external_addrs.len(), 1);
    assert_ne!(discovery.external_addrs[0].port(), 1);
}

#[tokio::test]
async fn test_error_response_is_fatal() {
    let good = spawn_stun_server(StunBehavior::Xor).await;
    let bad = spawn_stun_server(StunBehavior::Error).await;
    let err = discover(&[good.to_string(), bad.to_string()], None, &quick())
        .await
        .unwrap_err();
    assert!(matches!(err, StunError::ErrorResponse(from) if from == bad));
}

#[tokio::test]
async fn test_malformed_reply_is_fatal() {
    let server = spawn_stun_server(StunBehavior::Garbage).await;
    let err = discover(&[server.to_string()], None, &quick())
        .await
        .unwrap_err();
    assert!(!matches!(err, StunError::Timeout(_)));
}

#[tokio::test]
async fn test_timeout_is_fatal() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = silent.local_addr().unwrap();
    let err = discover(&[target.to_string()], None, &quick())
        .await
        .unwrap_err();
    assert!(matches!(err, StunError::Timeout(addr) if addr == target));
}

#[tokio::test]
async fn test_bind_to_requested_local_addr() {
    let server = spawn_stun_server(StunBehavior::Xor).await;
    let reserve = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = reserve.local_addr().unwrap();
    drop(reserve);

    let discovery = discover(&[server.to_string()], Some(local), &quick())
        .await
        .unwrap();
    assert_eq!(discovery.local_addr, local);
    assert_eq!(discovery.external_addrs[0], local);
}

#[tokio::test]
async fn test_unresolvable_server() {
    let err = discover(&["stun-without-port".to_string()], None, &quick())
        .await
        .unwrap_err();
    assert!(matches!(err, StunError::Resolve(_)));
}
