//! Shared helpers for the VESPER integration tests.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use vesper_nathole::msg::{NatHoleResp, NatHoleVisitor};
use vesper_nathole::stun::{StunAttribute, StunMessage, StunMessageClass, StunMessageType};
use vesper_nathole::{ControllerConfig, Message, auth};

/// How a fake STUN server answers
#[derive(Debug, Clone, Copy)]
pub enum StunBehavior {
    /// XOR-MAPPED-ADDRESS of the source
    Xor,
    /// MAPPED-ADDRESS only, as RFC 3489 servers do
    Legacy,
    /// XOR-MAPPED-ADDRESS plus OTHER-ADDRESS pointing elsewhere
    WithOther(SocketAddr),
    /// XOR-MAPPED-ADDRESS plus CHANGED-ADDRESS pointing elsewhere
    WithChanged(SocketAddr),
    /// A stray response for another transaction first, then the real one
    Noisy,
    /// Binding error response
    Error,
    /// Bytes that are not STUN
    Garbage,
}

/// Spawn a fake STUN server on loopback
pub async fn spawn_stun_server(behavior: StunBehavior) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let Ok(request) = StunMessage::decode(&buf[..len]) else {
                continue;
            };
            let mut response = StunMessage::binding_response(request.transaction_id);
            match behavior {
                StunBehavior::Xor => {
                    response.add_attribute(StunAttribute::XorMappedAddress(from));
                }
                StunBehavior::Legacy => {
                    response.add_attribute(StunAttribute::MappedAddress(from));
                }
                StunBehavior::WithOther(other) => {
                    response.add_attribute(StunAttribute::XorMappedAddress(from));
                    response.add_attribute(StunAttribute::OtherAddress(other));
                }
                StunBehavior::WithChanged(other) => {
                    response.add_attribute(StunAttribute::XorMappedAddress(from));
                    response.add_attribute(StunAttribute::ChangedAddress(other));
                }
                StunBehavior::Noisy => {
                    let mut stray = StunMessage::binding_response([0xEE; 12]);
                    stray.add_attribute(StunAttribute::XorMappedAddress(
                        "203.0.113.1:1".parse().unwrap(),
                    ));
                    socket.send_to(&stray.encode(), from).await.unwrap();
                    response.add_attribute(StunAttribute::XorMappedAddress(from));
                }
                StunBehavior::Error => {
                    response = StunMessage {
                        message_type: StunMessageType::Binding,
                        message_class: StunMessageClass::ErrorResponse,
                        transaction_id: request.transaction_id,
                        attributes: Vec::new(),
                    };
                }
                StunBehavior::Garbage => {
                    socket.send_to(b"definitely not stun", from).await.unwrap();
                    continue;
                }
            }
            socket.send_to(&response.encode(), from).await.unwrap();
        }
    });
    addr
}

/// Controller settings with short timeouts
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        visitor_wait_timeout: Duration::from_millis(500),
        sender_send_delay: Duration::from_millis(50),
        session_linger_extra: Duration::from_secs(30),
        ..ControllerConfig::default()
    }
}

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// A signed visitor request
pub fn signed_visitor(proxy: &str, sk: &str, mapped: &[&str]) -> NatHoleVisitor {
    let timestamp = now_secs();
    NatHoleVisitor {
        transaction_id: format!("visitor-{proxy}"),
        proxy_name: proxy.to_string(),
        protocol: "quic".to_string(),
        sign_key: auth::sign_key(sk, timestamp),
        timestamp,
        mapped_addrs: mapped.iter().map(|a| (*a).to_string()).collect(),
        ..NatHoleVisitor::default()
    }
}

/// Next message on a transport, which must be a `NatHoleResp`
pub async fn recv_resp(rx: &mut mpsc::Receiver<Message>) -> NatHoleResp {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(Message::Resp(resp))) => resp,
        other => panic!("expected NatHoleResp, got {other:?}"),
    }
}
