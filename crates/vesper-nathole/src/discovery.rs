//! STUN address discovery
//!
//! Learns how the outside world sees a local UDP socket by asking one or more
//! STUN servers from that same socket. When a server advertises an alternate
//! address (OTHER-ADDRESS / CHANGED-ADDRESS) one extra request goes there, so
//! the classifier gets two samples for the price of one server.
//!
//! The socket is handed back open: the punch that follows must reuse the very
//! mapping that was just observed.

use crate::config::DiscoveryConfig;
use crate::stun::{StunAttribute, StunError, StunMessage, StunMessageClass};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RECV_BUFFER_SIZE: usize = 1500;

/// Result of a discovery run
#[derive(Debug)]
pub struct Discovery {
    /// External mappings in query order
    pub external_addrs: Vec<SocketAddr>,
    /// Local address of the socket
    pub local_addr: SocketAddr,
    /// The socket the mappings belong to
    pub socket: Arc<UdpSocket>,
}

impl Discovery {
    /// External mappings as `ip:port` strings, the form carried in messages
    #[must_use]
    pub fn mapped_addrs(&self) -> Vec<String> {
        self.external_addrs.iter().map(ToString::to_string).collect()
    }
}

type Incoming = Result<(StunMessage, SocketAddr), StunError>;

/// Aborts the receive loop when dropped
struct RecvLoopGuard(JoinHandle<()>);

impl Drop for RecvLoopGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Incoming>) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    loop {
        let item = match socket.recv_from(&mut buf).await {
            Ok((len, from)) => StunMessage::decode(&buf[..len]).map(|m| (m, from)),
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        if tx.send(item).await.is_err() {
            return;
        }
    }
}

struct Requester<'a> {
    socket: &'a UdpSocket,
    rx: mpsc::Receiver<Incoming>,
    config: &'a DiscoveryConfig,
}

impl Requester<'_> {
    fn binding_request(&self) -> StunMessage {
        let mut request = StunMessage::binding_request();
        if let Some(software) = &self.config.software {
            request.add_attribute(StunAttribute::Software(software.clone()));
        }
        if let Some(credentials) = &self.config.credentials {
            request.add_attribute(StunAttribute::Username(credentials.username.clone()));
            request.add_message_integrity(credentials);
        }
        request.add_fingerprint();
        request
    }

    /// Reject a response whose FINGERPRINT or MESSAGE-INTEGRITY does not check out
    fn verify(&self, response: &StunMessage) -> Result<(), StunError> {
        if response.has_fingerprint() {
            response.verify_fingerprint()?;
        }
        match &self.config.credentials {
            Some(credentials) if response.has_message_integrity() => {
                response.verify_message_integrity(credentials)
            }
            _ => Ok(()),
        }
    }

    /// Send a Binding Request and wait for the matching response
    async fn request(&mut self, server: SocketAddr) -> Result<StunMessage, StunError> {
        let request = self.binding_request();
        self.socket.send_to(&request.encode(), server).await?;

        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        loop {
            let incoming = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .map_err(|_| StunError::Timeout(server))?
                .ok_or(StunError::Closed)?;
            let (response, from) = incoming?;

            if response.transaction_id != request.transaction_id {
                tracing::debug!(%from, "skipping STUN response for another transaction");
                continue;
            }
            self.verify(&response)?;
            if response.message_class == StunMessageClass::ErrorResponse {
                return Err(StunError::ErrorResponse(from));
            }
            return Ok(response);
        }
    }
}

async fn resolve(server: &str, local: SocketAddr) -> Result<SocketAddr, StunError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server)
        .await
        .map_err(|_| StunError::Resolve(server.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4() == local.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| StunError::Resolve(server.to_string()))
}

/// Discover the external mappings of a fresh UDP socket
///
/// Binds `local_addr` (or `0.0.0.0:0`) and queries each server in order.
///
/// # Errors
///
/// Any socket error, timeout, error response or malformed reply aborts the
/// whole run.
pub async fn discover(
    stun_servers: &[String],
    local_addr: Option<SocketAddr>,
    config: &DiscoveryConfig,
) -> Result<Discovery, StunError> {
    if stun_servers.is_empty() {
        return Err(StunError::NoServers);
    }

    let bind = local_addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    let local_addr = socket.local_addr()?;

    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let _guard = RecvLoopGuard(tokio::spawn(recv_loop(socket.clone(), tx)));

    let mut requester = Requester {
        socket: &socket,
        rx,
        config,
    };
    let mut external_addrs = Vec::new();

    for server in stun_servers {
        let target = resolve(server, local_addr).await?;
        let response = requester.request(target).await?;
        let mapped = response.mapped_address().ok_or(StunError::MissingAttribute)?;
        tracing::debug!(%server, %mapped, "STUN mapping");
        external_addrs.push(mapped);

        if let Some(other) = response.other_address() {
            let response = requester.request(other).await?;
            let mapped = response.mapped_address().ok_or(StunError::MissingAttribute)?;
            tracing::debug!(%other, %mapped, "STUN mapping from alternate address");
            external_addrs.push(mapped);
        }
    }

    Ok(Discovery {
        external_addrs,
        local_addr,
        socket,
    })
}
