//! Control-channel server.
//!
//! Each TCP connection speaks framed [`Message`]s. A connection that sends
//! `NatHoleListen` becomes the listening client for that proxy until it
//! closes; visitors and client answers can arrive on any connection.

use crate::config::{ClientEntry, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vesper_nathole::msg::{NatHoleListen, NatHoleResp, read_msg, write_msg};
use vesper_nathole::{Controller, Message, MessageSink};

const OUTBOUND_QUEUE: usize = 64;

/// Run the server until the listener fails
///
/// # Errors
///
/// Returns an error if the listen address cannot be bound or accept fails.
pub async fn run(config: &Config, listen_addr: SocketAddr) -> anyhow::Result<()> {
    let controller = Arc::new(Controller::new(config.controller_config()));
    let _sweep = controller.spawn_sweep_task();
    let clients: Arc<Vec<ClientEntry>> = Arc::new(config.clients.clone());

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(
        "nathole rendezvous listening on {} ({} proxies configured)",
        listener.local_addr()?,
        clients.len()
    );
    accept_loop(listener, controller, clients).await
}

async fn accept_loop(
    listener: TcpListener,
    controller: Arc<Controller>,
    clients: Arc<Vec<ClientEntry>>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let controller = controller.clone();
        let clients = clients.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, controller, clients).await;
        });
    }
}

async fn send(tx: &MessageSink, msg: Message) {
    if let Err(e) = tx.send(msg).await {
        tracing::warn!("outbound queue closed: {e}");
    }
}

fn error_resp(error: String) -> Message {
    Message::Resp(NatHoleResp {
        error: Some(error),
        ..NatHoleResp::default()
    })
}

/// Serve one control connection until it closes
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    controller: Arc<Controller>,
    clients: Arc<Vec<ClientEntry>>,
) {
    tracing::debug!(%peer, "control connection opened");
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_msg(&mut writer, &msg).await {
                tracing::debug!(%peer, "write failed: {e}");
                break;
            }
        }
    });

    let mut listening: Vec<(String, JoinHandle<()>)> = Vec::new();

    loop {
        let msg = match read_msg(&mut reader).await {
            Ok(msg) => msg,
            Err(e) if e.is_eof() => break,
            Err(e) => {
                tracing::warn!(%peer, "dropping connection: {e}");
                break;
            }
        };
        tracing::debug!(%peer, "received {}", msg.message_type());

        match msg {
            Message::Listen(NatHoleListen { proxy_name }) => {
                let Some(entry) = clients.iter().find(|c| c.name == proxy_name) else {
                    tracing::warn!(%peer, proxy = %proxy_name, "listen for unconfigured proxy");
                    send(&tx, error_resp(format!("proxy [{proxy_name}] is not configured"))).await;
                    continue;
                };
                match controller
                    .listen_client(&entry.name, &entry.sk, entry.allow_users.clone())
                    .await
                {
                    Ok(mut sids) => {
                        let tx = tx.clone();
                        let forwarder = tokio::spawn(async move {
                            while let Some(sid) = sids.recv().await {
                                send(&tx, Message::Sid(sid)).await;
                            }
                        });
                        tracing::info!(%peer, proxy = %proxy_name, "client listening");
                        listening.push((proxy_name, forwarder));
                    }
                    Err(e) => send(&tx, error_resp(e.to_string())).await,
                }
            }
            Message::Visitor(visitor) => {
                let controller = controller.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.handle_visitor(visitor, tx, "").await {
                        tracing::debug!(%peer, "visitor request ended: {e}");
                    }
                });
            }
            Message::Client(client) => controller.handle_client(client, tx.clone()).await,
            Message::Report(report) => controller.handle_report(report).await,
            other @ (Message::Resp(_) | Message::Sid(_)) => {
                tracing::warn!(%peer, "unexpected {} from peer", other.message_type());
            }
        }
    }

    for (proxy, forwarder) in listening {
        controller.close_client(&proxy).await;
        forwarder.abort();
        tracing::info!(%peer, %proxy, "client closed");
    }
    // Sessions may still hold `tx`; nothing more can reach this peer
    writer_task.abort();
    tracing::debug!(%peer, "control connection closed");
}
