//! Rendezvous controller.
//!
//! Matches a visitor's punch request to a listening client, waits for the
//! client's observed addresses, asks the [`Analyzer`] for a strategy and ships
//! timed instructions to both sides. Outcome reports flow back into the
//! analyzer so later pairings of the same NAT classes start from experience.

use crate::analysis::{AnalysisKey, Analyzer, DetectRole, RecommendedBehavior};
use crate::auth;
use crate::classify::{NatFeature, classify_nat_feature};
use crate::config::ControllerConfig;
use crate::error::{NatHoleError, Result};
use crate::msg::{
    Message, MessageSink, NatHoleClient, NatHoleDetectBehavior, NatHoleReport, NatHoleResp,
    NatHoleSid, NatHoleVisitor, PortsRange,
};
use crate::session::{Decision, Session, SessionState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Base read timeout before the strategy's own delays
const BASE_READ_TIMEOUT_MS: u64 = 5000;

/// Extra read timeout when either side listens on random ports
const RANDOM_LISTEN_EXTRA_MS: u64 = 30_000;

/// Allow-list entry admitting every visitor
const ALLOW_ALL: &str = "*";

/// Queue depth for a client's pending session ids
const SID_QUEUE_CAPACITY: usize = 32;

/// Receiving end of a listening client's session-id queue
pub type SidReceiver = mpsc::Receiver<NatHoleSid>;

/// A client listening for rendezvous requests on one proxy
#[derive(Debug, Clone)]
struct ClientCfg {
    sk: String,
    allow_users: Vec<String>,
    sid_tx: mpsc::Sender<NatHoleSid>,
}

impl ClientCfg {
    fn allows(&self, user: &str) -> bool {
        self.allow_users.iter().any(|u| u == ALLOW_ALL || u == user)
    }
}

/// Candidate ports a scanning side should try around the peer's last mapping
///
/// Empty when `ports_range_number` is 0. The window is
/// `port ± max(ports_difference + 5, ports_range_number)`, clamped to
/// `[1, 65535]`.
#[must_use]
pub fn candidate_ports(port: u16, ports_difference: i32, ports_range_number: u16) -> Vec<PortsRange> {
    if ports_range_number == 0 {
        return Vec::new();
    }
    let width = (i64::from(ports_difference) + 5).max(i64::from(ports_range_number));
    let port = i64::from(port);
    let from = (port - width).clamp(1, 65535);
    let to = (port + width).clamp(1, 65535);
    vec![PortsRange {
        from: from as u16,
        to: to as u16,
    }]
}

/// Read timeout shared by both sides
#[must_use]
pub fn read_timeout_ms(a: &RecommendedBehavior, b: &RecommendedBehavior) -> u64 {
    let mut timeout = a.send_delay_ms.max(b.send_delay_ms) + BASE_READ_TIMEOUT_MS;
    if a.listen_random_ports > 0 || b.listen_random_ports > 0 {
        timeout += RANDOM_LISTEN_EXTRA_MS;
    }
    timeout
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn new_sid() -> String {
    use rand::Rng;
    let suffix: [u8; 4] = rand::thread_rng().r#gen();
    format!("{}{}", unix_now(), hex::encode(suffix))
}

fn last_port(addrs: &[String]) -> Option<u16> {
    addrs
        .last()
        .and_then(|a| a.parse::<SocketAddr>().ok())
        .map(|a| a.port())
}

/// Everything one side needs to know about the other to build its response
struct Side<'a> {
    transaction_id: &'a str,
    mapped_addrs: &'a [String],
    assisted_addrs: &'a [String],
    feature: &'a NatFeature,
}

fn build_resp(
    sid: &str,
    protocol: &str,
    own: &Side<'_>,
    peer: &Side<'_>,
    behavior: &RecommendedBehavior,
    mode: u8,
    read_timeout_ms: u64,
) -> NatHoleResp {
    let candidate_ports = last_port(peer.mapped_addrs)
        .map(|port| {
            candidate_ports(port, peer.feature.ports_difference, behavior.ports_range_number)
        })
        .unwrap_or_default();

    NatHoleResp {
        transaction_id: own.transaction_id.to_string(),
        sid: sid.to_string(),
        protocol: protocol.to_string(),
        candidate_addrs: peer.mapped_addrs.to_vec(),
        assisted_addrs: peer.assisted_addrs.to_vec(),
        detect_behavior: NatHoleDetectBehavior {
            role: behavior.role,
            mode,
            ttl: behavior.ttl,
            send_delay_ms: behavior.send_delay_ms,
            read_timeout_ms,
            candidate_ports,
            send_random_ports: behavior.ports_random_number,
            listen_random_ports: behavior.listen_random_ports,
        },
        error: None,
    }
}

fn error_resp(transaction_id: &str, sid: &str, error: &NatHoleError) -> NatHoleResp {
    NatHoleResp {
        transaction_id: transaction_id.to_string(),
        sid: sid.to_string(),
        error: Some(error.to_string()),
        ..NatHoleResp::default()
    }
}

/// Send a response, logging and swallowing transport failures
async fn deliver(transport: &MessageSink, resp: NatHoleResp, delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if let Err(e) = transport.send(Message::Resp(resp)).await {
        tracing::warn!("failed to deliver NatHoleResp: {e}");
    }
}

/// Wait for both delivery tasks; returns how many of them panicked or were cancelled
async fn join_deliveries(client_send: JoinHandle<()>, visitor_send: JoinHandle<()>) -> usize {
    let (client_sent, visitor_sent) = tokio::join!(client_send, visitor_send);
    let mut failed = 0;
    for (side, sent) in [("client", client_sent), ("visitor", visitor_sent)] {
        if let Err(e) = sent {
            tracing::warn!("NatHoleResp delivery to {side} failed: {e}");
            failed += 1;
        }
    }
    failed
}

/// Reject a visitor: error response to it, error to the caller
async fn reject(msg: &NatHoleVisitor, transport: &MessageSink, err: NatHoleError) -> Result<()> {
    tracing::warn!(proxy = %msg.proxy_name, "nathole visitor rejected: {err}");
    deliver(transport, error_resp(&msg.transaction_id, "", &err), Duration::ZERO).await;
    Err(err)
}

/// Server-side rendezvous coordinator
pub struct Controller {
    /// Listening clients (proxy name -> ClientCfg)
    clients: Arc<RwLock<HashMap<String, ClientCfg>>>,
    /// Live sessions (sid -> Session)
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    /// Strategy scores
    analyzer: Arc<Analyzer>,
    /// Controller configuration
    config: ControllerConfig,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl Controller {
    /// Create a controller with its own analyzer
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_analyzer(config, Arc::new(Analyzer::new()))
    }

    /// Create a controller sharing an existing analyzer
    #[must_use]
    pub fn with_analyzer(config: ControllerConfig, analyzer: Arc<Analyzer>) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            analyzer,
            config,
        }
    }

    /// Register a listening client
    ///
    /// # Errors
    ///
    /// Returns [`NatHoleError::ClientAlreadyRegistered`] if `name` is taken.
    pub async fn listen_client(
        &self,
        name: &str,
        sk: &str,
        allow_users: Vec<String>,
    ) -> Result<SidReceiver> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(name) {
            return Err(NatHoleError::ClientAlreadyRegistered(name.to_string()));
        }
        let (sid_tx, sid_rx) = mpsc::channel(SID_QUEUE_CAPACITY);
        clients.insert(
            name.to_string(),
            ClientCfg {
                sk: sk.to_string(),
                allow_users,
                sid_tx,
            },
        );
        tracing::debug!(proxy = name, "client listening for nathole sessions");
        Ok(sid_rx)
    }

    /// Unregister a listening client
    pub async fn close_client(&self, name: &str) {
        if self.clients.write().await.remove(name).is_some() {
            tracing::debug!(proxy = name, "client closed");
        }
    }

    /// Look up a client and check the visitor may use it
    async fn lookup(&self, proxy: &str, visitor_user: &str) -> Result<ClientCfg> {
        let clients = self.clients.read().await;
        let client = clients
            .get(proxy)
            .ok_or_else(|| NatHoleError::ClientNotFound(proxy.to_string()))?;
        if !client.allows(visitor_user) {
            return Err(NatHoleError::VisitorNotAllowed {
                proxy: proxy.to_string(),
                user: visitor_user.to_string(),
            });
        }
        Ok(client.clone())
    }

    fn check_sign_key(&self, client: &ClientCfg, msg: &NatHoleVisitor) -> Result<()> {
        if !auth::verify_sign_key(&client.sk, msg.timestamp, &msg.sign_key) {
            return Err(NatHoleError::InvalidSignKey(msg.proxy_name.clone()));
        }
        if let Some(max_age) = self.config.max_sign_key_age {
            let age = unix_now().abs_diff(msg.timestamp);
            if age > max_age.as_secs() {
                return Err(NatHoleError::SignKeyExpired(msg.proxy_name.clone()));
            }
        }
        Ok(())
    }

    /// Handle a visitor's punch request
    ///
    /// Returns once both responses are out, or silently after
    /// `visitor_wait_timeout` if the client never answers.
    ///
    /// A resolved session outlives this call: a background task keeps it
    /// registered for the read timeout plus `session_linger_extra` so that
    /// [`Controller::handle_report`] can still match its sid, then removes it.
    ///
    /// # Errors
    ///
    /// Registration errors (after an error response to the visitor) and
    /// classification errors (after error responses to both sides).
    pub async fn handle_visitor(
        &self,
        msg: NatHoleVisitor,
        transport: MessageSink,
        visitor_user: &str,
    ) -> Result<()> {
        let client = match self.lookup(&msg.proxy_name, visitor_user).await {
            Ok(client) => client,
            Err(e) => return reject(&msg, &transport, e).await,
        };

        if msg.pre_check {
            let resp = NatHoleResp {
                transaction_id: msg.transaction_id.clone(),
                ..NatHoleResp::default()
            };
            deliver(&transport, resp, Duration::ZERO).await;
            return Ok(());
        }

        if let Err(e) = self.check_sign_key(&client, &msg) {
            return reject(&msg, &transport, e).await;
        }

        let sid = new_sid();
        let span = tracing::info_span!("nathole", sid = %sid, proxy = %msg.proxy_name);
        self.run_session(sid, msg, transport, client)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        sid: String,
        msg: NatHoleVisitor,
        transport: MessageSink,
        client: ClientCfg,
    ) -> Result<()> {
        let notify = NatHoleSid {
            transaction_id: msg.transaction_id.clone(),
            sid: sid.clone(),
            protocol: msg.protocol.clone(),
            nonce: hex::encode(rand::random::<[u8; 8]>()),
        };
        let session = Arc::new(Session::new(sid.clone(), msg, transport));
        self.sessions
            .write()
            .await
            .insert(sid.clone(), session.clone());

        if client.sid_tx.send(notify).await.is_err() {
            self.remove_session(&sid).await;
            let err = NatHoleError::ClientNotFound(session.visitor_msg.proxy_name.clone());
            return reject(&session.visitor_msg, &session.visitor_transport, err).await;
        }
        session.set_state(SessionState::AwaitingClient).await;
        tracing::debug!("sid delivered, waiting for client");

        if !session.ready.wait_timeout(self.config.visitor_wait_timeout).await {
            session.set_state(SessionState::TimedOut).await;
            self.remove_session(&sid).await;
            tracing::info!("client did not answer in time");
            return Ok(());
        }

        match self.resolve(&session).await {
            Ok(linger) => {
                self.spawn_linger(sid, linger);
                Ok(())
            }
            Err(e) => {
                self.remove_session(&sid).await;
                Err(e)
            }
        }
    }

    /// Classify both sides, pick a strategy and deliver the responses.
    /// Returns how long the session should linger for reports.
    async fn resolve(&self, session: &Session) -> Result<Duration> {
        let mut inner = session.inner.lock().await;
        inner.state = SessionState::Resolved;
        let (Some(client_msg), Some(client_transport)) =
            (inner.client_msg.clone(), inner.client_transport.clone())
        else {
            return Err(NatHoleError::TransportClosed("client answer missing".into()));
        };
        let visitor_msg = &session.visitor_msg;

        let features = classify_nat_feature(&client_msg.mapped_addrs, &client_msg.assisted_addrs)
            .and_then(|c| {
                classify_nat_feature(&visitor_msg.mapped_addrs, &visitor_msg.assisted_addrs)
                    .map(|v| (c, v))
            });
        let (client_feature, visitor_feature) = match features {
            Ok(pair) => pair,
            Err(e) => {
                drop(inner);
                let err = NatHoleError::from(e);
                tracing::warn!("classification failed: {err}");
                let client_resp = error_resp(&client_msg.transaction_id, &session.sid, &err);
                let visitor_resp = error_resp(&visitor_msg.transaction_id, &session.sid, &err);
                tokio::join!(
                    deliver(&client_transport, client_resp, Duration::ZERO),
                    deliver(&session.visitor_transport, visitor_resp, Duration::ZERO),
                );
                return Err(err);
            }
        };

        let key = AnalysisKey::new(&client_feature, &visitor_feature);
        let rec = self.analyzer.recommend(&key, &client_feature, &visitor_feature);
        let read_timeout = read_timeout_ms(&rec.client_behavior, &rec.visitor_behavior);
        tracing::info!(
            %key,
            mode = %rec.mode,
            index = rec.index,
            client_nat = %client_feature.nat_type,
            visitor_nat = %visitor_feature.nat_type,
            "strategy selected"
        );

        let client_side = Side {
            transaction_id: &client_msg.transaction_id,
            mapped_addrs: &client_msg.mapped_addrs,
            assisted_addrs: &client_msg.assisted_addrs,
            feature: &client_feature,
        };
        let visitor_side = Side {
            transaction_id: &visitor_msg.transaction_id,
            mapped_addrs: &visitor_msg.mapped_addrs,
            assisted_addrs: &visitor_msg.assisted_addrs,
            feature: &visitor_feature,
        };
        let mode = rec.mode.as_u8();
        let client_resp = build_resp(
            &session.sid,
            &visitor_msg.protocol,
            &client_side,
            &visitor_side,
            &rec.client_behavior,
            mode,
            read_timeout,
        );
        let visitor_resp = build_resp(
            &session.sid,
            &visitor_msg.protocol,
            &visitor_side,
            &client_side,
            &rec.visitor_behavior,
            mode,
            read_timeout,
        );

        inner.decision = Some(Decision {
            key,
            mode: rec.mode,
            index: rec.index,
            client_behavior: rec.client_behavior,
            visitor_behavior: rec.visitor_behavior,
        });
        drop(inner);

        let delay_for = |b: &RecommendedBehavior| {
            if b.role == DetectRole::Sender {
                self.config.sender_send_delay
            } else {
                Duration::ZERO
            }
        };
        let client_send = tokio::spawn({
            let delay = delay_for(&rec.client_behavior);
            async move { deliver(&client_transport, client_resp, delay).await }.in_current_span()
        });
        let visitor_send = tokio::spawn({
            let delay = delay_for(&rec.visitor_behavior);
            let transport = session.visitor_transport.clone();
            async move { deliver(&transport, visitor_resp, delay).await }.in_current_span()
        });
        join_deliveries(client_send, visitor_send).await;

        Ok(Duration::from_millis(read_timeout) + self.config.session_linger_extra)
    }

    /// Keep the session around for outcome reports, then drop it
    fn spawn_linger(&self, sid: String, linger: Duration) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let removed = sessions.write().await.remove(&sid);
            if let Some(session) = removed {
                session.set_state(SessionState::Closed).await;
                tracing::debug!(sid = %sid, age = ?session.age(), "session closed");
            }
        });
    }

    async fn remove_session(&self, sid: &str) {
        let removed = self.sessions.write().await.remove(sid);
        if let Some(session) = removed {
            let mut inner = session.inner.lock().await;
            if inner.state != SessionState::TimedOut {
                inner.state = SessionState::Closed;
            }
            tracing::debug!(age = ?session.age(), state = ?inner.state, "session removed");
        }
    }

    async fn session(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(sid).cloned()
    }

    /// Handle a client's answer to a session id. Unknown or already
    /// answered sessions are ignored.
    pub async fn handle_client(&self, msg: NatHoleClient, transport: MessageSink) {
        let Some(session) = self.session(&msg.sid).await else {
            tracing::debug!(sid = %msg.sid, "NatHoleClient for unknown session");
            return;
        };
        if !session.attach_client(msg, transport).await {
            tracing::debug!(sid = %session.sid, "duplicate NatHoleClient ignored");
        }
    }

    /// Feed a punch outcome back into the analyzer. Expired sessions are ignored.
    pub async fn handle_report(&self, msg: NatHoleReport) {
        let Some(session) = self.session(&msg.sid).await else {
            tracing::debug!(sid = %msg.sid, "NatHoleReport for unknown session");
            return;
        };
        let decision = session.inner.lock().await.decision;
        if let Some(d) = decision {
            let score = self.analyzer.report(&d.key, d.mode, d.index, msg.success);
            tracing::info!(
                sid = %msg.sid,
                mode = %d.mode,
                index = d.index,
                success = msg.success,
                ?score,
                "punch outcome"
            );
        }
    }

    /// Spawn periodic analyzer sweeps if an interval is configured
    pub fn spawn_sweep_task(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.analyzer_sweep_interval?;
        let analyzer = self.analyzer.clone();
        let max_idle = self.config.analyzer_max_idle;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = analyzer.sweep(max_idle);
                if removed > 0 {
                    tracing::debug!(removed, "swept idle make-hole records");
                }
            }
        }))
    }

    /// Number of listening clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Shared strategy analyzer
    #[must_use]
    pub fn analyzer(&self) -> &Arc<Analyzer> {
        &self.analyzer
    }

    /// Controller configuration
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            visitor_wait_timeout: Duration::from_millis(200),
            sender_send_delay: Duration::from_millis(10),
            session_linger_extra: Duration::ZERO,
            ..ControllerConfig::default()
        }
    }

    fn visitor(proxy: &str, sk: &str) -> NatHoleVisitor {
        let timestamp = unix_now();
        NatHoleVisitor {
            transaction_id: "vtx".into(),
            proxy_name: proxy.into(),
            protocol: "quic".into(),
            sign_key: auth::sign_key(sk, timestamp),
            timestamp,
            mapped_addrs: vec!["1.2.3.4:100".into()],
            ..NatHoleVisitor::default()
        }
    }

    async fn expect_error(rx: &mut mpsc::Receiver<Message>) -> String {
        match rx.recv().await {
            Some(Message::Resp(resp)) => resp.error.unwrap_or_default(),
            other => panic!("expected NatHoleResp, got {other:?}"),
        }
    }

    #[test]
    fn test_candidate_ports_window() {
        assert!(candidate_ports(5000, 2, 0).is_empty());
        assert_eq!(
            candidate_ports(5000, 2, 10),
            vec![PortsRange { from: 4990, to: 5010 }]
        );
        // Difference wider than the range wins
        assert_eq!(
            candidate_ports(5000, 20, 10),
            vec![PortsRange { from: 4975, to: 5025 }]
        );
        assert_eq!(candidate_ports(1, 0, 200), vec![PortsRange { from: 1, to: 201 }]);
        assert_eq!(
            candidate_ports(65535, 0, 200),
            vec![PortsRange { from: 65335, to: 65535 }]
        );
    }

    #[test]
    fn test_read_timeout() {
        let a = RecommendedBehavior {
            role: DetectRole::Sender,
            ttl: 0,
            send_delay_ms: 1000,
            ports_range_number: 0,
            ports_random_number: 0,
            listen_random_ports: 0,
        };
        let mut b = a;
        b.send_delay_ms = 0;
        assert_eq!(read_timeout_ms(&a, &b), 6000);
        b.listen_random_ports = 256;
        assert_eq!(read_timeout_ms(&a, &b), 36_000);
    }

    #[tokio::test]
    async fn test_join_deliveries_counts_panics() {
        let ok = tokio::spawn(async {});
        let panicked = tokio::spawn(async { panic!("delivery blew up") });
        assert_eq!(join_deliveries(ok, panicked).await, 1);

        let a = tokio::spawn(async {});
        let b = tokio::spawn(async {});
        assert_eq!(join_deliveries(a, b).await, 0);
    }

    #[test]
    fn test_sid_format() {
        let sid = new_sid();
        assert_eq!(sid.len(), unix_now().to_string().len() + 8);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_listen_and_close_client() {
        let controller = Controller::new(fast_config());
        let _rx = controller.listen_client("web", "k", vec!["*".into()]).await.unwrap();
        assert_eq!(controller.client_count().await, 1);

        let err = controller
            .listen_client("web", "k", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, NatHoleError::ClientAlreadyRegistered(_)));

        controller.close_client("web").await;
        assert_eq!(controller.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_pre_check_ok() {
        let controller = Controller::new(fast_config());
        let _sids = controller.listen_client("web", "k", vec!["*".into()]).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let msg = NatHoleVisitor {
            pre_check: true,
            ..visitor("web", "k")
        };
        controller.handle_visitor(msg, tx, "alice").await.unwrap();
        assert_eq!(expect_error(&mut rx).await, "");
        assert_eq!(controller.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_visitor_not_allowed() {
        let controller = Controller::new(fast_config());
        let _sids = controller.listen_client("web", "k", vec!["bob".into()]).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let err = controller
            .handle_visitor(visitor("web", "k"), tx, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, NatHoleError::VisitorNotAllowed { .. }));
        assert!(expect_error(&mut rx).await.contains("alice"));
    }

    #[tokio::test]
    async fn test_invalid_sign_key() {
        let controller = Controller::new(fast_config());
        let _sids = controller.listen_client("web", "k", vec!["*".into()]).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let err = controller
            .handle_visitor(visitor("web", "wrong"), tx, "")
            .await
            .unwrap_err();
        assert!(matches!(err, NatHoleError::InvalidSignKey(_)));
        assert!(!expect_error(&mut rx).await.is_empty());
        assert_eq!(controller.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_sign_key_expired() {
        let config = ControllerConfig {
            max_sign_key_age: Some(Duration::from_secs(60)),
            ..fast_config()
        };
        let controller = Controller::new(config);
        let _sids = controller.listen_client("web", "k", vec!["*".into()]).await.unwrap();
        let mut msg = visitor("web", "k");
        msg.timestamp -= 3600;
        msg.sign_key = auth::sign_key("k", msg.timestamp);

        let (tx, _rx) = mpsc::channel(4);
        let err = controller.handle_visitor(msg, tx, "").await.unwrap_err();
        assert!(matches!(err, NatHoleError::SignKeyExpired(_)));
    }

    #[tokio::test]
    async fn test_classification_error_reaches_both_sides() {
        let controller = Arc::new(Controller::new(fast_config()));
        let mut sids = controller.listen_client("web", "k", vec!["*".into()]).await.unwrap();
        let (vtx, mut vrx) = mpsc::channel(4);
        let (ctx, mut crx) = mpsc::channel(4);

        let visitor_task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.handle_visitor(visitor("web", "k"), vtx, "").await }
        });

        let notify = sids.recv().await.unwrap();
        let answer = NatHoleClient {
            transaction_id: "ctx".into(),
            sid: notify.sid.clone(),
            mapped_addrs: vec!["garbage".into()],
            ..NatHoleClient::default()
        };
        controller.handle_client(answer, ctx).await;

        let err = visitor_task.await.unwrap().unwrap_err();
        assert!(matches!(err, NatHoleError::Classify(_)));
        let visitor_err = expect_error(&mut vrx).await;
        assert!(!visitor_err.is_empty());
        assert_eq!(expect_error(&mut crx).await, visitor_err);
        assert_eq!(controller.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_report_updates_analyzer() {
        let controller = Arc::new(Controller::new(ControllerConfig {
            session_linger_extra: Duration::from_secs(30),
            ..fast_config()
        }));
        let mut sids = controller.listen_client("web", "k", vec!["*".into()]).await.unwrap();
        let (vtx, mut vrx) = mpsc::channel(4);
        let (ctx, mut crx) = mpsc::channel(4);

        let visitor_task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.handle_visitor(visitor("web", "k"), vtx, "").await }
        });
        let notify = sids.recv().await.unwrap();
        controller
            .handle_client(
                NatHoleClient {
                    sid: notify.sid.clone(),
                    mapped_addrs: vec!["5.6.7.8:200".into()],
                    ..NatHoleClient::default()
                },
                ctx,
            )
            .await;
        visitor_task.await.unwrap().unwrap();
        assert!(vrx.recv().await.is_some());
        assert!(crx.recv().await.is_some());

        controller
            .handle_report(NatHoleReport {
                sid: notify.sid.clone(),
                success: true,
            })
            .await;

        let session = controller.session(&notify.sid).await.unwrap();
        let decision = session.inner.lock().await.decision.unwrap();
        let scores = controller.analyzer().scores(&decision.key).unwrap();
        let entry = scores
            .iter()
            .find(|s| s.mode == decision.mode && s.index == decision.index)
            .unwrap();
        assert_eq!(entry.score, 1);
    }

    #[tokio::test]
    async fn test_sweep_task_disabled_by_default() {
        let controller = Controller::default();
        assert!(controller.spawn_sweep_task().is_none());

        let controller = Controller::new(ControllerConfig {
            analyzer_sweep_interval: Some(Duration::from_secs(60)),
            ..ControllerConfig::default()
        });
        let handle = controller.spawn_sweep_task().unwrap();
        handle.abort();
    }

    proptest! {
        #[test]
        fn prop_candidate_ports_bounded(
            port in any::<u16>(),
            difference in -70_000i32..70_000,
            range in 0u16..=u16::MAX,
        ) {
            for r in candidate_ports(port, difference, range) {
                prop_assert!(1 <= r.from);
                prop_assert!(r.from <= r.to);
            }
        }
    }
}
