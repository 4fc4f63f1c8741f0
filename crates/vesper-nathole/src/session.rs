//! Per-rendezvous session state.

use crate::analysis::{AnalysisKey, DetectMode, RecommendedBehavior};
use crate::msg::{MessageSink, NatHoleClient, NatHoleVisitor};
use crate::signal::ReadySignal;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, sid not yet delivered
    Created,
    /// Sid delivered, waiting for the client's answer
    AwaitingClient,
    /// Client answered, responses built
    Resolved,
    /// Client never answered
    TimedOut,
    /// Removed from the registry
    Closed,
}

/// Strategy chosen for the session, kept for outcome reports
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    /// Analyzer key of the pairing
    pub key: AnalysisKey,
    /// Chosen mode
    pub mode: DetectMode,
    /// Chosen index within the mode
    pub index: usize,
    /// Client's instructions
    pub client_behavior: RecommendedBehavior,
    /// Visitor's instructions
    pub visitor_behavior: RecommendedBehavior,
}

/// Mutable part of a session
#[derive(Debug)]
pub struct SessionInner {
    /// Lifecycle state
    pub state: SessionState,
    /// Client's answer
    pub client_msg: Option<NatHoleClient>,
    /// Where to send the client's response
    pub client_transport: Option<MessageSink>,
    /// Chosen strategy
    pub decision: Option<Decision>,
}

/// One rendezvous attempt between a visitor and a listening client
#[derive(Debug)]
pub struct Session {
    /// Session id
    pub sid: String,
    /// Visitor's request
    pub visitor_msg: NatHoleVisitor,
    /// Where to send the visitor's response
    pub visitor_transport: MessageSink,
    /// Fires when the client answers
    pub ready: ReadySignal,
    /// Creation time
    pub created_at: Instant,
    /// Everything filled in after creation
    pub inner: Mutex<SessionInner>,
}

impl Session {
    /// New session in [`SessionState::Created`]
    #[must_use]
    pub fn new(sid: String, visitor_msg: NatHoleVisitor, visitor_transport: MessageSink) -> Self {
        Self {
            sid,
            visitor_msg,
            visitor_transport,
            ready: ReadySignal::new(),
            created_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                client_msg: None,
                client_transport: None,
                decision: None,
            }),
        }
    }

    /// Time since the visitor's request created the session
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Move to a new lifecycle state
    pub async fn set_state(&self, state: SessionState) {
        self.inner.lock().await.state = state;
    }

    /// Record the client's answer and fire the ready signal.
    /// Returns `false` if the client already answered.
    pub async fn attach_client(&self, msg: NatHoleClient, transport: MessageSink) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.client_msg.is_some() {
            return false;
        }
        inner.client_msg = Some(msg);
        inner.client_transport = Some(transport);
        drop(inner);
        self.ready.fire()
    }
}
