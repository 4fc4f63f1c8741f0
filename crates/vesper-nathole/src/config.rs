//! Tunables for the controller and STUN discovery.

use crate::stun::StunCredentials;
use std::time::Duration;

/// Rendezvous controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long a visitor waits for the client to answer its sid
    pub visitor_wait_timeout: Duration,
    /// Extra delay applied to the sender-role side's response
    pub sender_send_delay: Duration,
    /// Session lingers for `read_timeout + session_linger_extra` after responses go out
    pub session_linger_extra: Duration,
    /// Reject sign keys older than this; `None` accepts any timestamp
    pub max_sign_key_age: Option<Duration>,
    /// Run `Analyzer::sweep` this often; `None` disables sweeping
    pub analyzer_sweep_interval: Option<Duration>,
    /// Idle age after which a sweep drops a pairing's scores
    pub analyzer_max_idle: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            visitor_wait_timeout: Duration::from_secs(10),
            sender_send_delay: Duration::from_secs(1),
            session_linger_extra: Duration::from_secs(30),
            max_sign_key_age: None,
            analyzer_sweep_interval: None,
            analyzer_max_idle: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// STUN discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Per-request response timeout
    pub request_timeout: Duration,
    /// Capacity of the receive loop's queue
    pub queue_capacity: usize,
    /// SOFTWARE attribute sent with each request
    pub software: Option<String>,
    /// Sign requests with MESSAGE-INTEGRITY and verify signed responses
    pub credentials: Option<StunCredentials>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            queue_capacity: 16,
            software: Some(concat!("vesper ", env!("CARGO_PKG_VERSION")).to_string()),
            credentials: None,
        }
    }
}
