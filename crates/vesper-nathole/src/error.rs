//! Error types for the rendezvous subsystem
//!
//! Errors fall into three groups that the controller treats differently:
//!
//! - **Registration**: the visitor request cannot be matched to a listening
//!   client. The visitor gets an error response; no session is created.
//! - **Classification**: observed addresses are unusable. Both sides of the
//!   session get the same error response.
//! - **Transport**: an outbound send failed. Logged and swallowed by the
//!   controller, surfaced only to direct callers of the transport.

use crate::classify::ClassifyError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced by the rendezvous controller
#[derive(Debug, Error)]
pub enum NatHoleError {
    // ============ Registration Errors ============
    /// A client with this proxy name is already listening
    #[error("proxy [{0}] is already registered")]
    ClientAlreadyRegistered(String),

    /// No client is listening under this proxy name
    #[error("proxy [{0}] is not listening")]
    ClientNotFound(String),

    /// The visitor user is not in the client's allow list
    #[error("visitor user [{user}] not allowed for [{proxy}]")]
    VisitorNotAllowed {
        /// Proxy name
        proxy: String,
        /// Rejected visitor user
        user: String,
    },

    /// The visitor's sign key does not match the client's secret
    #[error("invalid sign key for [{0}]")]
    InvalidSignKey(String),

    /// The visitor's timestamp is older than the configured maximum age
    #[error("sign key for [{0}] has expired")]
    SignKeyExpired(String),

    // ============ Classification Errors ============
    /// Observed addresses could not be classified
    #[error("classify error: {0}")]
    Classify(#[from] ClassifyError),

    // ============ Transport Errors ============
    /// Outbound transport is closed
    #[error("transport closed: {0}")]
    TransportClosed(Cow<'static, str>),
}

impl NatHoleError {
    /// Whether this error rejects a visitor before any session is created
    #[must_use]
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            Self::ClientAlreadyRegistered(_)
                | Self::ClientNotFound(_)
                | Self::VisitorNotAllowed { .. }
                | Self::InvalidSignKey(_)
                | Self::SignKeyExpired(_)
        )
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, NatHoleError>;
