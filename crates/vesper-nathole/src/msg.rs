//! Rendezvous control-channel messages and framing.
//!
//! Every frame is a one-byte type tag, a 4-byte big-endian body length and a
//! JSON body:
//!
//! ```text
//! +-----+----------------+------------------+
//! | tag | length (u32 BE)| JSON body        |
//! +-----+----------------+------------------+
//! ```

use crate::analysis::DetectRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Largest accepted frame body (1 MiB)
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const TAG_VISITOR: u8 = b'i';
const TAG_CLIENT: u8 = b'n';
const TAG_RESP: u8 = b'm';
const TAG_SID: u8 = b'5';
const TAG_REPORT: u8 = b'6';
const TAG_LISTEN: u8 = b'l';

/// Outbound half of a peer's control connection
pub type MessageSink = mpsc::Sender<Message>;

/// Visitor asks to punch a hole to a listening proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleVisitor {
    /// Correlates the response with this request
    pub transaction_id: String,
    /// Target proxy
    pub proxy_name: String,
    /// Only check that the proxy exists and allows this visitor
    pub pre_check: bool,
    /// Post-punch protocol, echoed to both sides
    pub protocol: String,
    /// Keyed hash of the proxy secret and `timestamp`
    pub sign_key: String,
    /// Unix seconds the sign key was made for
    pub timestamp: i64,
    /// External addresses observed through STUN
    pub mapped_addrs: Vec<String>,
    /// Local addresses
    pub assisted_addrs: Vec<String>,
}

/// Client answers a session id with its own observed addresses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleClient {
    /// Correlates with the `NatHoleSid` being answered
    pub transaction_id: String,
    /// Proxy the client serves
    pub proxy_name: String,
    /// Session id received in `NatHoleSid`
    pub sid: String,
    /// External addresses observed through STUN
    pub mapped_addrs: Vec<String>,
    /// Local addresses
    pub assisted_addrs: Vec<String>,
}

/// Inclusive port window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsRange {
    /// First port
    pub from: u16,
    /// Last port
    pub to: u16,
}

/// Punch instructions for one side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleDetectBehavior {
    /// Sender or receiver
    pub role: DetectRole,
    /// Strategy family
    pub mode: u8,
    /// Probe TTL (0 = system default)
    pub ttl: u8,
    /// Delay before sending
    pub send_delay_ms: u64,
    /// How long to wait for the peer
    pub read_timeout_ms: u64,
    /// Peer ports to scan
    pub candidate_ports: Vec<PortsRange>,
    /// Random peer ports to burst
    pub send_random_ports: u16,
    /// Random local ports to listen on
    pub listen_random_ports: u16,
}

/// Server instructs one side how to punch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleResp {
    /// Echo of the request's transaction id
    pub transaction_id: String,
    /// Session id
    pub sid: String,
    /// Protocol from the visitor request
    pub protocol: String,
    /// The other side's external addresses
    pub candidate_addrs: Vec<String>,
    /// The other side's local addresses
    pub assisted_addrs: Vec<String>,
    /// This side's instructions
    pub detect_behavior: NatHoleDetectBehavior,
    /// Set when the rendezvous failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server tells a listening client that a visitor is waiting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleSid {
    /// Visitor's transaction id
    pub transaction_id: String,
    /// Session id to answer with
    pub sid: String,
    /// Protocol requested by the visitor
    pub protocol: String,
    /// Random nonce
    pub nonce: String,
}

/// Outcome of a punch attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleReport {
    /// Session id
    pub sid: String,
    /// Whether a direct path came up
    pub success: bool,
}

/// Client connection announces it listens for sessions on a proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleListen {
    /// Proxy name, must match a configured client
    pub proxy_name: String,
}

/// Control-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `i`
    Visitor(NatHoleVisitor),
    /// `n`
    Client(NatHoleClient),
    /// `m`
    Resp(NatHoleResp),
    /// `5`
    Sid(NatHoleSid),
    /// `6`
    Report(NatHoleReport),
    /// `l`
    Listen(NatHoleListen),
}

impl Message {
    /// Wire type tag
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Visitor(_) => TAG_VISITOR,
            Self::Client(_) => TAG_CLIENT,
            Self::Resp(_) => TAG_RESP,
            Self::Sid(_) => TAG_SID,
            Self::Report(_) => TAG_REPORT,
            Self::Listen(_) => TAG_LISTEN,
        }
    }

    /// Get message type name for logging
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Visitor(_) => "NatHoleVisitor",
            Self::Client(_) => "NatHoleClient",
            Self::Resp(_) => "NatHoleResp",
            Self::Sid(_) => "NatHoleSid",
            Self::Report(_) => "NatHoleReport",
            Self::Listen(_) => "NatHoleListen",
        }
    }

    fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Visitor(m) => serde_json::to_vec(m),
            Self::Client(m) => serde_json::to_vec(m),
            Self::Resp(m) => serde_json::to_vec(m),
            Self::Sid(m) => serde_json::to_vec(m),
            Self::Report(m) => serde_json::to_vec(m),
            Self::Listen(m) => serde_json::to_vec(m),
        }
    }

    /// Encode as a complete frame
    ///
    /// # Errors
    ///
    /// Fails if the body cannot be serialized or exceeds [`MAX_BODY_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let body = self.body()?;
        if body.len() > MAX_BODY_SIZE {
            return Err(CodecError::TooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(5 + body.len());
        frame.push(self.type_tag());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame body for a given tag
    ///
    /// # Errors
    ///
    /// Fails on an unknown tag or a body that is not valid JSON for it.
    pub fn from_parts(tag: u8, body: &[u8]) -> Result<Self, CodecError> {
        Ok(match tag {
            TAG_VISITOR => Self::Visitor(serde_json::from_slice(body)?),
            TAG_CLIENT => Self::Client(serde_json::from_slice(body)?),
            TAG_RESP => Self::Resp(serde_json::from_slice(body)?),
            TAG_SID => Self::Sid(serde_json::from_slice(body)?),
            TAG_REPORT => Self::Report(serde_json::from_slice(body)?),
            TAG_LISTEN => Self::Listen(serde_json::from_slice(body)?),
            other => return Err(CodecError::UnknownType(other)),
        })
    }

    /// Decode a complete frame
    ///
    /// # Errors
    ///
    /// Fails on a truncated frame, an oversized or mismatched length, or a bad body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 5 {
            return Err(CodecError::Truncated);
        }
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        if len > MAX_BODY_SIZE {
            return Err(CodecError::TooLarge(len));
        }
        let body = bytes.get(5..5 + len).ok_or(CodecError::Truncated)?;
        Self::from_parts(bytes[0], body)
    }
}

/// Read one frame
///
/// # Errors
///
/// Returns [`CodecError::Io`] on read failure (including EOF) and the
/// decoding errors of [`Message::from_parts`].
pub async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, CodecError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_BODY_SIZE {
        return Err(CodecError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Message::from_parts(header[0], &body)
}

/// Write one frame and flush
///
/// # Errors
///
/// Returns encoding errors or [`CodecError::Io`] on write failure.
pub async fn write_msg<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), CodecError> {
    let frame = msg.to_bytes()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Framing errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Body is not valid JSON for its tag
    #[error("invalid message body: {0}")]
    Json(#[from] serde_json::Error),
    /// Unknown type tag
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    /// Body length above [`MAX_BODY_SIZE`]
    #[error("message body of {0} bytes exceeds limit")]
    TooLarge(usize),
    /// Frame shorter than its header or declared length
    #[error("truncated frame")]
    Truncated,
}

impl CodecError {
    /// Peer closed the connection between frames
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
