//! STUN Protocol Codec (RFC 5389 / RFC 5780)
//!
//! Binding Request/Response encoding and decoding for server reflexive address
//! discovery. The reader understands both the classic (RFC 3489) and the
//! current attribute set so it can talk to old and new servers alike:
//!
//! - XOR-MAPPED-ADDRESS (preferred) and MAPPED-ADDRESS (fallback)
//! - OTHER-ADDRESS and CHANGED-ADDRESS, used to take a second mapping sample
//!   from a different server address
//!
//! MESSAGE-INTEGRITY (HMAC-SHA1) and FINGERPRINT (CRC-32) are supported for
//! servers that require short- or long-term credentials.
//!
//! # Legacy digests
//!
//! MD5 and SHA1 are used here only because RFC 5389 Section 15.4 mandates them
//! for MESSAGE-INTEGRITY and long-term credential key derivation. Do not use
//! them for anything else; the rendezvous sign key uses BLAKE3 (see `auth`).

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use zeroize::Zeroizing;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// XOR constant applied to the FINGERPRINT CRC
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

type HmacSha1 = Hmac<Sha1>;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Encode message type and class into a 16-bit value
    ///
    /// RFC 5389 Section 6 encoding:
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    fn encode(self, class: StunMessageClass) -> u16 {
        let method: u16 = match self {
            Self::Binding => 0x0001,
        };

        let class_bits: u16 = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        let m0_m3 = method & 0x0F;
        let c0 = (class_bits & 0x01) << 4;
        let m4_m6 = (method & 0x70) << 1;
        let c1 = (class_bits & 0x02) << 7;
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }

    fn decode(msg_type: u16) -> Result<(Self, StunMessageClass), StunError> {
        let c0 = (msg_type >> 4) & 0x01;
        let c1 = (msg_type >> 8) & 0x01;
        let message_class = match c0 | (c1 << 1) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let method = (msg_type & 0x0F) | ((msg_type >> 1) & 0x70) | ((msg_type >> 2) & 0xF80);
        match method {
            0x0001 => Ok((Self::Binding, message_class)),
            _ => Err(StunError::InvalidMessageType),
        }
    }
}

/// STUN credentials for MESSAGE-INTEGRITY
///
/// The password is zeroized on drop and never printed.
#[derive(Clone)]
pub struct StunCredentials {
    /// Username
    pub username: String,
    password: Zeroizing<String>,
    /// Realm for long-term credentials
    pub realm: Option<String>,
}

impl StunCredentials {
    /// Create credentials; a realm selects long-term key derivation.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            realm,
        }
    }

    /// Long-term: MD5(username:realm:password). Short-term: the password.
    fn derive_key(&self) -> Zeroizing<Vec<u8>> {
        match &self.realm {
            Some(realm) => {
                use md5::Digest;
                let mut hasher = Md5::new();
                hasher.update(self.username.as_bytes());
                hasher.update(b":");
                hasher.update(realm.as_bytes());
                hasher.update(b":");
                hasher.update(self.password.as_bytes());
                Zeroizing::new(hasher.finalize().to_vec())
            }
            None => Zeroizing::new(self.password.as_bytes().to_vec()),
        }
    }
}

impl fmt::Debug for StunCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StunCredentials")
            .field("username", &self.username)
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

/// STUN attributes understood by the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001)
    MappedAddress(SocketAddr),
    /// CHANGED-ADDRESS (0x0005), RFC 3489
    ChangedAddress(SocketAddr),
    /// USERNAME (0x0006)
    Username(String),
    /// MESSAGE-INTEGRITY (0x0008), HMAC-SHA1
    MessageIntegrity([u8; 20]),
    /// XOR-MAPPED-ADDRESS (0x0020)
    XorMappedAddress(SocketAddr),
    /// SOFTWARE (0x8022)
    Software(String),
    /// FINGERPRINT (0x8028), CRC-32
    Fingerprint(u32),
    /// OTHER-ADDRESS (0x802C), RFC 5780
    OtherAddress(SocketAddr),
    /// Anything else, kept verbatim
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::ChangedAddress(_) => ATTR_CHANGED_ADDRESS,
            Self::Username(_) => ATTR_USERNAME,
            Self::MessageIntegrity(_) => ATTR_MESSAGE_INTEGRITY,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::Fingerprint(_) => ATTR_FINGERPRINT,
            Self::OtherAddress(_) => ATTR_OTHER_ADDRESS,
            Self::Unknown(t, _) => *t,
        }
    }

    /// Encode as type (2) + length (2) + value + padding to 4 bytes
    fn encode(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        let value = self.encode_value(transaction_id);
        let mut bytes = Vec::with_capacity(4 + value.len() + 3);
        bytes.extend_from_slice(&self.attr_type().to_be_bytes());
        bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&value);
        let padding = (4 - (value.len() % 4)) % 4;
        bytes.extend(std::iter::repeat_n(0, padding));
        bytes
    }

    fn encode_value(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr) | Self::ChangedAddress(addr) | Self::OtherAddress(addr) => {
                encode_plain_address(*addr)
            }
            Self::XorMappedAddress(addr) => {
                let xored = xor_address(*addr, transaction_id);
                encode_plain_address(xored)
            }
            Self::Username(u) => u.as_bytes().to_vec(),
            Self::MessageIntegrity(hmac) => hmac.to_vec(),
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Fingerprint(f) => f.to_be_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    fn decode(attr_type: u16, value: &[u8], transaction_id: &[u8; 12]) -> Result<Self, StunError> {
        match attr_type {
            ATTR_MAPPED_ADDRESS => Ok(Self::MappedAddress(decode_plain_address(value)?)),
            ATTR_CHANGED_ADDRESS => Ok(Self::ChangedAddress(decode_plain_address(value)?)),
            ATTR_OTHER_ADDRESS => Ok(Self::OtherAddress(decode_plain_address(value)?)),
            ATTR_XOR_MAPPED_ADDRESS => {
                let xored = decode_plain_address(value)?;
                Ok(Self::XorMappedAddress(xor_address(xored, transaction_id)))
            }
            ATTR_USERNAME => Ok(Self::Username(String::from_utf8_lossy(value).into_owned())),
            ATTR_SOFTWARE => Ok(Self::Software(String::from_utf8_lossy(value).into_owned())),
            ATTR_MESSAGE_INTEGRITY => {
                let hmac: [u8; 20] = value.try_into().map_err(|_| StunError::InvalidAttribute)?;
                Ok(Self::MessageIntegrity(hmac))
            }
            ATTR_FINGERPRINT => {
                let raw: [u8; 4] = value.try_into().map_err(|_| StunError::InvalidAttribute)?;
                Ok(Self::Fingerprint(u32::from_be_bytes(raw)))
            }
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

/// Reserved (1) + family (1) + port (2) + address (4 or 16)
fn encode_plain_address(addr: SocketAddr) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }
    value
}

fn decode_plain_address(value: &[u8]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        FAMILY_IPV4 => {
            let octets: [u8; 4] = value
                .get(4..8)
                .and_then(|s| s.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            Ok(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        FAMILY_IPV6 => {
            let octets: [u8; 16] = value
                .get(4..20)
                .and_then(|s| s.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            Ok(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        _ => Err(StunError::InvalidAttribute),
    }
}

/// XOR an address with the magic cookie (and transaction ID for IPv6).
/// The operation is its own inverse.
fn xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let magic = MAGIC_COOKIE.to_be_bytes();
    let ip: IpAddr = match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (b, m) in octets.iter_mut().zip(magic) {
                *b ^= m;
            }
            Ipv4Addr::from(octets).into()
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            let key = magic.iter().chain(transaction_id.iter());
            for (b, k) in octets.iter_mut().zip(key) {
                *b ^= k;
            }
            Ipv6Addr::from(octets).into()
        }
    };
    SocketAddr::new(ip, port)
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message type
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new Binding Request with a fresh random transaction ID
    #[must_use]
    pub fn binding_request() -> Self {
        use rand::RngCore;
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a Binding Success Response answering `transaction_id`
    #[must_use]
    pub fn binding_response(transaction_id: [u8; 12]) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode the header plus the given attributes, with the length field
    /// covering `extra_len` more bytes that the caller will append.
    fn encode_prefix(&self, attributes: &[StunAttribute], extra_len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 64);
        bytes.extend_from_slice(&self.message_type.encode(self.message_class).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);
        for attr in attributes {
            bytes.extend_from_slice(&attr.encode(&self.transaction_id));
        }
        let msg_length = (bytes.len() - HEADER_SIZE + extra_len) as u16;
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());
        bytes
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.encode_prefix(&self.attributes, 0)
    }

    /// Decode message from bytes
    ///
    /// # Errors
    ///
    /// Fails on short input, a wrong magic cookie, an unknown method, or a
    /// malformed attribute the reader depends on.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }
        if HEADER_SIZE + msg_length > bytes.len() {
            return Err(StunError::MessageTooShort);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let (message_type, message_class) = StunMessageType::decode(msg_type)?;

        let end = HEADER_SIZE + msg_length;
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_length > end {
                return Err(StunError::InvalidAttribute);
            }

            let value = &bytes[offset..offset + attr_length];
            attributes.push(StunAttribute::decode(attr_type, value, &transaction_id)?);

            offset += attr_length + (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// The reflexive address: XOR-MAPPED-ADDRESS, else MAPPED-ADDRESS
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let xor = self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        });
        xor.or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// The server's alternate address: OTHER-ADDRESS, else CHANGED-ADDRESS
    #[must_use]
    pub fn other_address(&self) -> Option<SocketAddr> {
        let other = self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::OtherAddress(addr) => Some(*addr),
            _ => None,
        });
        other.or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                StunAttribute::ChangedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// Whether the message ends with a FINGERPRINT attribute
    #[must_use]
    pub fn has_fingerprint(&self) -> bool {
        matches!(self.attributes.last(), Some(StunAttribute::Fingerprint(_)))
    }

    /// Whether the message carries MESSAGE-INTEGRITY
    #[must_use]
    pub fn has_message_integrity(&self) -> bool {
        self.attributes
            .iter()
            .any(|attr| matches!(attr, StunAttribute::MessageIntegrity(_)))
    }

    /// Append MESSAGE-INTEGRITY computed over everything before it
    pub fn add_message_integrity(&mut self, credentials: &StunCredentials) {
        self.attributes.retain(|attr| {
            !matches!(
                attr,
                StunAttribute::MessageIntegrity(_) | StunAttribute::Fingerprint(_)
            )
        });
        let hmac = self.integrity_over(&self.attributes, credentials);
        self.attributes.push(StunAttribute::MessageIntegrity(hmac));
    }

    /// Verify the MESSAGE-INTEGRITY attribute
    ///
    /// # Errors
    ///
    /// `MissingAttribute` if absent, `AuthenticationFailed` on mismatch.
    pub fn verify_message_integrity(&self, credentials: &StunCredentials) -> Result<(), StunError> {
        let (index, expected) = self
            .attributes
            .iter()
            .enumerate()
            .find_map(|(i, attr)| match attr {
                StunAttribute::MessageIntegrity(hmac) => Some((i, *hmac)),
                _ => None,
            })
            .ok_or(StunError::MissingAttribute)?;

        let computed = self.integrity_over(&self.attributes[..index], credentials);
        if bool::from(subtle::ConstantTimeEq::ct_eq(&computed[..], &expected[..])) {
            Ok(())
        } else {
            Err(StunError::AuthenticationFailed)
        }
    }

    fn integrity_over(&self, attributes: &[StunAttribute], credentials: &StunCredentials) -> [u8; 20] {
        // Length covers the MESSAGE-INTEGRITY attribute itself (4 + 20)
        let bytes = self.encode_prefix(attributes, 24);
        let key = credentials.derive_key();
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&key).unwrap_or_else(|_| unreachable!());
        mac.update(&bytes);
        mac.finalize().into_bytes().into()
    }

    /// Append FINGERPRINT; must come after MESSAGE-INTEGRITY
    pub fn add_fingerprint(&mut self) {
        self.attributes
            .retain(|attr| !matches!(attr, StunAttribute::Fingerprint(_)));
        let bytes = self.encode_prefix(&self.attributes, 8);
        self.attributes
            .push(StunAttribute::Fingerprint(crc32(&bytes) ^ FINGERPRINT_XOR));
    }

    /// Verify the trailing FINGERPRINT attribute
    ///
    /// # Errors
    ///
    /// `MissingAttribute` if absent, `FingerprintMismatch` on mismatch.
    pub fn verify_fingerprint(&self) -> Result<(), StunError> {
        let Some(StunAttribute::Fingerprint(fingerprint)) = self.attributes.last() else {
            return Err(StunError::MissingAttribute);
        };
        let covered = &self.attributes[..self.attributes.len() - 1];
        let bytes = self.encode_prefix(covered, 8);
        if crc32(&bytes) ^ FINGERPRINT_XOR == *fingerprint {
            Ok(())
        } else {
            Err(StunError::FingerprintMismatch)
        }
    }
}

/// CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320)
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// STUN error types
#[derive(Debug, Error)]
pub enum StunError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Query timeout
    #[error("STUN query to {0} timed out")]
    Timeout(SocketAddr),
    /// Server name did not resolve
    #[error("Failed to resolve STUN server {0}")]
    Resolve(String),
    /// No servers configured
    #[error("No STUN servers configured")]
    NoServers,
    /// Message shorter than its header or declared length
    #[error("STUN message too short")]
    MessageTooShort,
    /// Invalid magic cookie
    #[error("Invalid STUN magic cookie")]
    InvalidMagicCookie,
    /// Invalid message type
    #[error("Invalid STUN message type")]
    InvalidMessageType,
    /// Invalid attribute
    #[error("Invalid STUN attribute")]
    InvalidAttribute,
    /// Error response received
    #[error("STUN error response from {0}")]
    ErrorResponse(SocketAddr),
    /// Missing required attribute
    #[error("Missing required STUN attribute")]
    MissingAttribute,
    /// MESSAGE-INTEGRITY mismatch
    #[error("MESSAGE-INTEGRITY authentication failed")]
    AuthenticationFailed,
    /// FINGERPRINT mismatch
    #[error("FINGERPRINT verification failed")]
    FingerprintMismatch,
    /// The receive loop ended before a response arrived
    #[error("STUN receive loop closed")]
    Closed,
}
