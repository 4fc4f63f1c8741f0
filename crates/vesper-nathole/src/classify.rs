//! NAT Classification
//!
//! Turns the external addresses a peer observed through STUN into the coarse
//! features the strategy analyzer keys on. Everything here is pure: no I/O,
//! no clocks, no randomness.
//!
//! A NAT is **Easy** when every STUN server saw the same external address, and
//! **Hard** when the mapping changed between destinations (IP, port, or both).
//! For Hard NATs the step between consecutive mapped ports tells us whether the
//! next allocation can be predicted.

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Largest port step still treated as a predictable allocation
pub const MAX_REGULAR_PORT_STEP: i32 = 5;

/// NAT mapping category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    /// Same external mapping for every destination
    Easy,
    /// External mapping depends on the destination
    Hard,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Easy => write!(f, "EasyNAT"),
            Self::Hard => write!(f, "HardNAT"),
        }
    }
}

/// Which part of the mapping changed between destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatBehavior {
    /// Nothing changed
    NoChange,
    /// External IP changed, port stayed
    IpChanged,
    /// External port changed, IP stayed
    PortChanged,
    /// Both changed
    BothChanged,
}

impl fmt::Display for NatBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChange => write!(f, "NoChange"),
            Self::IpChanged => write!(f, "IPChanged"),
            Self::PortChanged => write!(f, "PortChanged"),
            Self::BothChanged => write!(f, "BothChanged"),
        }
    }
}

/// Features of one peer's NAT, computed once per rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NatFeature {
    /// Easy or Hard
    pub nat_type: NatType,
    /// What changed between destinations
    pub behavior: NatBehavior,
    /// Consecutive mapped ports move by a small constant step
    pub regular_ports_change: bool,
    /// Step between consecutive mapped ports (0 with a single sample)
    pub ports_difference: i32,
    /// An observed external IP is one of the peer's own local addresses
    pub public_network: bool,
}

impl NatFeature {
    /// Hard NAT whose port allocation is predictable
    #[must_use]
    pub fn is_hard_regular(&self) -> bool {
        self.nat_type == NatType::Hard && self.regular_ports_change
    }
}

/// Classification errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    /// No observed addresses
    #[error("no observed addresses")]
    Empty,
    /// Address string did not parse
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

fn parse_addrs(addrs: &[String]) -> Result<Vec<SocketAddr>, ClassifyError> {
    if addrs.is_empty() {
        return Err(ClassifyError::Empty);
    }
    addrs
        .iter()
        .map(|a| {
            a.parse::<SocketAddr>()
                .map_err(|_| ClassifyError::InvalidAddress(a.clone()))
        })
        .collect()
}

fn nat_type_of(addrs: &[SocketAddr]) -> (NatType, NatBehavior) {
    let first = addrs[0];
    let ip_changed = addrs.iter().any(|a| a.ip() != first.ip());
    let port_changed = addrs.iter().any(|a| a.port() != first.port());

    match (ip_changed, port_changed) {
        (false, false) => (NatType::Easy, NatBehavior::NoChange),
        (true, false) => (NatType::Hard, NatBehavior::IpChanged),
        (false, true) => (NatType::Hard, NatBehavior::PortChanged),
        (true, true) => (NatType::Hard, NatBehavior::BothChanged),
    }
}

/// Classify a peer's observed `ip:port` mappings
///
/// # Errors
///
/// Returns an error on an empty list or an unparsable address.
pub fn classify_nat_type(addrs: &[String]) -> Result<(NatType, NatBehavior), ClassifyError> {
    let parsed = parse_addrs(addrs)?;
    Ok(nat_type_of(&parsed))
}

/// Full classification including port regularity and public reachability
///
/// `assisted_addrs` are the peer's local addresses, either `ip` or `ip:port`.
///
/// # Errors
///
/// Returns an error on an empty mapped list or any unparsable address.
pub fn classify_nat_feature(
    mapped_addrs: &[String],
    assisted_addrs: &[String],
) -> Result<NatFeature, ClassifyError> {
    let mapped = parse_addrs(mapped_addrs)?;
    let (nat_type, behavior) = nat_type_of(&mapped);

    let deltas: Vec<i32> = mapped
        .windows(2)
        .map(|w| i32::from(w[1].port()) - i32::from(w[0].port()))
        .collect();
    let ports_difference = deltas.last().copied().unwrap_or(0);
    let regular_ports_change = !deltas.is_empty()
        && deltas.iter().all(|d| *d == ports_difference)
        && ports_difference != 0
        && ports_difference.abs() <= MAX_REGULAR_PORT_STEP;

    let mut local_ips = Vec::with_capacity(assisted_addrs.len());
    for addr in assisted_addrs {
        let ip = addr
            .parse::<SocketAddr>()
            .map(|s| s.ip())
            .or_else(|_| addr.parse::<IpAddr>())
            .map_err(|_| ClassifyError::InvalidAddress(addr.clone()))?;
        local_ips.push(ip);
    }
    let public_network = mapped.iter().any(|m| local_ips.contains(&m.ip()));

    Ok(NatFeature {
        nat_type,
        behavior,
        regular_ports_change,
        ports_difference,
        public_network,
    })
}
