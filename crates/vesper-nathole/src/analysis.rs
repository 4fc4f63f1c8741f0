//! Hole-Punching Strategy Analyzer
//!
//! Keeps a static catalogue of punch strategies grouped into five modes and,
//! per NAT-pairing class, an empirical score for each strategy. `recommend`
//! hands out the best-scoring strategy for a pair; `report` feeds the outcome
//! back so repeated pairings converge on what actually works.
//!
//! # Modes
//!
//! | Mode | Pairing | Idea |
//! |------|---------|------|
//! | 0 | both Easy | simultaneous open, optional sender delay |
//! | 1 | Hard regular + Easy | predictable offset, scan up to 200 ports |
//! | 2 | Hard irregular + Easy | random burst against a wide listener |
//! | 3 | both Hard regular | both scan a 10-port window |
//! | 4 | Hard regular + Hard irregular | burst-send plus windowed listen |
//!
//! Ties between equal scores go to the entry seeded first.

use crate::classify::{NatFeature, NatType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound for a strategy score
pub const MAX_SCORE: i32 = 10;

/// Probe TTL used by receivers that must not reach the peer's NAT
const PROBE_TTL: u8 = 7;

/// Role a peer plays during the punch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectRole {
    /// Sends first, towards the peer's candidate ports
    #[default]
    Sender,
    /// Opens its NAT with low-TTL probes and waits
    Receiver,
}

/// One side of a catalogued strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecommendedBehavior {
    /// Role of this side
    pub role: DetectRole,
    /// TTL for outgoing probes (0 = system default)
    pub ttl: u8,
    /// Delay before this side starts sending
    pub send_delay_ms: u64,
    /// Width of the port window scanned around the peer's predicted port
    pub ports_range_number: u16,
    /// Number of random destination ports to burst
    pub ports_random_number: u16,
    /// Number of random local ports to listen on
    pub listen_random_ports: u16,
}

impl RecommendedBehavior {
    const fn sender() -> Self {
        Self {
            role: DetectRole::Sender,
            ttl: 0,
            send_delay_ms: 0,
            ports_range_number: 0,
            ports_random_number: 0,
            listen_random_ports: 0,
        }
    }

    const fn receiver() -> Self {
        Self {
            role: DetectRole::Receiver,
            ..Self::sender()
        }
    }

    const fn ttl(self, ttl: u8) -> Self {
        Self { ttl, ..self }
    }

    const fn delay(self, send_delay_ms: u64) -> Self {
        Self {
            send_delay_ms,
            ..self
        }
    }

    const fn range(self, ports_range_number: u16) -> Self {
        Self {
            ports_range_number,
            ..self
        }
    }

    const fn random(self, ports_random_number: u16) -> Self {
        Self {
            ports_random_number,
            ..self
        }
    }

    const fn listen(self, listen_random_ports: u16) -> Self {
        Self {
            listen_random_ports,
            ..self
        }
    }
}

/// `(first, second)` behaviors of one catalogued strategy
pub type BehaviorPair = (RecommendedBehavior, RecommendedBehavior);

const S: RecommendedBehavior = RecommendedBehavior::sender();
const R: RecommendedBehavior = RecommendedBehavior::receiver();

const MODE0: [BehaviorPair; 6] = [
    (S, R),
    (R, S),
    (S, R.ttl(PROBE_TTL)),
    (R.ttl(PROBE_TTL), S),
    (S.delay(1000), R),
    (R, S.delay(1000)),
];

const MODE1: [BehaviorPair; 5] = [
    (S, R.range(10)),
    (S, R.range(10).ttl(PROBE_TTL)),
    (S, R.range(200)),
    (R.ttl(PROBE_TTL), S.range(10)),
    (R.ttl(PROBE_TTL), S.range(200)),
];

const MODE2: [BehaviorPair; 4] = [
    (S.random(1000), R.listen(256)),
    (S.random(1000), R.listen(256).ttl(PROBE_TTL)),
    (R.listen(256).ttl(PROBE_TTL), S.random(1000)),
    (S.random(1000).delay(500), R.listen(128)),
];

const MODE3: [BehaviorPair; 3] = [
    (S.range(10), R.range(10).ttl(PROBE_TTL)),
    (S.range(10), R.range(10)),
    (S.range(10).delay(500), R.range(10).ttl(PROBE_TTL)),
];

const MODE4: [BehaviorPair; 3] = [
    (S.range(10).random(1000), R.listen(256).range(10).ttl(PROBE_TTL)),
    (S.range(10).random(1000), R.listen(256).range(10)),
    (S.range(10).random(1000).delay(500), R.listen(256).range(10).ttl(PROBE_TTL)),
];

/// Strategy family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DetectMode {
    /// Both Easy
    Mode0,
    /// Hard regular + Easy
    Mode1,
    /// Hard irregular + Easy
    Mode2,
    /// Both Hard regular
    Mode3,
    /// Mixed regular/irregular Hard
    Mode4,
}

impl DetectMode {
    /// Numeric mode carried on the wire
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Catalogued behavior pairs for this mode
    #[must_use]
    pub fn behaviors(self) -> &'static [BehaviorPair] {
        match self {
            Self::Mode0 => &MODE0,
            Self::Mode1 => &MODE1,
            Self::Mode2 => &MODE2,
            Self::Mode3 => &MODE3,
            Self::Mode4 => &MODE4,
        }
    }
}

impl fmt::Display for DetectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode{}", self.as_u8())
    }
}

/// Coarse NAT class of one side, the part of a feature the analyzer keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatClass {
    nat_type: NatType,
    behavior: crate::classify::NatBehavior,
    regular: bool,
    public: bool,
}

impl From<&NatFeature> for NatClass {
    fn from(f: &NatFeature) -> Self {
        Self {
            nat_type: f.nat_type,
            behavior: f.behavior,
            regular: f.regular_ports_change,
            public: f.public_network,
        }
    }
}

impl fmt::Display for NatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.nat_type, self.behavior, self.regular, self.public
        )
    }
}

/// Analyzer key: (client class, visitor class)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    client: NatClass,
    visitor: NatClass,
}

impl AnalysisKey {
    /// Key for a client/visitor pairing
    #[must_use]
    pub fn new(client: &NatFeature, visitor: &NatFeature) -> Self {
        Self {
            client: client.into(),
            visitor: visitor.into(),
        }
    }
}

impl fmt::Display for AnalysisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.client, self.visitor)
    }
}

/// Empirical score of one catalogued strategy
#[derive(Debug, Clone, Copy)]
pub struct BehaviorScore {
    /// Strategy family
    pub mode: DetectMode,
    /// Index into the mode's catalogue
    pub index: usize,
    /// Current score, capped at [`MAX_SCORE`], unbounded below
    pub score: i32,
    /// Last time `score` changed
    pub last_update: Instant,
}

impl BehaviorScore {
    fn new(mode: DetectMode, index: usize, score: i32) -> Self {
        Self {
            mode,
            index,
            score,
            last_update: Instant::now(),
        }
    }

    /// Apply one outcome. Failures have no floor.
    pub fn record(&mut self, success: bool) {
        self.score = if success {
            (self.score + 1).min(MAX_SCORE)
        } else {
            self.score.saturating_sub(1)
        };
        self.last_update = Instant::now();
    }
}

/// Modes worth trying for a pairing, most promising first
fn seed_modes(client: &NatFeature, visitor: &NatFeature) -> &'static [DetectMode] {
    use DetectMode::{Mode0, Mode1, Mode2, Mode3, Mode4};

    let pair = [client, visitor];
    let easy = pair.iter().filter(|f| f.nat_type == NatType::Easy).count();
    let hard_regular = pair.iter().filter(|f| f.is_hard_regular()).count();

    match (easy, hard_regular) {
        (2, _) => &[Mode0],
        (1, 1) => &[Mode1, Mode2, Mode0],
        (1, _) => &[Mode2, Mode1, Mode0],
        (_, 2) => &[Mode3, Mode4],
        (_, 1) => &[Mode4],
        _ => &[Mode0, Mode1, Mode3, Mode4],
    }
}

/// Score table for one pairing class
#[derive(Debug)]
pub struct MakeHoleRecords {
    scores: Vec<BehaviorScore>,
    last_access: Instant,
}

impl MakeHoleRecords {
    /// Seed a score table for a client/visitor pairing
    #[must_use]
    pub fn new(client: &NatFeature, visitor: &NatFeature) -> Self {
        let mut scores = Vec::new();
        for &mode in seed_modes(client, visitor) {
            for (index, (first, second)) in mode.behaviors().iter().enumerate() {
                let mut score = 0;
                // Client takes the first behavior in mode 0
                if mode == DetectMode::Mode0 {
                    if visitor.public_network
                        && !client.public_network
                        && first.role == DetectRole::Receiver
                    {
                        score += 1;
                    }
                    if client.public_network
                        && !visitor.public_network
                        && second.role == DetectRole::Receiver
                    {
                        score += 1;
                    }
                }
                scores.push(BehaviorScore::new(mode, index, score));
            }
        }
        Self {
            scores,
            last_access: Instant::now(),
        }
    }

    /// Best entry; first maximum in seeding order
    fn best(&self) -> Option<&BehaviorScore> {
        self.scores
            .iter()
            .fold(None, |best: Option<&BehaviorScore>, s| match best {
                Some(b) if b.score >= s.score => Some(b),
                _ => Some(s),
            })
    }

    /// Record an outcome for `(mode, index)`; unknown entries are ignored
    pub fn report(&mut self, mode: DetectMode, index: usize, success: bool) -> Option<i32> {
        self.last_access = Instant::now();
        let entry = self
            .scores
            .iter_mut()
            .find(|s| s.mode == mode && s.index == index)?;
        entry.record(success);
        Some(entry.score)
    }

    /// Current scores in seeding order
    #[must_use]
    pub fn scores(&self) -> &[BehaviorScore] {
        &self.scores
    }
}

/// A strategy assignment for one rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recommendation {
    /// Strategy family
    pub mode: DetectMode,
    /// Index into the mode's catalogue
    pub index: usize,
    /// Behavior for the listening client
    pub client_behavior: RecommendedBehavior,
    /// Behavior for the visitor
    pub visitor_behavior: RecommendedBehavior,
}

/// Whether the client takes the pair's first behavior
fn client_takes_first(mode: DetectMode, client: &NatFeature, visitor: &NatFeature) -> bool {
    match mode {
        DetectMode::Mode1 | DetectMode::Mode2 => {
            client.nat_type == NatType::Hard || visitor.nat_type == NatType::Easy
        }
        DetectMode::Mode4 => client.regular_ports_change || !visitor.regular_ports_change,
        DetectMode::Mode0 | DetectMode::Mode3 => true,
    }
}

/// Process-wide strategy scores, one table per pairing class
#[derive(Debug, Default)]
pub struct Analyzer {
    records: DashMap<AnalysisKey, Arc<Mutex<MakeHoleRecords>>>,
}

impl Analyzer {
    /// Create an empty analyzer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records_for(
        &self,
        key: &AnalysisKey,
        client: &NatFeature,
        visitor: &NatFeature,
    ) -> Arc<Mutex<MakeHoleRecords>> {
        self.records
            .entry(*key)
            .or_insert_with(|| {
                tracing::debug!(%key, "seeding make-hole records");
                Arc::new(Mutex::new(MakeHoleRecords::new(client, visitor)))
            })
            .clone()
    }

    /// Recommend a strategy for a pairing, creating its table on first use
    #[must_use]
    pub fn recommend(
        &self,
        key: &AnalysisKey,
        client: &NatFeature,
        visitor: &NatFeature,
    ) -> Recommendation {
        let records = self.records_for(key, client, visitor);
        let mut records = records.lock().unwrap_or_else(PoisonError::into_inner);
        records.last_access = Instant::now();

        let (mode, index) = records
            .best()
            .map_or((DetectMode::Mode0, 0), |s| (s.mode, s.index));
        let (first, second) = mode.behaviors()[index];

        let (client_behavior, visitor_behavior) = if client_takes_first(mode, client, visitor) {
            (first, second)
        } else {
            (second, first)
        };

        Recommendation {
            mode,
            index,
            client_behavior,
            visitor_behavior,
        }
    }

    /// Record a punch outcome; returns the new score if the entry exists
    pub fn report(
        &self,
        key: &AnalysisKey,
        mode: DetectMode,
        index: usize,
        success: bool,
    ) -> Option<i32> {
        let records = self.records.get(key)?.clone();
        let mut records = records.lock().unwrap_or_else(PoisonError::into_inner);
        let score = records.report(mode, index, success);
        tracing::debug!(%key, %mode, index, success, ?score, "punch outcome recorded");
        score
    }

    /// Drop tables untouched for longer than `max_idle`; returns how many
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, records| {
            let records = records.lock().unwrap_or_else(PoisonError::into_inner);
            records.last_access.elapsed() <= max_idle
        });
        before.saturating_sub(self.records.len())
    }

    /// Number of pairing classes seen
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no pairing has been seen yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of the scores for a key
    #[must_use]
    pub fn scores(&self, key: &AnalysisKey) -> Option<Vec<BehaviorScore>> {
        let records = self.records.get(key)?.clone();
        let records = records.lock().unwrap_or_else(PoisonError::into_inner);
        Some(records.scores().to_vec())
    }
}
