//! NAT-hole rendezvous for VESPER.
//!
//! Two peers behind NATs ask a relay server to coordinate a direct UDP path.
//! The server never sees either peer's firewall; it only sees the external
//! mappings each peer reports after talking to STUN servers. From those it
//! picks a punch strategy, ships timed instructions to both sides and learns
//! from the reported outcome.
//!
//! Components, leaves first:
//!
//! - [`stun`] / [`discovery`]: Binding Request codec and the per-peer
//!   discovery run that produces external mappings.
//! - [`classify`]: pure NAT classification (Easy/Hard, port regularity).
//! - [`analysis`]: catalogue of punch strategies with per-pairing scores.
//! - [`controller`]: server-side session state machine tying it together.
//!
//! # Example
//!
//! ```no_run
//! use vesper_nathole::{Controller, ControllerConfig};
//!
//! # async fn run() -> Result<(), vesper_nathole::NatHoleError> {
//! let controller = Controller::new(ControllerConfig::default());
//! let mut sids = controller.listen_client("web", "secret", vec!["*".into()]).await?;
//! while let Some(sid) = sids.recv().await {
//!     println!("visitor waiting in session {}", sid.sid);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod analysis;
pub mod auth;
pub mod classify;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod msg;
pub mod session;
pub mod signal;
pub mod stun;

pub use analysis::{AnalysisKey, Analyzer, DetectMode, DetectRole, Recommendation};
pub use classify::{NatBehavior, NatFeature, NatType, classify_nat_feature, classify_nat_type};
pub use config::{ControllerConfig, DiscoveryConfig};
pub use controller::{Controller, SidReceiver};
pub use discovery::{Discovery, discover};
pub use error::{NatHoleError, Result};
pub use msg::{Message, MessageSink};
pub use stun::StunError;
