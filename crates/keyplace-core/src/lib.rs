//! keyplace-core — shared vocabulary of the data placement protocol.
//!
//! Every node in the cluster speaks in terms of the types defined here:
//!
//! - **`types`** — node identity, the per-round `MemberView`, `RoundState`
//! - **`message`** — the wire messages exchanged between nodes
//! - **`config`** — `placement.toml` configuration

pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use config::PlacementConfig;
pub use error::{CoreError, CoreResult};
pub use message::{AnnouncePhase, DemandReportMessage, Envelope, IndexAnnounceMessage, KeyCounts, Message};
pub use types::{Count, MemberView, NodeId, RoundState, StatKind};
