//! keyplace-cluster — the data placement protocol.
//!
//! Nodes periodically report which remotely-owned keys they read most,
//! owners decide which of those keys to give away, and the decisions are
//! distributed as compact relocation indices. Physical migration starts
//! only once every node has installed every index.
//!
//! # Modules
//!
//! - **`collaborators`** — traits for the stats engine, resolver, transport,
//!   executor and local store
//! - **`collector`** — bucketing a remote-access sample into demand reports
//! - **`aggregator`** — round buffering, demand merge, conflict resolution
//! - **`barrier`** — round-keyed install and ack barriers
//! - **`manager`** — `PlacementManager`, the per-node state machine
//! - **`scheduler`** — periodic round trigger
//! - **`table`** — installed indices, as the migration executor sees them
//! - **`consistency`** — pre/post-migration diagnostic check
//! - **`sim`** — in-process loopback collaborators

pub mod aggregator;
pub mod barrier;
pub mod collaborators;
pub mod collector;
pub mod consistency;
pub mod error;
pub mod manager;
pub mod scheduler;
pub mod sim;
pub mod table;

pub use aggregator::{Admission, RelocationDecision, RequestAggregator};
pub use barrier::{BarrierProgress, RoundBarrier};
pub use collaborators::{
    Collaborators, LocalStore, MigrationExecutor, OwnershipResolver, RehashEvent, StatsEngine,
    Transport,
};
pub use collector::{DemandPlan, plan_demand};
pub use error::{PlacementError, PlacementResult};
pub use manager::{AckOutcome, PlacementManager, ReportOutcome, RoundOutcome, TickOutcome};
pub use scheduler::{RoundScheduler, SchedulerHandle};
pub use table::RelocationTable;
