//! Interfaces of the systems the placement protocol depends on.
//!
//! The statistics engine, ownership resolver, transport, migration
//! executor and data container are external to this crate. They are
//! injected into `PlacementManager` as trait objects so tests and the
//! simulator can substitute in-process versions.

use std::collections::HashMap;
use std::sync::Arc;

use keyplace_core::{KeyCounts, MemberView, Message, NodeId, StatKind};
use keyplace_index::CompactRelocationIndex;

/// Approximate top-K access counters.
pub trait StatsEngine: Send + Sync {
    /// Number of keys each top-K counter tracks.
    fn capacity(&self) -> usize;
    /// The `k` most frequent keys for `kind`.
    fn top_k(&self, kind: StatKind, k: usize) -> KeyCounts;
}

/// Consistent-hash ownership lookup.
pub trait OwnershipResolver: Send + Sync {
    /// Owners of each key, primary first.
    fn locate_owners(
        &self,
        keys: &[String],
        replicas: usize,
    ) -> Result<HashMap<String, Vec<NodeId>>, String>;
}

/// Cluster messaging. Sends are fire-and-forget: `Ok` means the message was
/// handed to the transport, not that it was delivered.
pub trait Transport: Send + Sync {
    fn local_node(&self) -> NodeId;
    /// Live members, in the transport's order.
    fn members(&self) -> Vec<NodeId>;
    fn coordinator(&self) -> Option<NodeId>;
    fn send(&self, target: &NodeId, message: Message) -> Result<(), String>;
    /// Send to every member except the local node.
    fn broadcast(&self, message: Message) -> Result<(), String>;
}

/// The component that physically moves keys between nodes.
pub trait MigrationExecutor: Send + Sync {
    fn set_member_view(&self, view: &MemberView);
    /// Replace the relocation index announced by `owner`.
    fn install_index(&self, owner: &NodeId, index: Arc<CompactRelocationIndex>);
    fn begin_migration(&self, cache_name: &str) -> Result<(), String>;
}

/// Read access to the local data container, used by the consistency check.
pub trait LocalStore: Send + Sync {
    fn contains_key(&self, key: &str) -> bool;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a `PlacementManager` talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub stats: Arc<dyn StatsEngine>,
    pub resolver: Arc<dyn OwnershipResolver>,
    pub transport: Arc<dyn Transport>,
    pub executor: Arc<dyn MigrationExecutor>,
    /// Only needed for the consistency check.
    pub store: Option<Arc<dyn LocalStore>>,
}

/// A rehash-completion notification from the topology notifier.
#[derive(Debug, Clone)]
pub struct RehashEvent {
    /// `true` before keys move, `false` once they have.
    pub pre: bool,
    pub view_id: u64,
    pub members_at_start: Vec<NodeId>,
    pub members_at_end: Vec<NodeId>,
}

impl RehashEvent {
    /// Membership size did not change across the rehash.
    pub fn is_topology_stable(&self) -> bool {
        self.members_at_start.len() == self.members_at_end.len()
    }
}
