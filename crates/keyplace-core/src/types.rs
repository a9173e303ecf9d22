//! Node identity, membership views, and round bookkeeping.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An approximate access count reported by the statistics engine.
pub type Count = u64;

/// Stable identifier of a cluster node, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Counter families exposed by the statistics engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// Gets this node served by fetching from a remote owner.
    RemoteGet,
    /// Gets this node served from its own data container.
    LocalGet,
}

/// Ordered, deduplicated list of cluster members.
///
/// A member's position is its index for the lifetime of one view. Every
/// rebuild bumps `epoch`, so an index captured under an older epoch can be
/// detected as stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberView {
    epoch: u64,
    members: Vec<NodeId>,
}

impl MemberView {
    /// Build a view from the transport's member list.
    ///
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn new(epoch: u64, members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut seen = HashSet::new();
        let members = members
            .into_iter()
            .filter(|m| seen.insert(m.clone()))
            .collect();
        Self { epoch, members }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Positional index of a member, if present.
    pub fn index_of(&self, node: &NodeId) -> Option<usize> {
        self.members.iter().position(|m| m == node)
    }

    pub fn get(&self, index: usize) -> Option<&NodeId> {
        self.members.get(index)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    /// Number of reports a node must receive to complete a round.
    pub fn peer_count(&self) -> usize {
        self.members.len().saturating_sub(1)
    }

    /// Whether `live` names a different member set than this view.
    ///
    /// Order alone does not count as a change, so indices stay put when
    /// the transport merely reorders its list.
    pub fn is_stale(&self, live: &[NodeId]) -> bool {
        if live.len() != self.members.len() {
            return true;
        }
        live.iter().any(|m| !self.members.contains(m))
    }

    /// Rebuild from `live`, bumping the epoch.
    pub fn refreshed(&self, live: Vec<NodeId>) -> Self {
        Self::new(self.epoch + 1, live)
    }
}

/// Per-node round counters.
///
/// `request_round` counts demand broadcasts this node has started;
/// `reply_round` counts complete sets of peer reports it has aggregated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundState {
    pub request_round: u64,
    pub reply_round: u64,
}

impl RoundState {
    /// True while this node has sent a round it has not yet aggregated.
    pub fn awaiting_replies(&self) -> bool {
        self.reply_round < self.request_round
    }

    /// Abandon every round that has been started but not aggregated.
    pub fn expire(&mut self) {
        if self.reply_round < self.request_round {
            self.reply_round = self.request_round;
        }
    }
}
