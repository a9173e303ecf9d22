//! Round-keyed completion barriers.
//!
//! The install barrier (every node) and the ack barrier (coordinator only)
//! share one shape: count distinct origins per round and fire once when
//! the expected number is reached. Callers hold the barrier behind its own
//! lock so the increment and the completion test are one step.

use std::collections::{BTreeMap, HashSet};

use keyplace_core::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierProgress {
    Counted { have: usize, need: usize },
    /// This origin was already counted for the round.
    Duplicate,
    /// The round already completed or was abandoned.
    Stale,
    /// This arrival completed the round.
    Complete,
}

#[derive(Debug, Default)]
pub struct RoundBarrier {
    pending: BTreeMap<u64, HashSet<NodeId>>,
    closed_through: Option<u64>,
}

impl RoundBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self, round: u64) -> bool {
        self.closed_through.is_some_and(|c| round <= c)
    }

    /// Count `origin` toward `round`, which needs `need` distinct origins.
    pub fn record(&mut self, round: u64, origin: &NodeId, need: usize) -> BarrierProgress {
        if self.is_closed(round) {
            return BarrierProgress::Stale;
        }
        let seen = self.pending.entry(round).or_default();
        if !seen.insert(origin.clone()) {
            return BarrierProgress::Duplicate;
        }
        let have = seen.len();
        if have >= need {
            self.close_through(round);
            return BarrierProgress::Complete;
        }
        BarrierProgress::Counted { have, need }
    }

    /// Forget `round` and everything before it.
    pub fn close_through(&mut self, round: u64) {
        self.pending = match round.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        if !self.is_closed(round) {
            self.closed_through = Some(round);
        }
    }

    pub fn count(&self, round: u64) -> usize {
        self.pending.get(&round).map_or(0, HashSet::len)
    }
}
