//! Request aggregator — buffers one round of peer demand and merges it.
//!
//! The aggregator only stores and classifies reports; the round counters
//! live in `PlacementManager`, which passes the current reply round in.
//!
//! Merging and conflict resolution are pure functions so they can be
//! checked in isolation:
//!
//! - [`compact_requests`] keeps, per key, the highest count across all
//!   buffered reports. Ties keep the report that was buffered first.
//! - [`resolve_conflicts`] releases a key only when nobody local reads it
//!   as often as the winning requester.

use std::collections::{BTreeMap, HashMap};

use keyplace_core::{Count, KeyCounts, MemberView, NodeId};
use tracing::warn;

/// Key → (best remote count, member index of the requester with it).
pub type AggregatedDemand = HashMap<String, (Count, usize)>;

/// Keys this node gives away and the member index each goes to.
pub type RelocationDecision = Vec<(String, usize)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedReport {
    pub sender: NodeId,
    pub sender_index: usize,
    pub key_counts: KeyCounts,
}

/// What happened to an inbound report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Buffered,
    /// Held for a near-future round.
    Parked,
    /// This sender already reported for the round.
    Duplicate,
    /// Older than the current reply round.
    Stale,
    /// Further ahead than the parking window allows.
    TooFarAhead,
}

#[derive(Debug)]
pub struct RequestAggregator {
    buffer: Vec<BufferedReport>,
    /// View epoch the current round's first report was admitted under.
    opened_epoch: Option<u64>,
    parked: BTreeMap<u64, Vec<(NodeId, KeyCounts)>>,
    max_future_rounds: u64,
}

impl RequestAggregator {
    pub fn new(max_future_rounds: u64) -> Self {
        Self {
            buffer: Vec::new(),
            opened_epoch: None,
            parked: BTreeMap::new(),
            max_future_rounds,
        }
    }

    pub fn admit(
        &mut self,
        view: &MemberView,
        reply_round: u64,
        sender: &NodeId,
        sender_index: usize,
        round: u64,
        key_counts: KeyCounts,
    ) -> Admission {
        if round < reply_round {
            return Admission::Stale;
        }
        if round > reply_round {
            if round - reply_round > self.max_future_rounds {
                return Admission::TooFarAhead;
            }
            let parked = self.parked.entry(round).or_default();
            if parked.iter().any(|(s, _)| s == sender) {
                return Admission::Duplicate;
            }
            parked.push((sender.clone(), key_counts));
            return Admission::Parked;
        }

        if self.buffer.iter().any(|r| r.sender == *sender) {
            return Admission::Duplicate;
        }
        if self.opened_epoch.is_none() {
            self.opened_epoch = Some(view.epoch());
        }
        self.buffer.push(BufferedReport {
            sender: sender.clone(),
            sender_index,
            key_counts,
        });
        Admission::Buffered
    }

    /// Every peer but the local node has reported.
    pub fn is_complete(&self, peer_count: usize) -> bool {
        peer_count > 0 && self.buffer.len() >= peer_count
    }

    pub fn buffered(&self) -> &[BufferedReport] {
        &self.buffer
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    pub fn opened_epoch(&self) -> Option<u64> {
        self.opened_epoch
    }

    /// Close the current round and move on to `next_round`.
    ///
    /// Reports parked for `next_round` are promoted in arrival order;
    /// anything parked for earlier rounds is discarded.
    pub fn advance(&mut self, next_round: u64, view: &MemberView) {
        self.buffer.clear();
        self.opened_epoch = None;

        let later = self.parked.split_off(&next_round);
        let dropped: usize = self.parked.values().map(Vec::len).sum();
        if dropped > 0 {
            warn!(dropped, next_round, "discarding parked reports for skipped rounds");
        }
        self.parked = later;

        if let Some(promoted) = self.parked.remove(&next_round) {
            for (sender, key_counts) in promoted {
                match view.index_of(&sender) {
                    Some(sender_index) => {
                        if self.opened_epoch.is_none() {
                            self.opened_epoch = Some(view.epoch());
                        }
                        self.buffer.push(BufferedReport {
                            sender,
                            sender_index,
                            key_counts,
                        });
                    }
                    None => {
                        warn!(%sender, round = next_round, "parked report from departed member dropped");
                    }
                }
            }
        }
    }

    /// Drop everything, including parked reports.
    pub fn abort(&mut self) {
        self.buffer.clear();
        self.opened_epoch = None;
        self.parked.clear();
    }
}

/// Counters reported for each merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Keys first seen in a later report.
    pub merged: usize,
    pub conflicts_won: usize,
    pub conflicts_lost: usize,
}

/// Merge buffered reports into one demand map.
///
/// The first report seeds the map. For later reports a key is inserted if
/// absent and replaced only by a strictly greater count.
pub fn compact_requests(reports: &[BufferedReport]) -> (AggregatedDemand, MergeStats) {
    let mut full = AggregatedDemand::new();
    let mut stats = MergeStats::default();

    let Some((first, rest)) = reports.split_first() else {
        return (full, stats);
    };
    for (key, count) in &first.key_counts {
        full.insert(key.clone(), (*count, first.sender_index));
    }

    for report in rest {
        for (key, count) in &report.key_counts {
            match full.get_mut(key) {
                None => {
                    full.insert(key.clone(), (*count, report.sender_index));
                    stats.merged += 1;
                }
                Some(entry) if entry.0 < *count => {
                    *entry = (*count, report.sender_index);
                    stats.conflicts_won += 1;
                }
                Some(_) => stats.conflicts_lost += 1,
            }
        }
    }
    (full, stats)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictStats {
    /// Approved keys with no local reads at all.
    pub uncontested: usize,
    /// Approved keys whose local count was lower than the remote one.
    pub won: usize,
    /// Keys kept because local reads matched or beat the remote count.
    pub lost: usize,
}

/// Decide which demanded keys to give away, sorted by key.
pub fn resolve_conflicts(
    demand: &AggregatedDemand,
    local: &KeyCounts,
) -> (RelocationDecision, ConflictStats) {
    let mut decision = RelocationDecision::new();
    let mut stats = ConflictStats::default();

    for (key, &(remote, winner)) in demand {
        match local.get(key) {
            None => {
                decision.push((key.clone(), winner));
                stats.uncontested += 1;
            }
            Some(&mine) if mine < remote => {
                decision.push((key.clone(), winner));
                stats.won += 1;
            }
            Some(_) => stats.lost += 1,
        }
    }
    decision.sort();
    (decision, stats)
}
