//! Demand collector — turns a remote-access sample into per-owner reports.
//!
//! Every peer must hear from every other peer exactly once per round, so
//! members that own none of the sampled keys still get an empty report.

use std::collections::HashMap;

use keyplace_core::{KeyCounts, NodeId};
use tracing::warn;

/// Reports to send for one round, in send order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DemandPlan {
    pub reports: Vec<(NodeId, KeyCounts)>,
    /// Sampled keys the local node already owns.
    pub self_owned: usize,
    /// Sampled keys the resolver returned no owner for.
    pub unowned: usize,
}

impl DemandPlan {
    pub fn non_empty(&self) -> usize {
        self.reports.iter().filter(|(_, c)| !c.is_empty()).count()
    }
}

/// Bucket `sample` by primary owner and address every remaining member.
///
/// Owner buckets come first (in member order, then any owners outside the
/// member list by id), followed by empty reports for untouched members.
pub fn plan_demand(
    local: &NodeId,
    members: &[NodeId],
    sample: KeyCounts,
    owners: &HashMap<String, Vec<NodeId>>,
) -> DemandPlan {
    let mut buckets: HashMap<NodeId, KeyCounts> = HashMap::new();
    let mut plan = DemandPlan::default();

    for (key, count) in sample {
        let Some(primary) = owners.get(&key).and_then(|o| o.first()) else {
            plan.unowned += 1;
            continue;
        };
        if primary == local {
            plan.self_owned += 1;
            continue;
        }
        buckets.entry(primary.clone()).or_default().insert(key, count);
    }

    if plan.self_owned > 0 {
        warn!(keys = plan.self_owned, "sampled remote keys are owned locally; not sending to self");
    }
    if plan.unowned > 0 {
        warn!(keys = plan.unowned, "resolver returned no owner for sampled keys");
    }

    for member in members {
        if let Some(counts) = buckets.remove(member) {
            plan.reports.push((member.clone(), counts));
        }
    }
    let mut outside: Vec<_> = buckets.into_iter().collect();
    outside.sort_by(|a, b| a.0.cmp(&b.0));
    let addressed: Vec<NodeId> = plan.reports.iter().map(|(n, _)| n.clone()).collect();
    plan.reports.extend(outside);

    for member in members {
        if member != local && !addressed.contains(member) {
            plan.reports.push((member.clone(), KeyCounts::new()));
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn owners(pairs: &[(&str, &str)]) -> HashMap<String, Vec<NodeId>> {
        pairs
            .iter()
            .map(|(k, o)| (k.to_string(), vec![NodeId::from(*o)]))
            .collect()
    }

    fn sample(pairs: &[(&str, u64)]) -> KeyCounts {
        pairs.iter().map(|(k, c)| (k.to_string(), *c)).collect()
    }

    #[test]
    fn buckets_by_primary_owner_and_fills_empties() {
        let members = ids(&["a", "b", "c", "d"]);
        let plan = plan_demand(
            &"a".into(),
            &members,
            sample(&[("k1", 50), ("k2", 40), ("k3", 7)]),
            &owners(&[("k1", "b"), ("k2", "b"), ("k3", "d")]),
        );

        let targets: Vec<&str> = plan.reports.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(targets, vec!["b", "d", "c"]);
        assert_eq!(plan.reports[0].1, sample(&[("k1", 50), ("k2", 40)]));
        assert_eq!(plan.reports[1].1, sample(&[("k3", 7)]));
        assert!(plan.reports[2].1.is_empty());
        assert_eq!(plan.non_empty(), 2);
    }

    #[test]
    fn every_peer_is_addressed_exactly_once() {
        let members = ids(&["a", "b", "c"]);
        let plan = plan_demand(&"b".into(), &members, KeyCounts::new(), &HashMap::new());
        let targets: Vec<&str> = plan.reports.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(targets, vec!["a", "c"]);
        assert!(plan.reports.iter().all(|(_, c)| c.is_empty()));
    }

    #[test]
    fn locally_owned_and_unowned_keys_are_skipped() {
        let members = ids(&["a", "b"]);
        let plan = plan_demand(
            &"a".into(),
            &members,
            sample(&[("mine", 3), ("lost", 2), ("theirs", 1)]),
            &owners(&[("mine", "a"), ("theirs", "b")]),
        );
        assert_eq!(plan.self_owned, 1);
        assert_eq!(plan.unowned, 1);
        assert_eq!(plan.reports, vec![("b".into(), sample(&[("theirs", 1)]))]);
    }

    #[test]
    fn owners_outside_the_view_still_get_their_keys() {
        let members = ids(&["a", "b"]);
        let plan = plan_demand(
            &"a".into(),
            &members,
            sample(&[("k", 9)]),
            &owners(&[("k", "z")]),
        );
        let targets: Vec<&str> = plan.reports.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(targets, vec!["z", "b"]);
    }
}
