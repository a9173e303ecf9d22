//! Relocation lookup table — the installed indices, one slot per owner.
//!
//! Each slot holds the index a node announced for the keys it is giving
//! away. Owner indices inside an index are positions in the member view the
//! announcing round was aggregated under, so a new view empties the table.

use std::collections::HashMap;
use std::sync::Arc;

use keyplace_core::{MemberView, NodeId};
use keyplace_index::{CompactRelocationIndex, Lookup};

#[derive(Debug, Default)]
pub struct RelocationTable {
    view: MemberView,
    slots: HashMap<NodeId, Arc<CompactRelocationIndex>>,
}

impl RelocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `view`. Slots installed under a different view are dropped.
    /// Returns how many were dropped.
    pub fn set_view(&mut self, view: &MemberView) -> usize {
        let changed = view.epoch() != self.view.epoch() || view.members() != self.view.members();
        self.view = view.clone();
        if !changed {
            return 0;
        }
        let dropped = self.slots.len();
        self.slots.clear();
        dropped
    }

    pub fn view(&self) -> &MemberView {
        &self.view
    }

    /// Replace `owner`'s slot. Returns `true` if a previous index was dropped.
    pub fn install(&mut self, owner: &NodeId, index: Arc<CompactRelocationIndex>) -> bool {
        self.slots.insert(owner.clone(), index).is_some()
    }

    pub fn get(&self, owner: &NodeId) -> Option<&Arc<CompactRelocationIndex>> {
        self.slots.get(owner)
    }

    /// Where `key` moves to according to `owner`'s announced index.
    pub fn locate_from(&self, owner: &NodeId, key: &str) -> Option<NodeId> {
        match self.slots.get(owner)?.lookup(key) {
            Lookup::Relocated(i) => self.view.get(i).cloned(),
            Lookup::NotRelocated => None,
        }
    }

    /// New owner of `key`, asking every installed index in member order.
    ///
    /// The first index that claims the key wins. A negative-filter false
    /// positive in an earlier slot can shadow the true entry.
    pub fn locate(&self, key: &str) -> Option<NodeId> {
        self.view
            .members()
            .iter()
            .filter(|m| self.slots.contains_key(*m))
            .find_map(|m| self.locate_from(m, key))
    }

    /// Owners with an installed slot, in member order.
    pub fn owners(&self) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = self
            .view
            .members()
            .iter()
            .filter(|m| self.slots.contains_key(*m))
            .cloned()
            .collect();
        let mut outside: Vec<NodeId> = self
            .slots
            .keys()
            .filter(|k| !self.view.contains(k))
            .cloned()
            .collect();
        outside.sort();
        owners.extend(outside);
        owners
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> MemberView {
        MemberView::new(1, ["a", "b", "c"].map(NodeId::from))
    }

    fn index(pairs: &[(&str, usize)]) -> Arc<CompactRelocationIndex> {
        let d: Vec<(String, usize)> = pairs.iter().map(|(k, o)| (k.to_string(), *o)).collect();
        Arc::new(CompactRelocationIndex::train(&d, 0.01).unwrap())
    }

    #[test]
    fn locate_maps_owner_index_through_the_view() {
        let mut table = RelocationTable::new();
        table.set_view(&view());
        table.install(&"b".into(), index(&[("k1", 0), ("k2", 2)]));

        assert_eq!(table.locate("k1"), Some("a".into()));
        assert_eq!(table.locate("k2"), Some("c".into()));
        assert_eq!(table.locate_from(&"b".into(), "k1"), Some("a".into()));
        assert_eq!(table.locate_from(&"c".into(), "k1"), None);
    }

    #[test]
    fn install_replaces_the_slot_wholesale() {
        let mut table = RelocationTable::new();
        table.set_view(&view());
        assert!(!table.install(&"b".into(), index(&[("old", 0)])));
        assert!(table.install(&"b".into(), index(&[("new", 2)])));

        assert_eq!(table.len(), 1);
        assert_eq!(table.locate("new"), Some("c".into()));
        assert_eq!(table.locate_from(&"b".into(), "old"), None);
    }

    #[test]
    fn owners_follow_member_order() {
        let mut table = RelocationTable::new();
        table.set_view(&view());
        table.install(&"c".into(), index(&[]));
        table.install(&"a".into(), index(&[]));
        table.install(&"z".into(), index(&[]));
        assert_eq!(table.owners(), vec![NodeId::from("a"), "c".into(), "z".into()]);
    }

    #[test]
    fn new_view_drops_indices_from_the_old_one() {
        let mut table = RelocationTable::new();
        table.set_view(&view());
        table.install(&"b".into(), index(&[("k1", 0)]));
        assert_eq!(table.locate("k1"), Some("a".into()));

        // Index 0 would now name b, the node giving the key away.
        assert_eq!(table.set_view(&MemberView::new(2, ["b", "c"].map(NodeId::from))), 1);
        assert_eq!(table.locate("k1"), None);
        assert_eq!(table.locate_from(&"b".into(), "k1"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn same_view_keeps_installed_indices() {
        let mut table = RelocationTable::new();
        table.set_view(&view());
        table.install(&"b".into(), index(&[("k1", 0)]));
        assert_eq!(table.set_view(&view()), 0);
        assert_eq!(table.locate("k1"), Some("a".into()));
    }

    #[test]
    fn relocated_index_outside_view_is_ignored() {
        let mut table = RelocationTable::new();
        table.set_view(&MemberView::new(1, ["a"].map(NodeId::from)));
        table.install(&"a".into(), index(&[("k", 4)]));
        assert_eq!(table.locate("k"), None);
    }
}
