//! Post-migration consistency monitor.
//!
//! Diagnostic only: violations are logged and returned, never acted on.

use keyplace_core::NodeId;
use tracing::{error, info};

use crate::collaborators::{LocalStore, RehashEvent};

/// Check the last relocation decision against the local store.
///
/// Before migration every released key must still be here; afterwards
/// none of them may be. Returns the offending keys.
pub fn check_relocated(
    local: &NodeId,
    store: &dyn LocalStore,
    released: &[(String, usize)],
    event: &RehashEvent,
) -> Vec<String> {
    let violations: Vec<String> = released
        .iter()
        .filter(|(key, _)| store.contains_key(key) != event.pre)
        .map(|(key, _)| key.clone())
        .collect();

    for key in &violations {
        if event.pre {
            error!(node = %local, %key, view = event.view_id, "released key missing before migration");
        } else {
            error!(node = %local, %key, view = event.view_id, "released key still present after migration");
        }
    }
    if violations.is_empty() && !released.is_empty() {
        info!(
            node = %local,
            keys = released.len(),
            pre = event.pre,
            view = event.view_id,
            "relocation consistency check passed"
        );
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Keys(HashSet<String>);

    impl LocalStore for Keys {
        fn contains_key(&self, key: &str) -> bool {
            self.0.contains(key)
        }
        fn len(&self) -> usize {
            self.0.len()
        }
    }

    fn event(pre: bool) -> RehashEvent {
        RehashEvent {
            pre,
            view_id: 3,
            members_at_start: vec!["a".into(), "b".into()],
            members_at_end: vec!["a".into(), "b".into()],
        }
    }

    fn released() -> Vec<(String, usize)> {
        vec![("k1".to_string(), 0), ("k2".to_string(), 1)]
    }

    #[test]
    fn pre_phase_flags_missing_keys() {
        let store = Keys(["k1".to_string()].into_iter().collect());
        let bad = check_relocated(&"b".into(), &store, &released(), &event(true));
        assert_eq!(bad, vec!["k2".to_string()]);
    }

    #[test]
    fn post_phase_flags_keys_left_behind() {
        let store = Keys(["k2".to_string(), "other".to_string()].into_iter().collect());
        let bad = check_relocated(&"b".into(), &store, &released(), &event(false));
        assert_eq!(bad, vec!["k2".to_string()]);
    }

    #[test]
    fn clean_migration_has_no_violations() {
        let before = Keys(["k1".to_string(), "k2".to_string()].into_iter().collect());
        let after = Keys(HashSet::new());
        assert!(check_relocated(&"b".into(), &before, &released(), &event(true)).is_empty());
        assert!(check_relocated(&"b".into(), &after, &released(), &event(false)).is_empty());
    }
}
