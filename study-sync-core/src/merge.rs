//! Union merge with incoming-wins conflict resolution.
//!
//! Used both for reconciliation (incoming = remote) and for import
//! (incoming = the imported snapshot). This is a last-writer-wins-by-source
//! policy; timestamps are never compared.

use crate::record::{RecordMap, SubjectId};

/// Result of merging a local map with an incoming map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome<F> {
    /// Union of both maps; incoming values replace local ones on conflict.
    pub merged: RecordMap<F>,
    /// Subject ids present locally but absent from the incoming map, sorted.
    pub local_only: Vec<SubjectId>,
}

/// Merge `incoming` over `local`.
#[must_use]
pub fn merge<F: Clone>(local: &RecordMap<F>, incoming: &RecordMap<F>) -> MergeOutcome<F> {
    let mut merged = local.clone();
    let local_only = local
        .keys()
        .filter(|id| !incoming.contains_key(*id))
        .cloned()
        .collect();
    for (id, record) in incoming {
        merged.insert(id.clone(), record.clone());
    }
    MergeOutcome { merged, local_only }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CompletionFields, Record};

    fn map(entries: &[(&str, u64)]) -> RecordMap<CompletionFields> {
        entries
            .iter()
            .map(|(id, t)| ((*id).to_string(), Record::at(*t, CompletionFields {})))
            .collect()
    }

    #[test]
    fn test_remote_wins_and_nothing_local_only() {
        let local = map(&[("A", 1)]);
        let remote = map(&[("A", 2), ("B", 3)]);
        let outcome = merge(&local, &remote);
        assert_eq!(outcome.merged, map(&[("A", 2), ("B", 3)]));
        assert!(outcome.local_only.is_empty());
    }

    #[test]
    fn test_local_only_kept_and_reported() {
        let local = map(&[("C", 4)]);
        let outcome = merge(&local, &map(&[]));
        assert_eq!(outcome.merged, map(&[("C", 4)]));
        assert_eq!(outcome.local_only, vec!["C".to_string()]);
    }

    #[test]
    fn test_merge_with_self_is_fixed_point() {
        let local = map(&[("A", 1), ("B", 2)]);
        let outcome = merge(&local, &local);
        assert_eq!(outcome.merged, local);
        assert!(outcome.local_only.is_empty());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_map() -> impl Strategy<Value = RecordMap<CompletionFields>> {
            prop::collection::btree_map("[a-e]", 0u64..100, 0..6).prop_map(|m| {
                m.into_iter()
                    .map(|(id, t)| (id, Record::at(t, CompletionFields {})))
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn prop_incoming_wins_on_conflict(local in arb_map(), remote in arb_map()) {
                let outcome = merge(&local, &remote);
                for (id, record) in &remote {
                    prop_assert_eq!(outcome.merged.get(id), Some(record));
                }
            }

            #[test]
            fn prop_union_is_complete(local in arb_map(), remote in arb_map()) {
                let outcome = merge(&local, &remote);
                prop_assert_eq!(
                    outcome.merged.len(),
                    remote.len() + outcome.local_only.len()
                );
                for id in &outcome.local_only {
                    prop_assert!(!remote.contains_key(id));
                    prop_assert_eq!(outcome.merged.get(id), local.get(id));
                }
            }

            #[test]
            fn prop_second_merge_has_nothing_local_only(local in arb_map(), remote in arb_map()) {
                let first = merge(&local, &remote);
                // After the push, the remote holds the merged map.
                let second = merge(&first.merged, &first.merged);
                prop_assert!(second.local_only.is_empty());
                prop_assert_eq!(second.merged, first.merged);
            }
        }
    }
}
