//! Key partitioning for the sharded dispatcher.

use std::collections::HashMap;

/// Groups `keys` by the shard index `project` assigns them.
///
/// Keys are not deduplicated, and keep their input order within each
/// shard's slice.
pub(crate) fn partition_by<K: Clone>(
    keys: &[K],
    mut project: impl FnMut(&K) -> usize,
) -> HashMap<usize, Vec<K>> {
    let mut shards: HashMap<usize, Vec<K>> = HashMap::new();
    for key in keys {
        shards.entry(project(key)).or_default().push(key.clone());
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn groups_keys_by_projection() {
        let keys = vec![1u32, 2, 3, 4, 5, 6];
        let shards = partition_by(&keys, |k| (*k % 2) as usize);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[&0], vec![2, 4, 6]);
        assert_eq!(shards[&1], vec![1, 3, 5]);
    }

    #[test]
    fn duplicates_are_kept() {
        let keys = vec!["a", "a", "b"];
        let shards = partition_by(&keys, |_| 0);
        assert_eq!(shards[&0], vec!["a", "a", "b"]);
    }

    #[test]
    fn empty_input_yields_no_shards() {
        let shards = partition_by::<u8>(&[], |_| 0);
        assert!(shards.is_empty());
    }

    proptest! {
        #[test]
        fn every_key_lands_in_its_shard_in_order(
            keys in proptest::collection::vec(any::<u16>(), 0..128),
            shards in 1usize..16,
        ) {
            let grouped = partition_by(&keys, |k| *k as usize % shards);

            // Nothing lost, nothing invented.
            let total: usize = grouped.values().map(Vec::len).sum();
            prop_assert_eq!(total, keys.len());

            for (shard, slice) in &grouped {
                prop_assert!(!slice.is_empty());
                // Every key is in the shard the projection says it is.
                for key in slice {
                    prop_assert_eq!(*key as usize % shards, *shard);
                }
                // Input order is preserved within the shard.
                let expected: Vec<u16> = keys
                    .iter()
                    .filter(|k| **k as usize % shards == *shard)
                    .copied()
                    .collect();
                prop_assert_eq!(slice, &expected);
            }
        }
    }
}
