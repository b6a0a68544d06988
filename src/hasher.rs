//! Key-to-shard projection for [`ShardedGroup`](crate::ShardedGroup).

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// A user-supplied 64-bit hash over keys.
///
/// Implementations should minimize collisions; a fast function is
/// preferable since it runs on every sharded operation. The trait is
/// blanket-implemented for `Fn(&K) -> u64` closures, so a plain function
/// works:
///
/// ```rust,ignore
/// let sharded = ShardedGroup::new(8, |key: &u64| *key);
/// ```
pub trait KeyHasher<K>: Send + Sync {
    /// 64-bit hash of `key`.
    fn hash_key(&self, key: &K) -> u64;

    /// Index of the shard owning `key`, given `shards` total shards.
    fn shard_of(&self, key: &K, shards: usize) -> usize {
        (self.hash_key(key) % shards as u64) as usize
    }
}

impl<K, F> KeyHasher<K> for F
where
    F: Fn(&K) -> u64 + Send + Sync,
{
    fn hash_key(&self, key: &K) -> u64 {
        self(key)
    }
}

/// [`KeyHasher`] backed by the standard library's default hasher.
///
/// Shard placement is stable for the lifetime of one instance; two
/// instances will generally disagree because the underlying state is
/// randomly seeded.
#[derive(Debug, Default, Clone)]
pub struct StdKeyHasher {
    state: RandomState,
}

impl StdKeyHasher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: Hash> KeyHasher<K> for StdKeyHasher {
    fn hash_key(&self, key: &K) -> u64 {
        self.state.hash_one(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn closure_hasher_projects_modulo_shards() {
        let hasher = |key: &u64| *key * 2;
        assert_eq!(hasher.shard_of(&0, 42), 0);
        assert_eq!(hasher.shard_of(&20, 42), 40);
        assert_eq!(hasher.shard_of(&21, 42), 0);
        assert_eq!(hasher.shard_of(&22, 42), 2);
    }

    #[test]
    fn std_hasher_is_stable_within_one_instance() {
        let hasher = StdKeyHasher::new();
        let first = KeyHasher::<&str>::hash_key(&hasher, &"key");
        let second = KeyHasher::<&str>::hash_key(&hasher, &"key");
        assert_eq!(first, second);
    }

    proptest! {
        #[test]
        fn shard_index_is_always_in_range(key in any::<u64>(), shards in 1usize..64) {
            let hasher = StdKeyHasher::new();
            prop_assert!(hasher.shard_of(&key, shards) < shards);
        }
    }
}
