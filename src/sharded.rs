//! Hash-partitioned dispatcher over independent groups.
//!
//! A [`ShardedGroup`] holds N independent [`Group`]s and routes every key
//! to `hash(key) % N`. It keeps no state of its own, so contention above
//! the shard layer is zero and throughput scales with the shard count;
//! all actual coordination happens inside the owning shard.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::group::{ChanFlight, FlightResult, Group};
use crate::hasher::KeyHasher;
use crate::partition::partition_by;

/// A fixed set of independent groups addressed by a user-supplied hash.
pub struct ShardedGroup<K, V, H> {
    shards: Vec<Arc<Group<K, V>>>,
    hasher: H,
}

impl<K, V, H> fmt::Debug for ShardedGroup<K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedGroup")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl<K, V, H> ShardedGroup<K, V, H>
where
    K: Eq + Hash + Clone,
    V: Clone,
    H: KeyHasher<K>,
{
    /// Creates a sharded group with `shards` independent groups.
    ///
    /// # Panics
    ///
    /// With a shard count of zero; that is a contract violation, not a
    /// runtime condition.
    pub fn new(shards: usize, hasher: H) -> Self {
        assert!(shards > 0, "shard count must be at least 1");
        Self {
            shards: (0..shards).map(|_| Arc::new(Group::new())).collect(),
            hasher,
        }
    }

    /// Number of shards this group was built with.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total keys in flight across all shards.
    pub fn in_flight_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.in_flight_count()).sum()
    }

    fn shard(&self, key: &K) -> &Arc<Group<K, V>> {
        &self.shards[self.hasher.shard_of(key, self.shards.len())]
    }

    /// [`Group::work`] on the shard owning `key`.
    pub async fn work<F, Fut, E>(&self, key: K, func: F) -> FlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<anyhow::Error>,
    {
        self.shard(&key).work(key, func).await
    }

    /// [`Group::work_chan`] on the shard owning `key`.
    pub fn work_chan<F, Fut, E>(&self, key: K, func: F) -> mpsc::Receiver<FlightResult<V>>
    where
        K: Send + 'static,
        V: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send,
        E: Into<anyhow::Error>,
    {
        let shard = self.shard(&key);
        shard.work_chan(key, func)
    }

    /// Batched call across shards, delivered synchronously.
    ///
    /// Keys are partitioned by shard and each shard runs at most one
    /// invocation of (its clone of) `func` on its own task; per-shard
    /// result maps merge into one. Because delivery goes through the
    /// channel machinery, a panicking work function takes the process
    /// down, as with [`work_chan`](Self::work_chan).
    pub async fn work_many<F, Fut, E>(&self, keys: Vec<K>, func: F) -> HashMap<K, FlightResult<V>>
    where
        K: Send + 'static,
        V: Send + 'static,
        F: FnOnce(Vec<K>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<HashMap<K, V>, E>> + Send,
        E: Into<anyhow::Error>,
    {
        let by_shard = partition_by(&keys, |key| self.hasher.shard_of(key, self.shards.len()));

        let mut flights: HashMap<K, ChanFlight<V>> = HashMap::with_capacity(keys.len());
        for (shard, shard_keys) in by_shard {
            flights.extend(self.shards[shard].register_many_chan(shard_keys, func.clone()));
        }

        let mut results = HashMap::with_capacity(flights.len());
        for (key, flight) in flights {
            results.insert(key, flight.recv().await);
        }
        results
    }

    /// Batched call across shards, each requested key answered on its own
    /// one-slot channel.
    ///
    /// No ordering is defined across shards; duplicate keys share one
    /// channel, as in [`Group::work_many_chan`].
    pub fn work_many_chan<F, Fut, E>(
        &self,
        keys: Vec<K>,
        func: F,
    ) -> HashMap<K, mpsc::Receiver<FlightResult<V>>>
    where
        K: Send + 'static,
        V: Send + 'static,
        F: FnOnce(Vec<K>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<HashMap<K, V>, E>> + Send,
        E: Into<anyhow::Error>,
    {
        let by_shard = partition_by(&keys, |key| self.hasher.shard_of(key, self.shards.len()));

        let mut receivers = HashMap::with_capacity(keys.len());
        for (shard, shard_keys) in by_shard {
            receivers.extend(self.shards[shard].work_many_chan(shard_keys, func.clone()));
        }
        receivers
    }

    /// [`Group::forget`] on the shard owning `key`.
    pub fn forget(&self, key: &K) {
        self.shard(key).forget(key);
    }

    /// [`Group::forget_many`], one registry lock per affected shard.
    pub fn forget_many(&self, keys: &[K]) {
        let by_shard = partition_by(keys, |key| self.hasher.shard_of(key, self.shards.len()));
        for (shard, shard_keys) in by_shard {
            self.shards[shard].forget_many(&shard_keys);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "shard count must be at least 1")]
    fn zero_shards_is_a_contract_violation() {
        let _ = ShardedGroup::<u64, u64, _>::new(0, |key: &u64| *key);
    }

    #[test]
    fn shard_count_is_reported() {
        let sharded = ShardedGroup::<u64, u64, _>::new(4, |key: &u64| *key);
        assert_eq!(sharded.shard_count(), 4);
        assert_eq!(sharded.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn single_key_routes_and_settles() {
        let sharded = ShardedGroup::<String, String, _>::new(4, |key: &String| key.len() as u64);
        let result = sharded
            .work("key".to_string(), || async {
                Ok::<_, anyhow::Error>("bar".to_string())
            })
            .await;
        assert_eq!(result.value.as_deref(), Some("bar"));
        assert!(result.err.is_none());
        assert!(!result.shared);
        assert_eq!(sharded.in_flight_count(), 0);
    }
}
