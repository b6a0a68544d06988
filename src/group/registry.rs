//! The group registry and its executor.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};

use crate::error::{FlightError, PanicPayload};

use super::call::{Call, Completion, CompletionGuard, Outcome, Verdict};
use super::types::FlightResult;

/// Duplicate-call suppression for keyed work.
///
/// A `Group` holds one call record per key currently in flight. The first
/// caller for a key runs the work function; callers overlapping it attach
/// to the record and receive the same outcome. Keys are removed the
/// moment their flight settles; results are never cached.
///
/// # Thread safety
///
/// The registry is guarded by a plain [`std::sync::Mutex`]. It is only
/// ever held for map operations, never across an await point and never
/// while the work function runs.
///
/// # Value sharing
///
/// `V: Clone` because one produced value fans out to every attached
/// caller. Wrap large values in [`Arc`] to keep the fan-out cheap.
pub struct Group<K, V> {
    registry: Mutex<HashMap<K, Arc<Call<V>>>>,
}

/// Which side of a flight the caller ended up on.
enum Role<V> {
    Lead(Arc<Call<V>>),
    Join(broadcast::Receiver<Outcome<V>>),
}

impl<K, V> Group<K, V> {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for Group<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.registry.lock().unwrap().len())
            .finish()
    }
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Runs `func` for `key`, suppressing duplicate executions.
    ///
    /// If no call is in flight for `key`, `func` runs on the caller's
    /// task; otherwise the caller waits for the in-flight call and
    /// receives a copy of its outcome. `shared` in the result is true iff
    /// at least one duplicate caller attached to the flight.
    ///
    /// # Panics
    ///
    /// If the work function panics, every caller attached to the flight
    /// re-raises the panic on its own task.
    pub async fn work<F, Fut, E>(&self, key: K, func: F) -> FlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<anyhow::Error>,
    {
        let role = {
            let mut registry = self.registry.lock().unwrap();
            match registry.entry(key.clone()) {
                Entry::Occupied(entry) => Role::Join(entry.get().join()),
                Entry::Vacant(entry) => {
                    let call = Arc::new(Call::new());
                    entry.insert(Arc::clone(&call));
                    Role::Lead(call)
                }
            }
        };

        match role {
            Role::Join(rx) => {
                metrics::counter!("rsflight_flights_joined_total").increment(1);
                tracing::trace!("joining flight already in progress");
                await_outcome(rx).await
            }
            Role::Lead(call) => {
                metrics::counter!("rsflight_flights_started_total").increment(1);
                tracing::trace!("starting new flight");
                let lead_key = key.clone();
                let mut results = self
                    .execute(vec![(key.clone(), call)], move |_keys: Vec<K>| async move {
                        func().await.map(|value| HashMap::from([(lead_key, value)]))
                    })
                    .await;
                results
                    .remove(&key)
                    .expect("a settled flight yields a result for its key")
            }
        }
    }

    /// Like [`work`](Self::work), but the executor runs on its own task
    /// and the outcome arrives on a one-slot channel.
    ///
    /// Every caller gets its own receiver; all receivers for one flight
    /// yield equal results. The receiver yields exactly one result for a
    /// settled flight and closes without one only if the flight was
    /// abandoned. A panic in the work function aborts the process: a
    /// channel caller has no way to re-raise it, and delivering nothing
    /// would strand every receiver forever.
    pub fn work_chan<F, Fut, E>(self: &Arc<Self>, key: K, func: F) -> mpsc::Receiver<FlightResult<V>>
    where
        K: Send + 'static,
        V: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send,
        E: Into<anyhow::Error>,
    {
        let (tx, rx) = mpsc::channel(1);
        let lead = {
            let mut registry = self.registry.lock().unwrap();
            match registry.entry(key.clone()) {
                Entry::Occupied(entry) => {
                    entry.get().join_chan(tx);
                    None
                }
                Entry::Vacant(entry) => {
                    let call = Arc::new(Call::new());
                    call.attach_chan(tx);
                    entry.insert(Arc::clone(&call));
                    Some(call)
                }
            }
        };

        match lead {
            None => {
                metrics::counter!("rsflight_flights_joined_total").increment(1);
            }
            Some(call) => {
                metrics::counter!("rsflight_flights_started_total").increment(1);
                let group = Arc::clone(self);
                tokio::spawn(async move {
                    let result_key = key.clone();
                    group
                        .execute(vec![(key, call)], move |_keys: Vec<K>| async move {
                            func().await.map(|value| HashMap::from([(result_key, value)]))
                        })
                        .await;
                });
            }
        }
        rx
    }

    /// Runs `func` once for the subset of `keys` not already in flight,
    /// suppressing duplicate executions per key.
    ///
    /// `func` receives only the keys this caller leads; if every
    /// requested key is already in flight it is never invoked. Keys it
    /// settles without supplying a value come back with `value: None`,
    /// and on error every led key carries the same shared error.
    /// Duplicate keys in `keys` collapse to a single result entry, but
    /// every repeated occurrence still counts as one more duplicate
    /// caller, so the collapsed entry reports `shared = true`.
    pub async fn work_many<F, Fut, E>(&self, keys: Vec<K>, func: F) -> HashMap<K, FlightResult<V>>
    where
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = Result<HashMap<K, V>, E>>,
        E: Into<anyhow::Error>,
    {
        let mut joins: Vec<(K, broadcast::Receiver<Outcome<V>>)> = Vec::new();
        let mut leads: Vec<(K, Arc<Call<V>>)> = Vec::new();
        let mut seen: HashSet<K> = HashSet::with_capacity(keys.len());
        let mut repeats = 0u64;
        {
            let mut registry = self.registry.lock().unwrap();
            for key in keys {
                // A repeat of a key in the same request collapses onto the
                // slot this call already holds, as one more waiter.
                if !seen.insert(key.clone()) {
                    if let Some(call) = registry.get(&key) {
                        call.add_waiter();
                    }
                    repeats += 1;
                    continue;
                }
                match registry.entry(key.clone()) {
                    Entry::Occupied(entry) => joins.push((key, entry.get().join())),
                    Entry::Vacant(entry) => {
                        let call = Arc::new(Call::new());
                        entry.insert(Arc::clone(&call));
                        leads.push((key, call));
                    }
                }
            }
        }
        metrics::counter!("rsflight_flights_started_total").increment(leads.len() as u64);
        metrics::counter!("rsflight_flights_joined_total").increment(joins.len() as u64 + repeats);
        tracing::debug!(leads = leads.len(), joins = joins.len(), "registered batch");

        let mut results = HashMap::with_capacity(seen.len());
        if !leads.is_empty() {
            results.extend(self.execute(leads, func).await);
        }
        for (key, rx) in joins {
            let result = await_outcome(rx).await;
            results.insert(key, result);
        }
        results
    }

    /// Like [`work_many`](Self::work_many), but the executor runs on its
    /// own task and each requested key gets a one-slot channel.
    ///
    /// Duplicate keys share one channel while still counting as duplicate
    /// callers. Panic and close semantics are those of
    /// [`work_chan`](Self::work_chan).
    pub fn work_many_chan<F, Fut, E>(
        self: &Arc<Self>,
        keys: Vec<K>,
        func: F,
    ) -> HashMap<K, mpsc::Receiver<FlightResult<V>>>
    where
        K: Send + 'static,
        V: Send + 'static,
        F: FnOnce(Vec<K>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HashMap<K, V>, E>> + Send,
        E: Into<anyhow::Error>,
    {
        self.register_many_chan(keys, func)
            .into_iter()
            .map(|(key, flight)| (key, flight.into_receiver()))
            .collect()
    }

    /// Registration core of the batched channel variant: one channel per
    /// distinct key, executor spawned for the keys this call leads.
    ///
    /// Returns the call record handle alongside each receiver so batched
    /// callers can report a flight's real waiter status if its executor
    /// is dropped before settling.
    pub(crate) fn register_many_chan<F, Fut, E>(
        self: &Arc<Self>,
        keys: Vec<K>,
        func: F,
    ) -> HashMap<K, ChanFlight<V>>
    where
        K: Send + 'static,
        V: Send + 'static,
        F: FnOnce(Vec<K>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HashMap<K, V>, E>> + Send,
        E: Into<anyhow::Error>,
    {
        let mut flights: HashMap<K, ChanFlight<V>> = HashMap::with_capacity(keys.len());
        let mut leads: Vec<(K, Arc<Call<V>>)> = Vec::new();
        let mut joined = 0u64;
        {
            let mut registry = self.registry.lock().unwrap();
            for key in keys {
                // A repeat of a key in the same request shares the first
                // occurrence's channel but still counts as one more
                // waiter.
                if flights.contains_key(&key) {
                    if let Some(call) = registry.get(&key) {
                        call.add_waiter();
                    }
                    joined += 1;
                    continue;
                }
                let (tx, rx) = mpsc::channel(1);
                let call = match registry.entry(key.clone()) {
                    Entry::Occupied(entry) => {
                        entry.get().join_chan(tx);
                        joined += 1;
                        Arc::clone(entry.get())
                    }
                    Entry::Vacant(entry) => {
                        let call = Arc::new(Call::new());
                        call.attach_chan(tx);
                        entry.insert(Arc::clone(&call));
                        leads.push((key.clone(), Arc::clone(&call)));
                        call
                    }
                };
                flights.insert(key, ChanFlight { rx, call });
            }
        }
        metrics::counter!("rsflight_flights_started_total").increment(leads.len() as u64);
        metrics::counter!("rsflight_flights_joined_total").increment(joined);

        if !leads.is_empty() {
            let group = Arc::clone(self);
            tokio::spawn(async move {
                group.execute(leads, func).await;
            });
        }
        flights
    }

    /// Drops the in-flight record for `key`, if any.
    ///
    /// Callers already attached to the record keep it and still receive
    /// its outcome; the next caller for `key` starts a fresh flight
    /// instead of joining the forgotten one. Never blocks on the flight
    /// and never completes it.
    pub fn forget(&self, key: &K) {
        let mut registry = self.registry.lock().unwrap();
        if registry.remove(key).is_some() {
            tracing::debug!("forgot in-flight key");
        }
    }

    /// [`forget`](Self::forget) for many keys under one registry lock.
    pub fn forget_many(&self, keys: &[K]) {
        let mut registry = self.registry.lock().unwrap();
        for key in keys {
            registry.remove(key);
        }
    }

    /// Number of keys currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Runs the work function for the flights this executor leads and
    /// fans the outcome out.
    ///
    /// The registry mutex is never held while the work function runs. The
    /// inner `catch_unwind` captures panics; the completion guard armed
    /// around it observes the third termination mode (the executing
    /// future dropped without an outcome) and settles the records as
    /// abandoned.
    async fn execute<F, Fut, E>(
        &self,
        flights: Vec<(K, Arc<Call<V>>)>,
        func: F,
    ) -> HashMap<K, FlightResult<V>>
    where
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = Result<HashMap<K, V>, E>>,
        E: Into<anyhow::Error>,
    {
        let keys: Vec<K> = flights.iter().map(|(key, _)| key.clone()).collect();
        let guard = CompletionGuard::new(&self.registry, flights);

        let work = AssertUnwindSafe(async move { func(keys).await });
        let verdict = match work.catch_unwind().await {
            Ok(Ok(values)) => Verdict::Settled { values, err: None },
            Ok(Err(err)) => Verdict::Settled {
                values: HashMap::new(),
                err: Some(FlightError::work(err)),
            },
            Err(payload) => Verdict::Panicked(PanicPayload::capture(payload)),
        };

        match guard.settle(verdict) {
            Completion::Results(results) => results,
            // Re-raise only after the registry mutex is released.
            Completion::Panicked(payload) => payload.resume(),
        }
    }
}

/// One caller's channel-delivered attachment to a flight.
///
/// Keeps the call record handle so abandonment can be reported with the
/// waiter status the record actually accumulated.
pub(crate) struct ChanFlight<V> {
    rx: mpsc::Receiver<FlightResult<V>>,
    call: Arc<Call<V>>,
}

impl<V: Clone> ChanFlight<V> {
    pub(crate) fn into_receiver(self) -> mpsc::Receiver<FlightResult<V>> {
        self.rx
    }

    /// Waits for the outcome. A closed channel means the executor was
    /// dropped before settling.
    pub(crate) async fn recv(mut self) -> FlightResult<V> {
        match self.rx.recv().await {
            Some(result) => result,
            None => FlightResult::abandoned(self.call.shared()),
        }
    }
}

async fn await_outcome<V: Clone>(mut rx: broadcast::Receiver<Outcome<V>>) -> FlightResult<V> {
    match rx.recv().await {
        Ok(Outcome::Settled(result)) => result,
        Ok(Outcome::Panicked(payload)) => payload.resume(),
        // A synchronous joiner is a duplicate by definition, so an
        // abandoned flight still reports shared = true.
        Ok(Outcome::Abandoned) | Err(_) => FlightResult::abandoned(true),
    }
}

/// Registers descriptions for the group's metrics.
///
/// Optional; call once during application startup to give the counters
/// documentation in whatever backs the `metrics` recorder.
pub fn register_flight_metrics() {
    metrics::describe_counter!(
        "rsflight_flights_started_total",
        "Total number of flights started (leader executions)"
    );
    metrics::describe_counter!(
        "rsflight_flights_joined_total",
        "Total number of callers that joined an already in-flight call"
    );
    metrics::describe_counter!(
        "rsflight_flights_abandoned_total",
        "Total number of flights whose executor was dropped before settling"
    );
    metrics::describe_counter!(
        "rsflight_flights_panicked_total",
        "Total number of flights whose work function panicked"
    );
}
