//! Call records and the executor's completion protocol.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};

use crate::error::{FlightError, PanicPayload};

use super::types::FlightResult;

/// What a finished flight broadcasts to callers that joined while it ran.
#[derive(Debug, Clone)]
pub(crate) enum Outcome<V> {
    /// The work function terminated, normally or with a user error.
    Settled(FlightResult<V>),
    /// The work function panicked; each waiter re-raises on its own task.
    Panicked(PanicPayload),
    /// The executing task was dropped before recording any outcome.
    Abandoned,
}

/// One in-flight execution for a key.
///
/// The waiter count and the attached delivery channels are guarded by the
/// owning group's registry mutex; the completion broadcast fires exactly
/// once, after which nothing on the record mutates.
pub(crate) struct Call<V> {
    /// Duplicate callers that joined after registration. The registrant
    /// is not counted; the first duplicate makes this 1.
    waiters: AtomicUsize,
    /// One-slot sinks for channel-delivered callers.
    chans: Mutex<Vec<mpsc::Sender<FlightResult<V>>>>,
    /// Completion broadcast subscribed by synchronous joiners.
    done: broadcast::Sender<Outcome<V>>,
}

impl<V: Clone> Call<V> {
    pub(crate) fn new() -> Self {
        let (done, _) = broadcast::channel(1);
        Self {
            waiters: AtomicUsize::new(0),
            chans: Mutex::new(Vec::new()),
            done,
        }
    }

    /// Counts one more duplicate caller. Requires the registry mutex.
    pub(crate) fn add_waiter(&self) {
        self.waiters.fetch_add(1, Ordering::Relaxed);
    }

    /// Attaches a duplicate synchronous caller. Requires the registry
    /// mutex.
    pub(crate) fn join(&self) -> broadcast::Receiver<Outcome<V>> {
        self.add_waiter();
        self.done.subscribe()
    }

    /// Attaches a duplicate channel-delivered caller. Requires the
    /// registry mutex.
    pub(crate) fn join_chan(&self, tx: mpsc::Sender<FlightResult<V>>) {
        self.add_waiter();
        self.attach_chan(tx);
    }

    /// Attaches a delivery sink without counting a waiter (the
    /// registrant's own channel). Requires the registry mutex.
    pub(crate) fn attach_chan(&self, tx: mpsc::Sender<FlightResult<V>>) {
        self.chans.lock().unwrap().push(tx);
    }

    /// True once at least one duplicate caller attached.
    pub(crate) fn shared(&self) -> bool {
        self.waiters.load(Ordering::Relaxed) > 0
    }
}

/// What the inner protected region concluded about the work function.
pub(crate) enum Verdict<K, V> {
    /// Terminated normally or with a user error shared by every led key.
    Settled {
        values: HashMap<K, V>,
        err: Option<FlightError>,
    },
    /// Panicked with the captured payload.
    Panicked(PanicPayload),
}

/// Result of dispatching a verdict to every attached caller.
pub(crate) enum Completion<K, V> {
    /// Per-key results for the keys this executor led.
    Results(HashMap<K, FlightResult<V>>),
    /// The flight panicked; the executor must re-raise once the registry
    /// mutex is released.
    Panicked(PanicPayload),
}

/// Outer half of the executor's two-stage protection.
///
/// Armed before the work future is first polled, holding every newly
/// registered record. [`settle`](Self::settle) consumes it on the normal
/// and panic paths; if the executing future is dropped instead, `Drop`
/// completes the records as abandoned so attached callers are not
/// stranded. Which of the two ran is exactly the post-hoc distinction
/// between "the function terminated" and "the task terminated".
pub(crate) struct CompletionGuard<'g, K: Eq + Hash, V: Clone> {
    registry: &'g Mutex<HashMap<K, Arc<Call<V>>>>,
    flights: Option<Vec<(K, Arc<Call<V>>)>>,
}

impl<'g, K: Eq + Hash, V: Clone> CompletionGuard<'g, K, V> {
    pub(crate) fn new(
        registry: &'g Mutex<HashMap<K, Arc<Call<V>>>>,
        flights: Vec<(K, Arc<Call<V>>)>,
    ) -> Self {
        Self {
            registry,
            flights: Some(flights),
        }
    }

    /// Completes every led record with the given verdict and fans the
    /// outcome out to attached callers.
    ///
    /// Records are removed from the registry before any caller can
    /// observe the outcome, and only while the registry still points at
    /// this record (`forget` may have replaced it with a fresh flight;
    /// that one is never touched). A panicking flight with delivery
    /// channels attached takes the process down: those callers cannot
    /// re-raise the panic themselves, and swallowing it would strand them
    /// forever.
    pub(crate) fn settle(mut self, verdict: Verdict<K, V>) -> Completion<K, V> {
        let flights = self
            .flights
            .take()
            .expect("completion guard settles at most once");
        let mut registry = self.registry.lock().unwrap();

        match verdict {
            Verdict::Panicked(payload) => {
                metrics::counter!("rsflight_flights_panicked_total")
                    .increment(flights.len() as u64);
                tracing::error!(
                    panic = %payload.message(),
                    flights = flights.len(),
                    "work function panicked"
                );

                for (key, call) in &flights {
                    Self::remove_current(&mut registry, key, call);
                }
                if flights
                    .iter()
                    .any(|(_, call)| !call.chans.lock().unwrap().is_empty())
                {
                    drop(registry);
                    payload.crash();
                }
                for (_, call) in &flights {
                    let _ = call.done.send(Outcome::Panicked(payload.clone()));
                }
                Completion::Panicked(payload)
            }
            Verdict::Settled { mut values, err } => {
                let mut results = HashMap::with_capacity(flights.len());
                for (key, call) in flights {
                    Self::remove_current(&mut registry, &key, &call);
                    let result = FlightResult {
                        value: values.remove(&key),
                        err: err.clone(),
                        shared: call.shared(),
                    };
                    for tx in call.chans.lock().unwrap().drain(..) {
                        // One-slot channel, single send; an error here only
                        // means the caller dropped its receiver.
                        let _ = tx.try_send(result.clone());
                    }
                    let _ = call.done.send(Outcome::Settled(result.clone()));
                    results.insert(key, result);
                }
                Completion::Results(results)
            }
        }
    }

    fn remove_current(registry: &mut HashMap<K, Arc<Call<V>>>, key: &K, call: &Arc<Call<V>>) {
        if registry.get(key).is_some_and(|current| Arc::ptr_eq(current, call)) {
            registry.remove(key);
        }
    }
}

impl<K: Eq + Hash, V: Clone> Drop for CompletionGuard<'_, K, V> {
    fn drop(&mut self) {
        let Some(flights) = self.flights.take() else {
            return;
        };
        // Completion must run even mid-unwind; a poisoned registry must
        // not turn cancellation into a second panic.
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        metrics::counter!("rsflight_flights_abandoned_total").increment(flights.len() as u64);
        tracing::warn!(flights = flights.len(), "flight abandoned before completion");

        for (key, call) in &flights {
            Self::remove_current(&mut registry, key, call);
            let _ = call.done.send(Outcome::Abandoned);
        }
        // Delivery channels drop with the records without a send; channel
        // waiters observe a closed receiver.
    }
}
