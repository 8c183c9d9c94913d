//! Per-key request coalescing.
//!
//! [`SingleFlight::run`] collapses concurrent calls for the same key into one
//! execution of the supplied future. Every caller receives a clone of the same
//! outcome, success or failure.
//!
//! # Cancellation
//!
//! Waiters hold strong [`Shared`] handles; the registry only keeps a
//! [`WeakShared`]. The underlying future therefore lives exactly as long as
//! at least one waiter is still awaiting it: when the last waiter is dropped
//! (client disconnect, timeout), the upstream call is dropped with it. A
//! caller arriving after that starts a fresh flight.

use std::future::Future;
use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use tracing::trace;

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;
type WeakFlight<V, E> = WeakShared<BoxFuture<'static, Result<V, E>>>;

/// Registry of in-flight upstream calls keyed by `K`.
pub struct SingleFlight<K, V, E>
where
    K: Eq + Hash,
{
    inflight: DashMap<K, WeakFlight<V, E>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `start()` for `key` unless a flight for `key` is already running,
    /// in which case await that one instead.
    ///
    /// `start` is only invoked by the caller that opens a new flight; it must
    /// build the future lazily and do no work before being polled.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let flight = match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                if let Some(running) = slot.get().upgrade() {
                    trace!("joining in-flight call");
                    running
                } else {
                    let flight = start().boxed().shared();
                    if let Some(weak) = flight.downgrade() {
                        slot.insert(weak);
                    }
                    flight
                }
            }
            Entry::Vacant(slot) => {
                let flight = start().boxed().shared();
                if let Some(weak) = flight.downgrade() {
                    slot.insert(weak);
                }
                flight
            }
        };

        let guard = Waiter {
            registry: &self.inflight,
            key,
            flight: Some(flight.clone()),
        };
        let outcome = flight.await;
        drop(guard);
        outcome
    }

    /// Number of keys with a live flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count()
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Drops the waiter's strong handle and clears the registry slot once no
/// waiter is left, whether the waiter finished or was cancelled.
struct Waiter<'a, K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
{
    registry: &'a DashMap<K, WeakFlight<V, E>>,
    key: K,
    flight: Option<Flight<V, E>>,
}

impl<K, V, E> Drop for Waiter<'_, K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
{
    fn drop(&mut self) {
        drop(self.flight.take());
        self.registry
            .remove_if(&self.key, |_, weak| weak.upgrade().is_none());
    }
}
