//! Single-flight coalescing.
//!
//! Concurrent callers asking for the same key share one in-flight future
//! instead of each running it. The first caller's future is stored in a
//! DashMap as a [`Shared`] handle; later callers clone and await it.
//!
//! Every flight is also driven by a spawned task, so it runs to completion
//! and clears its slot even when every caller has gone away (a client that
//! disconnects mid-resolution still leaves its result cached).

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

type Flight<V> = Shared<BoxFuture<'static, V>>;

pub struct FlightGroup<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    flights: Arc<DashMap<K, Flight<V>>>,
}

impl<K, V> FlightGroup<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Run `start()` for `key` unless a flight for it is already running,
    /// in which case wait for that flight's result instead.
    ///
    /// The flight runs on its own task: dropping this future only stops
    /// waiting, the work itself completes and its slot is cleared.
    /// Must be called from within a Tokio runtime.
    pub async fn run<F>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        let (flight, started) = match self.flights.entry(key.clone()) {
            Entry::Occupied(slot) => {
                debug!("Joining in-flight resolution for {}", key);
                (slot.get().clone(), false)
            }
            Entry::Vacant(slot) => (slot.insert(start().shared()).clone(), true),
        };

        if started {
            self.drive(key.clone(), flight.clone());
        }

        let value = flight.clone().await;
        self.flights.remove_if(&key, |_, current| current.ptr_eq(&flight));
        value
    }

    /// Poll `flight` to completion on a background task, then clear its slot
    /// unless a newer flight already took it over.
    fn drive(&self, key: K, flight: Flight<V>) {
        let flights = self.flights.clone();
        tokio::spawn(async move {
            flight.clone().await;
            flights.remove_if(&key, |_, current| current.ptr_eq(&flight));
        });
    }

    /// Number of keys with a flight currently registered
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<K, V> Default for FlightGroup<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let group: Arc<FlightGroup<String, u32>> = Arc::new(FlightGroup::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("song".to_string(), move || {
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            7
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let group: FlightGroup<String, u32> = FlightGroup::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            group
                .run("song".to_string(), move || {
                    async move { runs.fetch_add(1, Ordering::SeqCst) as u32 }.boxed()
                })
                .await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let group: FlightGroup<String, String> = FlightGroup::new();
        let a = group.run("a".to_string(), || async { "A".to_string() }.boxed());
        let b = group.run("b".to_string(), || async { "B".to_string() }.boxed());
        let (a, b) = tokio::join!(a, b);
        assert_eq!((a.as_str(), b.as_str()), ("A", "B"));
    }

    #[tokio::test]
    async fn abandoned_flight_still_completes_and_clears_its_slot() {
        let group: Arc<FlightGroup<String, u32>> = Arc::new(FlightGroup::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let caller = {
            let group = group.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                group
                    .run("song".to_string(), move || {
                        async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            finished.fetch_add(1, Ordering::SeqCst);
                            7
                        }
                        .boxed()
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(group.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn caller_after_abandoned_flight_joins_it() {
        let group: Arc<FlightGroup<String, u32>> = Arc::new(FlightGroup::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let start = |runs: Arc<AtomicUsize>| {
            move || {
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    7
                }
                .boxed()
            }
        };

        let first = {
            let group = group.clone();
            let start = start(runs.clone());
            tokio::spawn(async move { group.run("song".to_string(), start).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let value = group.run("song".to_string(), start(runs.clone())).await;
        assert_eq!(value, 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
