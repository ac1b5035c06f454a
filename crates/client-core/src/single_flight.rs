//! Keyed single-flight: concurrent requests for the same key share one
//! underlying operation and all observe its output.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type Flight<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<K, T>
where
    T: Clone,
{
    in_flight: Mutex<HashMap<K, (u64, Flight<T>)>>,
    generation: AtomicU64,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { in_flight: Mutex::new(HashMap::new()), generation: AtomicU64::new(0) }
    }

    /// Run `make()` for `key`, or attach to the run already in progress
    ///
    /// `make` is only invoked by the caller that starts a new flight. The
    /// slot is cleared once the flight resolves, so the next call after
    /// completion starts fresh.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (generation, flight) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some((generation, flight)) => (*generation, flight.clone()),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let flight = make().boxed().shared();
                    in_flight.insert(key.clone(), (generation, flight.clone()));
                    (generation, flight)
                }
            }
        };

        let output = flight.await;

        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&key).is_some_and(|(current, _)| *current == generation) {
            in_flight.remove(&key);
        }
        output
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_run() {
        let flights: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                flights
                    .run("token", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();
        assert_eq!(flights.run(1, || async { 1 }).await, 1);
        assert_eq!(flights.run(1, || async { 2 }).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let flights: Arc<SingleFlight<String, String>> = Arc::new(SingleFlight::new());
        let a = flights.run("a".to_string(), || async { "a".to_string() });
        let b = flights.run("b".to_string(), || async { "b".to_string() });
        let (a, b) = tokio::join!(a, b);
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_shared_too() {
        let flights: Arc<SingleFlight<(), Result<u8, String>>> = Arc::new(SingleFlight::new());
        let first = flights.run((), || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err("offline".to_string())
        });
        let second = flights.run((), || async { Ok(1) });
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Err("offline".to_string()));
        assert_eq!(second, Err("offline".to_string()));
    }
}
