use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error};

type Flight<T> = Shared<BoxFuture<'static, Option<T>>>;

struct Slot<T> {
    next_id: u64,
    current: Option<(u64, Flight<T>)>,
}

/// Collapses concurrent requests for the same operation into one execution.
///
/// The first caller starts the operation on its own task; everyone who
/// arrives while it is running awaits the same outcome. The operation runs to
/// completion even if every caller goes away.
pub struct SingleFlight<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                next_id: 0,
                current: None,
            })),
        }
    }

    /// Join the operation in flight, or start `operation` if there is none.
    ///
    /// Returns `None` if the operation panicked.
    pub async fn run<F, Fut>(&self, operation: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.join_or_start(operation).await
    }

    pub fn in_flight(&self) -> bool {
        lock(&self.slot).current.is_some()
    }

    fn join_or_start<F, Fut>(&self, operation: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some((id, flight)) = slot.current.as_ref() {
            debug!(flight = *id, "Joining operation in flight");
            return flight.clone();
        }

        let id = slot.next_id;
        slot.next_id += 1;

        // The slot is released by the task itself so a finished flight is never
        // joined, whether or not anyone is still awaiting it.
        let release = Arc::clone(&self.slot);
        let operation = operation();
        let handle = tokio::spawn(async move {
            let outcome = operation.await;
            release_slot(&release, id);
            outcome
        });

        let release = Arc::clone(&self.slot);
        let flight = async move {
            match handle.await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(flight = id, error = %e, "Single-flight operation failed to complete");
                    release_slot(&release, id);
                    None
                }
            }
        }
        .boxed()
        .shared();

        slot.current = Some((id, flight.clone()));
        debug!(flight = id, "Started operation");
        flight
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(slot: &Mutex<Slot<T>>) -> MutexGuard<'_, Slot<T>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn release_slot<T>(slot: &Mutex<Slot<T>>, id: u64) {
    let mut slot = lock(slot);
    if slot.current.as_ref().is_some_and(|(current, _)| *current == id) {
        slot.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            async move {
                flight
                    .run(move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == Some(42)));
        assert!(!flight.in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_start_fresh_flights() {
        let flight = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let runs = Arc::clone(&runs);
            let seen = flight
                .run(move || async move { runs.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(seen, Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_outlives_abandoned_caller() {
        let flight = Arc::new(SingleFlight::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&finished);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            flight.run(move || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                "late"
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(flight.in_flight());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight());
    }

    async fn explode() -> u8 {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_operation_yields_none() {
        let flight: SingleFlight<u8> = SingleFlight::new();
        assert_eq!(flight.run(explode).await, None);
        assert!(!flight.in_flight());
        assert_eq!(flight.run(|| async { 7 }).await, Some(7));
    }
}
