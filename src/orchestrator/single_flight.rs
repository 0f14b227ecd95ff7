use crate::error::AnalysisError;
use crate::pool::DatabaseId;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

type SharedRun<T> = Shared<BoxFuture<'static, Result<T, AnalysisError>>>;

struct Flight<T: Clone> {
    id: u64,
    window: Duration,
    run: SharedRun<T>,
}

enum Next<T: Clone> {
    Lead(SharedRun<T>),
    Join(SharedRun<T>),
    Wait(SharedRun<T>),
}

/// How a caller got its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// Started the run.
    Leader,
    /// Joined a run that was already in flight.
    Follower,
}

/// At most one run per database at a time.
///
/// A run executes on its own task, so it completes (and unregisters) even if
/// every caller waiting on it goes away. Callers asking for the same window
/// share the run's result; callers asking for another window wait for it to
/// finish and then start their own.
pub struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<HashMap<DatabaseId, Flight<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start()` for `database`, or join the run already in flight.
    ///
    /// # Errors
    ///
    /// Returns the run's error, shared with every joined caller, or
    /// [`AnalysisError::Internal`] if the run's task panicked.
    pub async fn run<F, Fut>(
        &self,
        database: &DatabaseId,
        window: Duration,
        start: F,
    ) -> (Result<T, AnalysisError>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AnalysisError>> + Send + 'static,
    {
        let mut start = Some(start);

        loop {
            let next = {
                let mut inflight = self.inflight.lock();

                match inflight.get(database) {
                    Some(flight) if flight.window == window => Next::Join(flight.run.clone()),
                    Some(flight) => Next::Wait(flight.run.clone()),
                    None => {
                        let Some(start) = start.take() else {
                            return (
                                Err(AnalysisError::Internal("run started twice".to_string())),
                                FlightRole::Leader,
                            );
                        };
                        Next::Lead(self.launch(&mut inflight, database, window, start()))
                    }
                }
            };

            match next {
                Next::Lead(run) => return (run.await, FlightRole::Leader),
                Next::Join(run) => {
                    debug!(database = %database, "joined in-flight run");
                    return (run.await, FlightRole::Follower);
                }
                Next::Wait(busy) => {
                    debug!(database = %database, "waiting for in-flight run with another window");
                    let _ = busy.await;
                }
            }
        }
    }

    /// Number of runs currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn launch<Fut>(
        &self,
        inflight: &mut HashMap<DatabaseId, Flight<T>>,
        database: &DatabaseId,
        window: Duration,
        fut: Fut,
    ) -> SharedRun<T>
    where
        Fut: Future<Output = Result<T, AnalysisError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.inflight);
        let key = database.clone();

        // The entry is inserted before this lock is released, so the task
        // cannot unregister ahead of registration.
        let task = tokio::spawn(async move {
            let result = fut.await;
            let mut inflight = registry.lock();
            if inflight.get(&key).is_some_and(|f| f.id == id) {
                inflight.remove(&key);
            }
            result
        });

        let run: SharedRun<T> = async move {
            task.await
                .unwrap_or_else(|e| Err(AnalysisError::Internal(format!("analysis task failed: {e}"))))
        }
        .boxed()
        .shared();

        inflight.insert(
            database.clone(),
            Flight {
                id,
                window,
                run: run.clone(),
            },
        );

        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn db() -> DatabaseId {
        DatabaseId::from("orders")
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_window_joins() {
        let flights = Arc::new(SingleFlight::<Arc<u32>>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flights
                    .run(&db(), Duration::from_secs(60), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Arc::new(7))
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            let (result, role) = handle.await.unwrap_or_else(|e| panic!("{e}"));
            results.push((result.unwrap_or_else(|e| panic!("{e}")), role));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|(r, _)| Arc::ptr_eq(r, &results[0].0)));
        assert_eq!(
            results.iter().filter(|(_, role)| *role == FlightRole::Leader).count(),
            1
        );
        assert!(flights.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_window_runs_after() {
        let flights = Arc::new(SingleFlight::<u64>::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let flights = Arc::clone(&flights);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                flights
                    .run(&db(), Duration::from_secs(60), move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        order.lock().push(60);
                        Ok(60)
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;

        let order2 = Arc::clone(&order);
        let (second, role) = flights
            .run(&db(), Duration::from_secs(300), move || async move {
                order2.lock().push(300);
                Ok(300)
            })
            .await;

        assert_eq!(second.ok(), Some(300));
        assert_eq!(role, FlightRole::Leader);
        let (first, _) = first.await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(first.ok(), Some(60));
        assert_eq!(*order.lock(), vec![60, 300]);
    }

    #[tokio::test]
    async fn test_error_shared_and_entry_cleared() {
        let flights = SingleFlight::<u32>::new();
        let (result, _) = flights
            .run(&db(), Duration::from_secs(60), || async {
                Err(AnalysisError::UnknownDatabase("orders".to_string()))
            })
            .await;

        assert!(matches!(result, Err(AnalysisError::UnknownDatabase(_))));

        let (retry, role) = flights
            .run(&db(), Duration::from_secs(60), || async { Ok(1) })
            .await;
        assert_eq!(retry.ok(), Some(1));
        assert_eq!(role, FlightRole::Leader);
    }
}
