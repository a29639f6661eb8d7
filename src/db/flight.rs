//! Per-key call coalescing.
//!
//! Concurrent callers that pass the same key to [`SingleFlight::run`] share a
//! single execution of the work and all observe its result. The work runs on
//! its own task, so it completes even when every caller that was waiting on
//! it has gone away. Once the call finishes the key is forgotten, so a
//! failure is never cached: the next call for that key runs the work again.

use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// `None` until the work has produced its result.
type Outcome = Option<DbResult<()>>;
type Calls = Arc<Mutex<HashMap<String, watch::Receiver<Outcome>>>>;

#[derive(Debug, Default)]
pub struct SingleFlight {
    calls: Calls,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_calls(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<Outcome>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `work` for `key` unless a call for the same key is in flight, in
    /// which case wait for that call and return its result.
    ///
    /// `work` is spawned onto the runtime; dropping the returned future only
    /// stops waiting for it.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> DbResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        let mut outcome = {
            let mut calls = self.lock_calls();
            match calls.get(key) {
                Some(outcome) => outcome.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx.clone());

                    let forget = ForgetOnDrop {
                        calls: Arc::clone(&self.calls),
                        key: key.to_string(),
                        outcome: rx.clone(),
                    };
                    let work = work();
                    tokio::spawn(async move {
                        let result = work.await;
                        // Forget the key before publishing so a caller that
                        // sees the result and misses again starts afresh
                        drop(forget);
                        // Nobody may be waiting any more
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        match outcome.wait_for(Option::is_some).await {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| Err(DbError::internal("flight finished without a result"))),
            Err(_) => Err(DbError::internal(format!(
                "work for '{}' ended without a result",
                key
            ))),
        }
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.lock_calls().len()
    }
}

/// Removes a finished call from the map, including when its work panicked.
struct ForgetOnDrop {
    calls: Calls,
    key: String,
    outcome: watch::Receiver<Outcome>,
}

impl Drop for ForgetOnDrop {
    fn drop(&mut self) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls
            .get(&self.key)
            .is_some_and(|current| current.same_channel(&self.outcome))
        {
            calls.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counted_work(
        runs: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = DbResult<()>> + Send>> + use<> {
        let runs = Arc::clone(runs);
        move || {
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let work = counted_work(&runs, Duration::from_millis(50));
            handles.push(tokio::spawn(async move { flight.run("demoa", work).await }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_reaches_waiters_and_is_not_cached() {
        let flight = Arc::new(SingleFlight::new());

        let first = flight
            .run("demoa", || async { Err(DbError::connection("refused", "retry")) })
            .await;
        assert!(matches!(first, Err(DbError::Connection { .. })));
        assert_eq!(flight.in_flight(), 0);

        let second = flight.run("demoa", || async { Ok(()) }).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flight = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            flight
                .run(key, counted_work(&runs, Duration::ZERO))
                .await
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_abandoned_leader_does_not_restart_work() {
        let flight = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            flight.run("demoa", counted_work(&runs, Duration::from_millis(100))),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(flight.in_flight(), 1);

        // Joins the call the first caller started instead of running again
        let joined = flight
            .run("demoa", counted_work(&runs, Duration::from_millis(100)))
            .await;
        assert!(joined.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_work_is_reported_and_forgotten() {
        let flight = SingleFlight::new();

        async fn explode() -> DbResult<()> {
            panic!("open blew up")
        }

        let result = flight.run("demoa", explode).await;
        assert!(matches!(result, Err(DbError::Internal { .. })));
        assert_eq!(flight.in_flight(), 0);

        assert!(flight.run("demoa", || async { Ok(()) }).await.is_ok());
    }
}
