// Cluster-wide named mutex

//! # Mutex Service
//!
//! A mutex is a named row in the state store whose state is READY or LOCKED.
//! Acquiring is a conditional READY → LOCKED update; when it fails somebody
//! else holds the section and the caller skips it. Nothing here ever waits.
//!
//! [`MutexService::with_mutex`] is the scoped form: acquire, run the body,
//! release on every exit path, including an error return or a panic.
//!
//! ## Rust Learning Notes:
//!
//! ### Catching Panics in Async Code
//! `FutureExt::catch_unwind` turns a panic inside the polled future into an
//! `Err` we can inspect. The body is wrapped in `AssertUnwindSafe` because we
//! never look at its state after a panic; we only release the lock and
//! resume unwinding.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::storage::StateStore;
use crate::models::MutexState;
use crate::Result;

#[derive(Clone)]
pub struct MutexService {
    store: Arc<dyn StateStore>,
}

impl MutexService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock. `false` means it is held elsewhere.
    pub async fn try_acquire(&self, name: &str) -> Result<bool> {
        let acquired = self.store.try_lock_mutex(name).await?;
        if acquired {
            debug!(mutex = %name, "Acquired mutex");
        }
        Ok(acquired)
    }

    pub async fn release(&self, name: &str) -> Result<()> {
        self.store.unlock_mutex(name).await?;
        debug!(mutex = %name, "Released mutex");
        Ok(())
    }

    /// Release a lock regardless of who holds it
    pub async fn force_release(&self, name: &str) -> Result<Option<MutexState>> {
        let previous = self.state(name).await?;
        if previous == Some(MutexState::Locked) {
            warn!(mutex = %name, "Force-releasing a held mutex");
        }
        self.store.unlock_mutex(name).await?;
        Ok(previous)
    }

    pub async fn state(&self, name: &str) -> Result<Option<MutexState>> {
        Ok(self.store.get_mutex(name).await?.map(|record| record.state))
    }

    /// Run `body` while holding `name`.
    ///
    /// Returns `Ok(None)` without running the body when the mutex is held
    /// elsewhere.
    pub async fn with_mutex<T, F, Fut>(&self, name: &str, body: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire(name).await? {
            debug!(mutex = %name, "Mutex held elsewhere, skipping");
            return Ok(None);
        }

        let outcome = AssertUnwindSafe(async move { body().await })
            .catch_unwind()
            .await;
        let released = self.release(name).await;

        match outcome {
            Ok(Ok(value)) => {
                released?;
                Ok(Some(value))
            }
            Ok(Err(e)) => {
                if let Err(release_err) = released {
                    error!(mutex = %name, "Failed to release mutex after error: {}", release_err);
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(release_err) = released {
                    error!(mutex = %name, "Failed to release mutex after panic: {}", release_err);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStateStore;
    use crate::models::Mutexes;
    use crate::SchedulerError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> MutexService {
        MutexService::new(Arc::new(InMemoryStateStore::new()))
    }

    #[tokio::test]
    async fn test_only_one_concurrent_acquirer_wins() {
        let mutex = service();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let mutex = mutex.clone();
            handles.push(tokio::spawn(async move {
                mutex.try_acquire(Mutexes::START_ENGINE_TASK).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_held_mutex_skips_body() {
        let mutex = service();
        assert!(mutex.try_acquire("m").await.unwrap());

        let ran = AtomicUsize::new(0);
        let result = mutex
            .with_mutex("m", || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(mutex.state("m").await.unwrap(), Some(MutexState::Locked));
    }

    #[tokio::test]
    async fn test_release_after_success() {
        let mutex = service();
        let value = mutex.with_mutex("m", || async { Ok(42) }).await.unwrap();
        assert_eq!(value, Some(42));
        assert_eq!(mutex.state("m").await.unwrap(), Some(MutexState::Ready));
    }

    #[tokio::test]
    async fn test_release_after_error() {
        let mutex = service();
        let result: Result<Option<()>> = mutex
            .with_mutex("m", || async { Err(SchedulerError::Internal("boom".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(mutex.state("m").await.unwrap(), Some(MutexState::Ready));
    }

    #[tokio::test]
    async fn test_release_after_panic() {
        let mutex = service();
        let guarded = mutex.clone();
        let join = tokio::spawn(async move {
            guarded
                .with_mutex("m", || async {
                    if true {
                        panic!("engine exploded");
                    }
                    Ok(())
                })
                .await
        })
        .await;

        assert!(join.unwrap_err().is_panic());
        assert_eq!(mutex.state("m").await.unwrap(), Some(MutexState::Ready));
    }

    #[tokio::test]
    async fn test_force_release_reports_previous_state() {
        let mutex = service();
        mutex.try_acquire(Mutexes::SCALE_DOWN).await.unwrap();

        let previous = mutex.force_release(Mutexes::SCALE_DOWN).await.unwrap();
        assert_eq!(previous, Some(MutexState::Locked));
        assert!(mutex.try_acquire(Mutexes::SCALE_DOWN).await.unwrap());
    }
}
