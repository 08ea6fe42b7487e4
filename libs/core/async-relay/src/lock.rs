//! Distributed lock
//!
//! "Run at most once across all instances" for scheduled jobs. A lock is the key
//! `lock:{name}` holding a unique holder id, created with set-if-absent and a TTL.
//!
//! - Release is holder-checked (compare-and-delete), so an expired holder can never
//!   delete a lock that somebody else has since taken.
//! - While the guarded job runs, the holder renews the lease every `ttl / 3`.
//! - If the holder process dies, the TTL frees the lock.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::resilience::Resilience;
use crate::store::KeyValueStore;

pub const LOCK_KEY_PREFIX: &str = "lock:";

pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, name)
}

/// Result of [`DistributedLock::run_exclusive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// This caller held the lock and ran the job
    Executed(T),
    /// Another holder has the lock; the job did not run
    Busy,
}

impl<T> LockOutcome<T> {
    pub fn is_busy(&self) -> bool {
        matches!(self, LockOutcome::Busy)
    }

    pub fn executed(self) -> Option<T> {
        match self {
            LockOutcome::Executed(value) => Some(value),
            LockOutcome::Busy => None,
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    resilience: Resilience,
    instance_id: String,
    renewal: bool,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        resilience: Resilience,
        instance_id: impl Into<String>,
        config: &LockConfig,
    ) -> Self {
        Self {
            store,
            resilience,
            instance_id: instance_id.into(),
            renewal: config.renewal,
        }
    }

    /// Try once to take the lock. `None` when it is held elsewhere.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>, RelayError> {
        let key = lock_key(name);
        let holder = format!("{}:{}", self.instance_id, Uuid::new_v4());

        let acquired = self
            .resilience
            .execute_with_retry("acquire_lock", || {
                self.store.acquire_if_absent(&key, &holder, ttl)
            })
            .await
            .map_err(|e| RelayError::infrastructure("acquire lock", e))?;

        if !acquired {
            RelayMetrics::lock_outcome(name, "busy");
            debug!(lock = %name, "Lock held elsewhere");
            return Ok(None);
        }

        RelayMetrics::lock_outcome(name, "acquired");
        debug!(lock = %name, holder = %holder, ttl_ms = ttl.as_millis() as u64, "Lock acquired");

        let renewal = self
            .renewal
            .then(|| spawn_renewal(self.store.clone(), key.clone(), holder.clone(), ttl));

        Ok(Some(LockGuard {
            store: self.store.clone(),
            resilience: self.resilience.clone(),
            key,
            holder,
            renewal,
            released: false,
        }))
    }

    pub async fn is_locked(&self, name: &str) -> Result<bool, RelayError> {
        let key = lock_key(name);
        self.resilience
            .execute_with_retry("lock_exists", || self.store.exists(&key))
            .await
            .map_err(|e| RelayError::infrastructure("check lock", e))
    }

    /// Run `job` only if this caller can take the lock; otherwise return `Busy`
    /// without waiting.
    ///
    /// The lock is released on every exit: normal return, panic (which is then
    /// resumed), and cancellation of this future (release runs on a spawned task).
    pub async fn run_exclusive<T, F, Fut>(
        &self,
        name: &str,
        ttl: Duration,
        job: F,
    ) -> Result<LockOutcome<T>, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(guard) = self.try_acquire(name, ttl).await? else {
            return Ok(LockOutcome::Busy);
        };

        let outcome = AssertUnwindSafe(job()).catch_unwind().await;

        if let Err(e) = guard.release().await {
            warn!(lock = %name, error = %e, "Failed to release lock, it will expire");
        }

        match outcome {
            Ok(value) => Ok(LockOutcome::Executed(value)),
            Err(panic) => {
                warn!(lock = %name, "Job panicked while holding the lock");
                std::panic::resume_unwind(panic)
            }
        }
    }
}

fn spawn_renewal(
    store: Arc<dyn KeyValueStore>,
    key: String,
    holder: String,
    ttl: Duration,
) -> JoinHandle<()> {
    let period = (ttl / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            match store.expire_if_value(&key, &holder, ttl).await {
                Ok(true) => debug!(lock = %key, "Lock lease renewed"),
                Ok(false) => {
                    warn!(lock = %key, holder = %holder, "Lock lost before renewal");
                    break;
                }
                Err(e) => warn!(lock = %key, error = %e, "Lock renewal failed"),
            }
        }
    })
}

/// A held lock. Release it with [`LockGuard::release`]; dropping it releases in
/// the background.
pub struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    resilience: Resilience,
    key: String,
    holder: String,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Holder-checked release. `false` if the lock had already expired or changed hands.
    pub async fn release(mut self) -> Result<bool, RelayError> {
        self.stop_renewal();
        self.released = true;

        let removed = self
            .resilience
            .execute_with_retry("release_lock", || {
                self.store.delete_if_value(&self.key, &self.holder)
            })
            .await
            .map_err(|e| RelayError::infrastructure("release lock", e))?;

        if removed {
            debug!(lock = %self.key, "Lock released");
        } else {
            info!(lock = %self.key, holder = %self.holder, "Lock was no longer ours at release");
        }
        Ok(removed)
    }

    fn stop_renewal(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_renewal();
        if self.released {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.key, "No runtime to release lock, leaving it to expire");
            return;
        };

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move {
            match store.delete_if_value(&key, &holder).await {
                Ok(_) => debug!(lock = %key, "Lock released after guard drop"),
                Err(e) => warn!(lock = %key, error = %e, "Background lock release failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lock_with(store: Arc<MemoryStore>, renewal: bool) -> DistributedLock {
        DistributedLock::new(
            store,
            Resilience::new("store", RetryPolicy::none()),
            "test-instance",
            &LockConfig { renewal },
        )
    }

    #[tokio::test]
    async fn test_busy_while_held_and_free_after_release() {
        let lock = lock_with(Arc::new(MemoryStore::new()), false);

        let guard = lock.try_acquire("job", Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(guard.holder().starts_with("test-instance:"));
        assert!(lock.is_locked("job").await.unwrap());

        let outcome = lock
            .run_exclusive("job", Duration::from_secs(5), || async { 1 })
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Busy);

        assert!(guard.release().await.unwrap());
        let outcome = lock
            .run_exclusive("job", Duration::from_secs(5), || async { 2 })
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Executed(2));
        assert!(!lock.is_locked("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_job_errors_are_returned_and_lock_released() {
        let lock = lock_with(Arc::new(MemoryStore::new()), false);

        let outcome = lock
            .run_exclusive("job", Duration::from_secs(5), || async {
                Err::<(), _>("job failed")
            })
            .await
            .unwrap();

        assert_eq!(outcome, LockOutcome::Executed(Err("job failed")));
        assert!(!lock.is_locked("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_panic_releases_lock() {
        let lock = lock_with(Arc::new(MemoryStore::new()), false);

        let task = tokio::spawn({
            let lock = lock.clone();
            async move {
                lock.run_exclusive("job", Duration::from_secs(5), || async {
                    panic!("job blew up");
                })
                .await
            }
        });

        let err = task.await.unwrap_err();
        assert!(err.is_panic());
        assert!(!lock.is_locked("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation_releases_lock() {
        let lock = lock_with(Arc::new(MemoryStore::new()), true);
        let started = Arc::new(tokio::sync::Notify::new());

        let task = tokio::spawn({
            let lock = lock.clone();
            let started = started.clone();
            async move {
                lock.run_exclusive("job", Duration::from_secs(5), || async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                })
                .await
            }
        });

        started.notified().await;
        assert!(lock.is_locked("job").await.unwrap());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_locked("job").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_renewal_outlives_ttl() {
        let lock = lock_with(Arc::new(MemoryStore::new()), true);
        let other = lock_with(Arc::new(MemoryStore::new()), true);
        drop(other);

        let observer = lock.clone();
        let outcome = lock
            .run_exclusive("long-job", Duration::from_millis(300), || async move {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                observer.is_locked("long-job").await.unwrap()
            })
            .await
            .unwrap();

        assert_eq!(outcome, LockOutcome::Executed(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_holder_expires() {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_with(store.clone(), false);

        let guard = lock.try_acquire("job", Duration::from_secs(5)).await.unwrap().unwrap();
        std::mem::forget(guard);

        assert!(lock.try_acquire("job", Duration::from_secs(5)).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(lock.try_acquire("job", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_new_lock() {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_with(store.clone(), false);

        let stale = lock.try_acquire("job", Duration::from_secs(5)).await.unwrap().unwrap();
        // Simulate expiry plus takeover by another instance
        store.delete(&lock_key("job")).await.unwrap();
        let current = lock.try_acquire("job", Duration::from_secs(5)).await.unwrap().unwrap();

        assert!(!stale.release().await.unwrap());
        assert!(lock.is_locked("job").await.unwrap());
        assert!(current.release().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_overlap() {
        let lock = lock_with(Arc::new(MemoryStore::new()), true);
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let lock = lock.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    lock.run_exclusive("job-x", Duration::from_secs(5), || async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap()
                })
            })
            .collect();

        let mut busy = 0;
        for task in tasks {
            if task.await.unwrap().is_busy() {
                busy += 1;
            }
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst) + busy, 16);
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }
}
