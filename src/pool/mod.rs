//! Keyed, bounded-concurrency task pool with shutdown draining.
//!
//! Knows nothing about meetings. A unit of work is admitted under a unique
//! key and runs once a concurrency slot frees up; a key cannot be admitted
//! again until its previous unit has settled. After [`TaskPool::request_shutdown`]
//! no new work is admitted, deferred work is dropped, and in-flight work is
//! allowed to finish. [`TaskPool::wait_for_completion`] blocks until it has.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("work already pending or running for key {0}")]
    DuplicateKey(String),
    #[error("task pool is shutting down")]
    ShuttingDown,
}

/// Admission state of a key.
enum Slot {
    /// Waiting for its start time; the token cancels the timer.
    Deferred(CancellationToken),
    /// Waiting for a permit or running.
    Active,
}

struct Inner<K> {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    slots: Mutex<HashMap<K, Slot>>,
    shutdown: AtomicBool,
    shutdown_token: CancellationToken,
    /// Signalled whenever the last admitted key is released.
    idle: Notify,
    running: AtomicUsize,
}

impl<K> Inner<K> {
    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable handle; clones share the same pool.
pub struct TaskPool<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for TaskPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> TaskPool<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                slots: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
                idle: Notify::new(),
                running: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Admit `work` for immediate execution (as soon as a slot is free).
    pub fn submit<F>(&self, key: K, work: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.admit(&key, Slot::Active)?;
        self.spawn_active(key, work);
        Ok(())
    }

    /// Admit `work` to start at `run_at`. A time in the past runs immediately.
    pub fn schedule_at<F>(&self, key: K, run_at: DateTime<Utc>, work: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = match (run_at - Utc::now()).to_std() {
            Ok(delay) if !delay.is_zero() => delay,
            _ => return self.submit(key, work),
        };

        let token = self.inner.shutdown_token.child_token();
        self.admit(&key, Slot::Deferred(token.clone()))?;

        let pool = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Deferred task {:?} cancelled", key);
                    pool.release(&key);
                }
                _ = tokio::time::sleep(delay) => {
                    if pool.is_shutdown_requested() {
                        pool.release(&key);
                        return;
                    }
                    pool.inner.slots().insert(key.clone(), Slot::Active);
                    pool.run_with_permit(key, work).await;
                }
            }
        });

        Ok(())
    }

    /// Drop a deferred unit before it starts. Returns `false` if the key is not
    /// deferred (unknown, or already running).
    pub fn cancel(&self, key: &K) -> bool {
        let slots = self.inner.slots();
        match slots.get(key) {
            Some(Slot::Deferred(token)) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Whether `key` has work pending or in flight.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.slots().contains_key(key)
    }

    /// Number of admitted keys (deferred, queued and running).
    pub fn pending(&self) -> usize {
        self.inner.slots().len()
    }

    /// Number of units currently executing.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.pending() > 0
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Stop admitting work and drop deferred units. In-flight work continues.
    pub fn request_shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Task pool shutdown requested ({} task(s) in flight)",
            self.pending()
        );
        self.inner.shutdown_token.cancel();
    }

    /// Resolve once every admitted unit has settled. Any number of callers
    /// may wait at once.
    pub async fn wait_for_completion(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Registered before the check so a release in between is not lost.
            idle.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            idle.await;
        }
    }

    fn admit(&self, key: &K, slot: Slot) -> Result<(), PoolError> {
        let mut slots = self.inner.slots();
        // Checked under the slot lock so a racing shutdown cannot slip work in.
        if self.is_shutdown_requested() {
            return Err(PoolError::ShuttingDown);
        }
        if slots.contains_key(key) {
            warn!("Rejecting duplicate task for key {:?}", key);
            return Err(PoolError::DuplicateKey(format!("{:?}", key)));
        }
        slots.insert(key.clone(), slot);
        Ok(())
    }

    fn release(&self, key: &K) {
        let mut slots = self.inner.slots();
        slots.remove(key);
        if slots.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }

    fn spawn_active<F>(&self, key: K, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move { pool.run_with_permit(key, work).await });
    }

    async fn run_with_permit<F>(&self, key: K, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _permit = match Arc::clone(&self.inner.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.release(&key);
                return;
            }
        };

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let _settle = SettleGuard { pool: self, key };
        work.await;
    }
}

/// Releases the key and the running count even if the work panics.
struct SettleGuard<'a, K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pool: &'a TaskPool<K>,
    key: K,
}

impl<K> Drop for SettleGuard<'_, K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.pool.inner.running.fetch_sub(1, Ordering::SeqCst);
        self.pool.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_duplicate_key_rejected_while_pending() {
        let pool: TaskPool<&'static str> = TaskPool::new(2);
        let gate = Arc::new(Notify::new());

        let g = Arc::clone(&gate);
        pool.submit("job-1", async move { g.notified().await }).unwrap();

        assert_eq!(
            pool.submit("job-1", async {}),
            Err(PoolError::DuplicateKey("\"job-1\"".to_string()))
        );
        assert!(pool.contains(&"job-1"));

        gate.notify_one();
        pool.wait_for_completion().await;
        assert!(!pool.contains(&"job-1"));

        // The key is reusable once settled.
        pool.submit("job-1", async {}).unwrap();
        pool.wait_for_completion().await;
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_while_deferred() {
        let pool: TaskPool<u32> = TaskPool::new(1);
        let later = Utc::now() + chrono::Duration::seconds(60);

        pool.schedule_at(7, later, async {}).unwrap();
        assert!(matches!(
            pool.schedule_at(7, later, async {}),
            Err(PoolError::DuplicateKey(_))
        ));
        assert!(matches!(pool.submit(7, async {}), Err(PoolError::DuplicateKey(_))));

        assert!(pool.cancel(&7));
        pool.wait_for_completion().await;
        assert!(!pool.contains(&7));
    }

    #[tokio::test]
    async fn test_capacity_is_never_exceeded() {
        const CAPACITY: usize = 3;
        const UNITS: usize = 12;

        let pool: TaskPool<usize> = TaskPool::new(CAPACITY);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..UNITS {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.submit(i, async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.wait_for_completion().await;
        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(peak.load(Ordering::SeqCst), CAPACITY);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(pool.running(), 0);
        assert!(!pool.is_busy());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work_but_drains_in_flight() {
        let pool: TaskPool<&'static str> = TaskPool::new(2);
        let finished = Arc::new(AtomicBool::new(false));

        let f = Arc::clone(&finished);
        pool.submit("running", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.request_shutdown();

        assert!(pool.is_shutdown_requested());
        assert_eq!(pool.submit("late", async {}), Err(PoolError::ShuttingDown));

        pool.wait_for_completion().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!pool.is_busy());
    }

    #[tokio::test]
    async fn test_shutdown_drops_deferred_work() {
        let pool: TaskPool<u8> = TaskPool::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&ran);
        pool.schedule_at(1, Utc::now() + chrono::Duration::seconds(30), async move {
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), pool.wait_for_completion())
            .await
            .expect("deferred work should be dropped on shutdown");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_schedule_at_runs_at_time() {
        let pool: TaskPool<u8> = TaskPool::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&ran);
        pool.schedule_at(1, Utc::now() + chrono::Duration::milliseconds(30), async move {
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        pool.wait_for_completion().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_schedule_in_past_runs_immediately() {
        let pool: TaskPool<u8> = TaskPool::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&ran);
        pool.schedule_at(1, Utc::now() - chrono::Duration::seconds(5), async move {
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.wait_for_completion().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_resolve() {
        let pool: TaskPool<u8> = TaskPool::new(2);
        let gate = CancellationToken::new();

        let g = gate.clone();
        pool.submit(1, async move { g.cancelled().await }).unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.wait_for_completion().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        gate.cancel();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("every waiter should see the pool drain")
                .unwrap();
        }

        // Still usable without a shutdown.
        pool.submit(2, async {}).unwrap();
        pool.wait_for_completion().await;
        assert!(!pool.is_busy());
    }

    #[tokio::test]
    async fn test_wait_for_completion_on_idle_pool_returns() {
        let pool: TaskPool<u8> = TaskPool::new(1);
        tokio::time::timeout(Duration::from_secs(1), pool.wait_for_completion())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_completion_waits_for_last_unit() {
        let pool: TaskPool<u8> = TaskPool::new(4);
        let done = Arc::new(AtomicUsize::new(0));

        for (key, ms) in [(1u8, 10u64), (2, 40), (3, 80)] {
            let d = Arc::clone(&done);
            pool.submit(key, async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                d.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.request_shutdown();
        pool.wait_for_completion().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }
}
