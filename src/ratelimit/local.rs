//! In-process state store used when the shared backend is unavailable.
//!
//! Each bucket key owns its own `tokio::sync::Mutex`, so calls for one key
//! queue behind each other (FIFO) while calls for other keys proceed in
//! parallel. Waiting for a key is bounded by `lock_timeout`; a caller that
//! cannot get the lock in time gets [`TollgateError::LockTimeout`] instead
//! of blocking forever.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::backend::AtomicStore;
use super::bucket::{self, BucketParams, BucketState, Consumption};
use crate::clock::Clock;
use crate::error::{Result, TollgateError};

/// Default bound on waiting for a key's lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bucket state plus its expiry deadline.
#[derive(Debug)]
struct BucketSlot {
    state: Option<BucketState>,
    expires_at: f64,
}

impl BucketSlot {
    fn empty() -> Self {
        Self {
            state: None,
            expires_at: f64::NEG_INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SeenRecord {
    first_seen_at: f64,
    expires_at: f64,
}

/// In-memory [`AtomicStore`] with per-key mutual exclusion.
pub struct LocalStore {
    /// Bucket slots indexed by bucket key
    buckets: DashMap<String, Arc<Mutex<BucketSlot>>>,
    /// First-seen records indexed by slow-start key
    first_seen: DashMap<String, SeenRecord>,
    /// Bound on waiting for a bucket's lock
    lock_timeout: Duration,
}

impl LocalStore {
    /// Create a store with the given lock wait bound.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            first_seen: DashMap::new(),
            lock_timeout,
        }
    }

    /// Get or create the slot for a key.
    fn slot(&self, key: &str) -> Arc<Mutex<BucketSlot>> {
        if let Some(slot) = self.buckets.get(key) {
            return Arc::clone(&slot);
        }
        let slot = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BucketSlot::empty())));
        Arc::clone(&slot)
    }

    /// Number of bucket slots currently held, expired or not.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of first-seen records currently held.
    pub fn first_seen_len(&self) -> usize {
        self.first_seen.len()
    }

    /// Drop every expired bucket and first-seen record.
    ///
    /// A bucket is only removed when nothing else holds its slot; the shard
    /// lock taken by `retain` keeps new holders out while it decides.
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self, now: f64) -> usize {
        let before = self.buckets.len() + self.first_seen.len();

        self.buckets.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => guard.expires_at > now,
                Err(_) => true,
            }
        });
        self.first_seen.retain(|_, record| record.expires_at > now);

        let removed = before.saturating_sub(self.buckets.len() + self.first_seen.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired local state");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `every` until the
    /// store is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        clock: Arc<dyn Clock>,
        every: Duration,
    ) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Local store dropped, stopping sweeper");
                    return;
                };
                store.sweep_expired(clock.now());
            }
        })
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[async_trait]
impl AtomicStore for LocalStore {
    async fn check_and_consume(
        &self,
        key: &str,
        now: f64,
        params: &BucketParams,
    ) -> Result<Consumption> {
        let slot = self.slot(key);

        let mut guard = match tokio::time::timeout(self.lock_timeout, slot.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                let waited_ms = self.lock_timeout.as_millis() as u64;
                warn!(key = %key, waited_ms = waited_ms, "Timed out waiting for local bucket lock");
                return Err(TollgateError::LockTimeout {
                    key: key.to_string(),
                    waited_ms,
                });
            }
        };

        if guard.expires_at <= now {
            if guard.state.is_some() {
                trace!(key = %key, "Local bucket expired, starting full");
            }
            guard.state = None;
        }

        let (state, consumption) = bucket::check_and_consume(guard.state, now, params);
        guard.state = Some(state);
        guard.expires_at = now + params.ttl_secs as f64;

        Ok(consumption)
    }

    async fn first_seen(&self, key: &str, now: f64, ttl_secs: u64) -> Result<f64> {
        let fresh = SeenRecord {
            first_seen_at: now,
            expires_at: now + ttl_secs as f64,
        };

        let mut record = self.first_seen.entry(key.to_string()).or_insert(fresh);
        if record.expires_at <= now {
            *record = fresh;
        }
        Ok(record.first_seen_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    fn params(capacity: f64, cost: f64, ttl_secs: u64) -> BucketParams {
        BucketParams {
            capacity,
            rate: 1.0,
            cost,
            ttl_secs,
        }
    }

    #[tokio::test]
    async fn test_new_key_starts_full() {
        let store = LocalStore::default();

        let outcome = store
            .check_and_consume("ratelimit:a:b", 10.0, &params(5.0, 1.0, 60))
            .await
            .unwrap();

        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 4.0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = LocalStore::default();
        let p = params(1.0, 1.0, 60);

        assert!(store.check_and_consume("k1", 0.0, &p).await.unwrap().allowed);
        assert!(!store.check_and_consume("k1", 0.0, &p).await.unwrap().allowed);
        assert!(store.check_and_consume("k2", 0.0, &p).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_expired_bucket_starts_full_again() {
        let store = LocalStore::default();
        let p = BucketParams {
            capacity: 2.0,
            rate: 0.001,
            cost: 2.0,
            ttl_secs: 10,
        };

        assert!(store.check_and_consume("k", 0.0, &p).await.unwrap().allowed);
        assert!(!store.check_and_consume("k", 5.0, &p).await.unwrap().allowed);

        // 5 + 10 = 15 is the new deadline
        let outcome = store.check_and_consume("k", 15.0, &p).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_overadmit() {
        let store = Arc::new(LocalStore::default());
        let p = BucketParams {
            capacity: 10.0,
            rate: 1e-9,
            cost: 1.0,
            ttl_secs: 60,
        };

        let tasks = (0..64).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.check_and_consume("hot", 100.0, &p).await })
        });

        let admitted = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|outcome| outcome.allowed)
            .count();

        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_lock_timeout_is_reported() {
        let store = LocalStore::new(Duration::from_millis(20));
        let slot = store.slot("busy");
        let _held = slot.lock().await;

        let result = store.check_and_consume("busy", 0.0, &params(5.0, 1.0, 60)).await;
        match assert_err!(result) {
            TollgateError::LockTimeout { key, waited_ms } => {
                assert_eq!(key, "busy");
                assert_eq!(waited_ms, 20);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Other keys are unaffected by the held lock.
        assert_ok!(store.check_and_consume("idle", 0.0, &params(5.0, 1.0, 60)).await);
    }

    #[tokio::test]
    async fn test_lock_released_after_each_call() {
        let store = LocalStore::new(Duration::from_millis(20));
        let p = params(100.0, 1.0, 60);

        for _ in 0..5 {
            assert_ok!(store.check_and_consume("k", 0.0, &p).await);
        }
    }

    #[tokio::test]
    async fn test_first_seen_is_recorded_once() {
        let store = LocalStore::default();

        assert_eq!(store.first_seen("slowstart:a", 100.0, 60).await.unwrap(), 100.0);
        assert_eq!(store.first_seen("slowstart:a", 130.0, 60).await.unwrap(), 100.0);
        assert_eq!(store.first_seen("slowstart:b", 130.0, 60).await.unwrap(), 130.0);
        assert_eq!(store.first_seen_len(), 2);
    }

    #[tokio::test]
    async fn test_first_seen_expires() {
        let store = LocalStore::default();

        store.first_seen("slowstart:a", 100.0, 60).await.unwrap();
        assert_eq!(store.first_seen("slowstart:a", 160.0, 60).await.unwrap(), 160.0);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_entries() {
        let store = LocalStore::default();

        store.check_and_consume("old", 0.0, &params(5.0, 1.0, 10)).await.unwrap();
        store.check_and_consume("new", 0.0, &params(5.0, 1.0, 100)).await.unwrap();
        store.first_seen("slowstart:old", 0.0, 10).await.unwrap();
        store.first_seen("slowstart:new", 0.0, 100).await.unwrap();

        let removed = store.sweep_expired(50.0);

        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.first_seen_len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_keeps_slots_in_use() {
        let store = LocalStore::default();
        store.check_and_consume("k", 0.0, &params(5.0, 1.0, 1)).await.unwrap();

        let held = store.slot("k");
        assert_eq!(store.sweep_expired(100.0), 0);
        drop(held);
        assert_eq!(store.sweep_expired(100.0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_periodically() {
        let store = Arc::new(LocalStore::default());
        let clock = Arc::new(ManualClock::new(0.0));

        store.check_and_consume("k", 0.0, &params(5.0, 1.0, 10)).await.unwrap();
        let handle = store.spawn_sweeper(clock.clone(), Duration::from_secs(30));

        clock.set(60.0);
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        handle.abort();
    }
}
