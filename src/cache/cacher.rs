//! Get-or-refresh wrapper around an async producer
//!
//! A `Cacher` serves a value from its `CacheStore` entry while the entry is
//! younger than the TTL and re-runs the producer otherwise. Every lookup goes
//! through a single shared run per instance: callers join the run in the
//! in-flight slot before anything is read from disk, so concurrent callers
//! that miss the cache cause exactly one producer call.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::{BoxError, CacheError, CacheStore};

/// Computes the value a `Cacher` stores
///
/// Implemented for any `Fn() -> impl Future<Output = Result<T, E>>` closure, so
/// most callers never name this trait. Implement it directly for producers that
/// carry their own state (HTTP clients, counters in tests).
pub trait Producer<T>: Send + Sync {
    fn produce(&self) -> BoxFuture<'static, Result<T, BoxError>>;
}

impl<T, F, Fut, E> Producer<T> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn produce(&self) -> BoxFuture<'static, Result<T, BoxError>> {
        let fut = self();
        async move { fut.await.map_err(Into::<BoxError>::into) }.boxed()
    }
}

type Pending<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;
type Slot<T> = Mutex<Option<Run<T>>>;

/// A spawned lookup that callers can join
struct Run<T> {
    pending: Pending<T>,
    abort: AbortHandle,
    /// Budget (in nanoseconds) of the caller that abandoned the run. Also
    /// identifies the run: the slot is only cleared by the run it holds.
    abandoned_after: Arc<AtomicU64>,
}

impl<T> Clone for Run<T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
            abort: self.abort.clone(),
            abandoned_after: Arc::clone(&self.abandoned_after),
        }
    }
}

/// Disk-backed, TTL-expiring cache for one producer
///
/// Clones share the same in-flight slot, so at most one producer run is in
/// progress across all clones of a `Cacher`. Lookups are spawned onto the tokio
/// runtime, so `get` must be called from within one.
pub struct Cacher<T> {
    producer: Arc<dyn Producer<T>>,
    store: CacheStore,
    key: String,
    ttl: Duration,
    in_flight: Arc<Slot<T>>,
}

impl<T> Clone for Cacher<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
            store: self.store.clone(),
            key: self.key.clone(),
            ttl: self.ttl,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<T> std::fmt::Debug for Cacher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cacher")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<T> Cacher<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a cacher that stores `producer`'s result under `key` for `ttl`
    pub fn new(
        producer: impl Producer<T> + 'static,
        store: CacheStore,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            producer: Arc::new(producer),
            store,
            key: key.into(),
            ttl,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Path of the backing cache file
    pub fn path(&self) -> PathBuf {
        self.store.cache_path(&self.key)
    }

    /// Returns the cached value, recomputing it if missing or stale
    ///
    /// # Behavior
    /// - A fresh entry on disk is returned without calling the producer
    /// - Otherwise the producer runs once and its value is written back
    /// - Callers arriving while a lookup is in progress wait for that lookup
    /// - A producer error reaches every waiting caller and leaves the file as is
    /// - A failed write is logged; the fresh value is still returned
    pub async fn get(&self) -> Result<T, CacheError> {
        self.join_or_start().pending.await
    }

    /// Like [`get`](Self::get), giving up after `budget`
    ///
    /// When the budget runs out and the lookup this caller joined is still in
    /// flight, the lookup is aborted and removed from the slot. Other callers
    /// waiting on it fail with the same `Timeout`, and the next call starts a
    /// fresh lookup instead of queueing behind a stalled producer.
    pub async fn get_with_timeout(&self, budget: Duration) -> Result<T, CacheError> {
        let run = self.join_or_start();
        match tokio::time::timeout(budget, run.pending.clone()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.abandon(&run, budget);
                Err(CacheError::Timeout(budget))
            }
        }
    }

    fn join_or_start(&self) -> Run<T> {
        let mut slot = lock(&*self.in_flight);
        if let Some(run) = slot.as_ref() {
            trace!(key = %self.key, "joining in-flight lookup");
            return run.clone();
        }

        let abandoned_after = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(lookup(
            Arc::clone(&self.producer),
            self.store.clone(),
            self.key.clone(),
            self.ttl,
            Arc::downgrade(&self.in_flight),
            Arc::clone(&abandoned_after),
        ));
        let abort = task.abort_handle();

        let budget = Arc::clone(&abandoned_after);
        let pending = task
            .map(move |joined| match joined {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancelled() => Err(CacheError::Timeout(Duration::from_nanos(
                    budget.load(Ordering::SeqCst),
                ))),
                Err(_) => Err(CacheError::producer("producer panicked".into())),
            })
            .boxed()
            .shared();

        let run = Run {
            pending,
            abort,
            abandoned_after,
        };
        *slot = Some(run.clone());
        run
    }

    /// Aborts `run` if it still holds the slot
    fn abandon(&self, run: &Run<T>, budget: Duration) {
        let mut slot = lock(&*self.in_flight);
        let current = slot
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(&held.abandoned_after, &run.abandoned_after));
        if !current {
            return;
        }
        slot.take();
        drop(slot);

        warn!(key = %self.key, ?budget, "lookup exceeded caller budget, aborting it");
        let nanos = u64::try_from(budget.as_nanos()).unwrap_or(u64::MAX);
        run.abandoned_after.store(nanos, Ordering::SeqCst);
        run.abort.abort();
    }
}

/// Body of a spawned run: serve the disk entry if fresh, else produce and persist
async fn lookup<T>(
    producer: Arc<dyn Producer<T>>,
    store: CacheStore,
    key: String,
    ttl: Duration,
    slot: Weak<Slot<T>>,
    token: Arc<AtomicU64>,
) -> Result<T, CacheError>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let outcome = load_or_produce(&*producer, &store, &key, ttl).await;

    // Written before the slot is cleared, so a caller that finds the slot
    // empty also finds the fresh entry on disk.
    if let Some(slot) = slot.upgrade() {
        let mut slot = lock(&*slot);
        if slot
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(&held.abandoned_after, &token))
        {
            slot.take();
        }
    }
    outcome
}

async fn load_or_produce<T>(
    producer: &dyn Producer<T>,
    store: &CacheStore,
    key: &str,
    ttl: Duration,
) -> Result<T, CacheError>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    match store.read::<T>(key, ttl).await {
        Some(cached) if !cached.is_expired => {
            debug!(key = %key, "cache hit");
            return Ok(cached.data);
        }
        Some(cached) => {
            debug!(key = %key, cached_at = %cached.cached_at, "cache entry expired");
        }
        None => debug!(key = %key, "cache miss"),
    }

    match producer.produce().await {
        Ok(value) => {
            if let Err(err) = store.write(key, &value).await {
                warn!(key = %key, error = %err, "could not persist cache entry");
            }
            Ok(value)
        }
        Err(err) => {
            warn!(key = %key, error = %err, "producer failed, keeping previous cache entry");
            Err(CacheError::producer(err))
        }
    }
}

fn lock<T>(slot: &Slot<T>) -> MutexGuard<'_, Option<Run<T>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::SystemTime;
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    /// Returns 0, 1, 2, ... and counts its calls
    #[derive(Clone, Default)]
    struct Counter {
        calls: Arc<AtomicU32>,
        delay: Duration,
    }

    impl Counter {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Producer<u32> for Counter {
        fn produce(&self) -> BoxFuture<'static, Result<u32, BoxError>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, BoxError>(n)
            }
            .boxed()
        }
    }

    fn test_store() -> (CacheStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        (CacheStore::with_dir(temp_dir.path()), temp_dir)
    }

    fn failing() -> impl Fn() -> futures::future::Ready<Result<u32, io::Error>> + Send + Sync {
        || futures::future::ready(Err(io::Error::new(io::ErrorKind::Other, "registry down")))
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_producer() {
        let (store, _dir) = test_store();
        let counter = Counter::default();
        let cacher = Cacher::new(counter.clone(), store, "counter", MINUTE);

        assert_eq!(cacher.get().await.unwrap(), 0);
        assert_eq!(cacher.get().await.unwrap(), 0);
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_reruns_producer() {
        let (store, _dir) = test_store();
        let counter = Counter::default();
        let cacher = Cacher::new(counter.clone(), store, "counter", MINUTE);

        assert_eq!(cacher.get().await.unwrap(), 0);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(cacher.path())
            .unwrap();
        file.set_modified(SystemTime::now() - 2 * MINUTE).unwrap();

        assert_eq!(cacher.get().await.unwrap(), 1);
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_existing_fresh_file_is_used_without_producer() {
        let (store, _dir) = test_store();
        store.write("seeded", &41u32).await.unwrap();
        let counter = Counter::default();
        let cacher = Cacher::new(counter.clone(), store, "seeded", MINUTE);

        assert_eq!(cacher.get().await.unwrap(), 41);
        assert_eq!(counter.calls(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_triggers_recompute() {
        let (store, dir) = test_store();
        std::fs::write(dir.path().join("broken.json"), "[[[").unwrap();
        let counter = Counter::default();
        let cacher = Cacher::new(counter.clone(), store.clone(), "broken", MINUTE);

        assert_eq!(cacher.get().await.unwrap(), 0);
        let reread = store.read::<u32>("broken", MINUTE).await.unwrap();
        assert_eq!(reread.data, 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let (store, _dir) = test_store();
        let counter = Counter::with_delay(Duration::from_millis(50));
        let cacher = Cacher::new(counter.clone(), store, "shared", MINUTE);
        let other = cacher.clone();

        let (a, b, c) = tokio::join!(cacher.get(), cacher.get(), other.get());

        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (0, 0, 0));
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_producer_failure_propagates_and_keeps_old_entry() {
        let (store, _dir) = test_store();
        store.write("flaky", &7u32).await.unwrap();
        // Zero TTL: the seeded entry is always stale, so the producer must run.
        let cacher = Cacher::new(failing(), store.clone(), "flaky", Duration::ZERO);

        let err = cacher.get().await.unwrap_err();

        assert!(matches!(err, CacheError::ProducerFailed(_)));
        assert!(err.to_string().contains("registry down"));
        let kept = store.read::<u32>("flaky", MINUTE).await.unwrap();
        assert_eq!(kept.data, 7);
    }

    #[tokio::test]
    async fn test_failure_clears_in_flight_so_next_call_retries() {
        let (store, _dir) = test_store();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let producer = move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(io::Error::new(io::ErrorKind::Other, "first attempt fails"))
                } else {
                    Ok(n)
                }
            }
        };
        let cacher = Cacher::new(producer, store, "retry", MINUTE);

        assert!(cacher.get().await.is_err());
        assert_eq!(cacher.get().await.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_all_see_failure() {
        let (store, _dir) = test_store();
        let producer = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<u32, _>(io::Error::new(io::ErrorKind::Other, "boom"))
        };
        let cacher = Cacher::new(producer, store, "boom", MINUTE);

        let (a, b) = tokio::join!(cacher.get(), cacher.get());

        assert!(matches!(a, Err(CacheError::ProducerFailed(_))));
        assert!(matches!(b, Err(CacheError::ProducerFailed(_))));
    }

    #[tokio::test]
    async fn test_write_failure_still_returns_value() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let counter = Counter::default();
        let store = CacheStore::with_dir(blocker.join("c"));
        let cacher = Cacher::new(counter.clone(), store, "k", MINUTE);

        assert_eq!(cacher.get().await.unwrap(), 0);
        // Nothing persisted, so the next call recomputes.
        assert_eq!(cacher.get().await.unwrap(), 1);
    }

    /// Hangs forever on its first call, answers with the call number afterwards
    fn hangs_once(attempts: Arc<AtomicU32>) -> impl Producer<u32> {
        move || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    futures::future::pending::<()>().await;
                }
                Ok::<_, io::Error>(n)
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_releases_stalled_producer() {
        let (store, _dir) = test_store();
        let attempts = Arc::new(AtomicU32::new(0));
        let cacher = Cacher::new(hangs_once(Arc::clone(&attempts)), store, "stalled", MINUTE);

        let err = cacher
            .get_with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));

        // The stalled run is gone; a plain get starts over instead of hanging.
        let value = tokio::time::timeout(Duration::from_secs(5), cacher.get())
            .await
            .expect("get should not queue behind the stalled run")
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_joined_callers_see_timeout_of_abandoned_run() {
        let (store, _dir) = test_store();
        let attempts = Arc::new(AtomicU32::new(0));
        let cacher = Cacher::new(hangs_once(attempts), store, "stalled", MINUTE);
        let budget = Duration::from_millis(20);

        let (waiting, impatient) = tokio::join!(cacher.get(), cacher.get_with_timeout(budget));

        assert!(matches!(impatient, Err(CacheError::Timeout(d)) if d == budget));
        assert!(matches!(waiting, Err(CacheError::Timeout(d)) if d == budget));
    }

    #[tokio::test]
    async fn test_timeout_within_budget_returns_value() {
        let (store, _dir) = test_store();
        let counter = Counter::with_delay(Duration::from_millis(10));
        let cacher = Cacher::new(counter.clone(), store, "quick", MINUTE);

        assert_eq!(cacher.get_with_timeout(Duration::from_secs(5)).await.unwrap(), 0);
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_callers_on_empty_cache_produce_once() {
        for round in 0..50 {
            let (store, _dir) = test_store();
            let counter = Counter::default();
            let cacher = Cacher::new(counter.clone(), store, "burst", MINUTE);

            let callers: Vec<_> = (0..32)
                .map(|_| {
                    let cacher = cacher.clone();
                    tokio::spawn(async move { cacher.get().await })
                })
                .collect();
            for caller in callers {
                assert_eq!(caller.await.unwrap().unwrap(), 0, "round {}", round);
            }

            assert_eq!(counter.calls(), 1, "round {}: producer ran more than once", round);
        }
    }

    #[tokio::test]
    async fn test_interleaved_callers_on_current_thread_produce_once() {
        let (store, _dir) = test_store();
        let counter = Counter::default();
        let cacher = Cacher::new(counter.clone(), store, "interleaved", MINUTE);

        let callers: Vec<_> = (0..32)
            .map(|_| {
                let cacher = cacher.clone();
                tokio::spawn(async move { cacher.get().await })
            })
            .collect();
        for caller in callers {
            assert_eq!(caller.await.unwrap().unwrap(), 0);
        }

        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_ttl_end_to_end() {
        let (store, _dir) = test_store();
        let counter = Counter::default();
        let cacher = Cacher::new(counter.clone(), store, "e2e", Duration::from_millis(100));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(cacher.get().await.unwrap());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, vec![0, 0, 0]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cacher.get().await.unwrap(), 1);
    }
}
