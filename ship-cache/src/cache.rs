//! The keyed query cache.
//!
//! Entries are addressed by [`QueryKey`] and operated on by prefix. An
//! invalidation marks every matching entry stale and refetches the ones that
//! currently have an observer; an eviction removes matching entries outright.
//!
//! # Refetch coalescing
//!
//! Each entry runs at most one fetch at a time. Invalidations that arrive
//! while a fetch is in flight set a flag instead of starting a second fetch;
//! when the first fetch completes, exactly one follow-up fetch runs no matter
//! how many invalidations were folded into the flag.
//!
//! # Eviction and in-flight fetches
//!
//! Every entry carries a serial assigned when it is created. A fetch records
//! the serial it started with and its result is discarded if the entry was
//! evicted (or evicted and recreated) in the meantime, so a read after an
//! eviction never sees data from a fetch that began before it.

use serde::de::DeserializeOwned;
use serde_json::Value;
use ship_core::QueryKey;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::entry::{CacheEntry, EntryStatus, Slot};
use crate::error::{CacheError, CacheResult, FetchError};
use crate::fetcher::QueryFetcher;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the query cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long fetched data is served without refetching by default.
    pub default_stale_time: Duration,
    /// Buffer size of the change broadcast channel.
    pub change_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::from_secs(30),
            change_capacity: 256,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default stale time.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    /// Set the change channel capacity.
    pub fn with_change_capacity(mut self, capacity: usize) -> Self {
        self.change_capacity = capacity.max(1);
        self
    }
}

// ============================================================================
// CHANGE NOTIFICATIONS AND STATISTICS
// ============================================================================

/// A change to one cache entry, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    /// Data was written, by a fetch or a local patch.
    Updated { key: QueryKey },
    /// The entry was marked stale.
    Invalidated { key: QueryKey },
    /// The entry was removed.
    Evicted { key: QueryKey },
    /// A fetch failed and no follow-up fetch is queued.
    FetchFailed { key: QueryKey, reason: String },
}

impl CacheChange {
    pub fn key(&self) -> &QueryKey {
        match self {
            Self::Updated { key }
            | Self::Invalidated { key }
            | Self::Evicted { key }
            | Self::FetchFailed { key, .. } => key,
        }
    }
}

/// Cache counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from fresh data.
    pub hits: u64,
    /// Reads that had to fetch or wait for a fetch.
    pub misses: u64,
    /// Fetcher calls made.
    pub fetches: u64,
    /// Fetcher calls that returned an error.
    pub fetch_failures: u64,
    /// Follow-up fetches started for invalidations folded during a fetch.
    pub coalesced_refetches: u64,
    /// Fetch results discarded because their entry was evicted.
    pub dropped_results: u64,
    /// Entries marked stale.
    pub invalidations: u64,
    /// Entries removed.
    pub evictions: u64,
    /// Entries currently held.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    coalesced_refetches: AtomicU64,
    dropped_results: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

// ============================================================================
// CACHE
// ============================================================================

/// What a completed fetch did to its entry.
enum Completion {
    Stored(Value),
    Refetch { generation: u64 },
    Failed(String),
    Dropped,
}

/// What a read decided to do while holding the entry lock.
enum ReadPlan {
    Hit(Value),
    Wait(broadcast::Receiver<CacheChange>),
    Start { serial: u64, generation: u64 },
}

struct Inner {
    config: CacheConfig,
    entries: Mutex<HashMap<QueryKey, Slot>>,
    observers: Mutex<HashMap<QueryKey, usize>>,
    fetcher: RwLock<Option<Arc<dyn QueryFetcher>>>,
    changes: broadcast::Sender<CacheChange>,
    next_serial: AtomicU64,
    counters: Counters,
}

impl Inner {
    fn entries(&self) -> CacheResult<MutexGuard<'_, HashMap<QueryKey, Slot>>> {
        self.entries.lock().map_err(|_| CacheError::LockPoisoned)
    }

    fn observers(&self) -> CacheResult<MutexGuard<'_, HashMap<QueryKey, usize>>> {
        self.observers.lock().map_err(|_| CacheError::LockPoisoned)
    }

    fn fetcher(&self) -> CacheResult<Option<Arc<dyn QueryFetcher>>> {
        self.fetcher
            .read()
            .map(|f| f.clone())
            .map_err(|_| CacheError::LockPoisoned)
    }

    fn serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn emit(&self, change: CacheChange) {
        // No subscribers is not an error.
        let _ = self.changes.send(change);
    }

    /// Run a fetch for `key` until no follow-up is queued.
    async fn run_fetch(
        &self,
        fetcher: Arc<dyn QueryFetcher>,
        key: QueryKey,
        serial: u64,
        mut generation: u64,
    ) -> Completion {
        loop {
            bump(&self.counters.fetches, 1);
            debug!(key = %key, generation, "Fetching query");
            let result = fetcher.fetch(&key).await;
            match self.complete(&key, serial, generation, result) {
                Ok(Completion::Refetch { generation: next }) => generation = next,
                Ok(done) => return done,
                Err(e) => return Completion::Failed(e.to_string()),
            }
        }
    }

    fn complete(
        &self,
        key: &QueryKey,
        serial: u64,
        generation: u64,
        result: Result<Value, FetchError>,
    ) -> CacheResult<Completion> {
        let (outcome, follow_up) = {
            let mut entries = self.entries()?;
            let slot = match entries.get_mut(key) {
                Some(slot) if slot.serial == serial => slot,
                _ => {
                    bump(&self.counters.dropped_results, 1);
                    debug!(key = %key, "Dropping fetch result for evicted entry");
                    return Ok(Completion::Dropped);
                }
            };

            slot.in_flight = false;
            let outcome = match result {
                Ok(data) => {
                    slot.write(data.clone());
                    slot.status = if slot.generation == generation {
                        EntryStatus::Fresh
                    } else {
                        EntryStatus::Stale
                    };
                    Completion::Stored(data)
                }
                Err(e) => {
                    bump(&self.counters.fetch_failures, 1);
                    slot.status = EntryStatus::Stale;
                    Completion::Failed(e.reason)
                }
            };

            let follow_up = if slot.refetch_queued {
                slot.refetch_queued = false;
                slot.in_flight = true;
                slot.status = EntryStatus::Fetching;
                Some(slot.generation)
            } else {
                None
            };
            (outcome, follow_up)
        };

        if let Some(next) = follow_up {
            bump(&self.counters.coalesced_refetches, 1);
            if matches!(outcome, Completion::Stored(_)) {
                self.emit(CacheChange::Updated { key: key.clone() });
            }
            return Ok(Completion::Refetch { generation: next });
        }

        match &outcome {
            Completion::Stored(_) => self.emit(CacheChange::Updated { key: key.clone() }),
            Completion::Failed(reason) => {
                warn!(key = %key, error = %reason, "Query fetch failed");
                self.emit(CacheChange::FetchFailed {
                    key: key.clone(),
                    reason: reason.clone(),
                });
            }
            Completion::Refetch { .. } | Completion::Dropped => {}
        }
        Ok(outcome)
    }
}

/// Shared, cloneable handle to one query cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueryCache {
    /// Create an empty cache with no fetcher installed.
    pub fn new(config: CacheConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
                observers: Mutex::new(HashMap::new()),
                fetcher: RwLock::new(None),
                changes,
                next_serial: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Create a cache that loads data through `fetcher`.
    pub fn with_fetcher(config: CacheConfig, fetcher: Arc<dyn QueryFetcher>) -> Self {
        let cache = Self::new(config);
        if let Ok(mut slot) = cache.inner.fetcher.write() {
            *slot = Some(fetcher);
        }
        cache
    }

    /// Install or replace the fetcher used for reads and refetches.
    pub fn set_fetcher(&self, fetcher: Arc<dyn QueryFetcher>) -> CacheResult<()> {
        let mut slot = self
            .inner
            .fetcher
            .write()
            .map_err(|_| CacheError::LockPoisoned)?;
        *slot = Some(fetcher);
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Subscribe to entry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.inner.changes.subscribe()
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Snapshot of the entry for `key`.
    pub fn get(&self, key: &QueryKey) -> CacheResult<Option<CacheEntry>> {
        Ok(self.inner.entries()?.get(key).map(|slot| slot.snapshot(key)))
    }

    /// The data for `key`, if any is cached.
    pub fn get_data(&self, key: &QueryKey) -> CacheResult<Option<Value>> {
        Ok(self
            .inner
            .entries()?
            .get(key)
            .and_then(|slot| slot.data.clone()))
    }

    /// The data for `key`, deserialized.
    pub fn get_as<T: DeserializeOwned>(&self, key: &QueryKey) -> CacheResult<Option<T>> {
        match self.get(key)? {
            Some(entry) => entry.decode(),
            None => Ok(None),
        }
    }

    pub fn status(&self, key: &QueryKey) -> CacheResult<Option<EntryStatus>> {
        Ok(self.inner.entries()?.get(key).map(|slot| slot.status))
    }

    pub fn contains(&self, key: &QueryKey) -> CacheResult<bool> {
        Ok(self.inner.entries()?.contains_key(key))
    }

    /// All cached keys, sorted.
    pub fn keys(&self) -> CacheResult<Vec<QueryKey>> {
        let mut keys: Vec<QueryKey> = self.inner.entries()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------------

    /// Write data for `key`, creating the entry if needed.
    ///
    /// A fetch already in flight for the key still completes and overwrites
    /// this value.
    pub fn set_data(&self, key: QueryKey, data: Value) -> CacheResult<()> {
        {
            let mut entries = self.inner.entries()?;
            match entries.get_mut(&key) {
                Some(slot) => {
                    slot.write(data);
                    if !slot.in_flight {
                        slot.status = EntryStatus::Fresh;
                    }
                }
                None => {
                    let serial = self.inner.serial();
                    entries.insert(key.clone(), Slot::with_data(serial, data));
                }
            }
        }
        debug!(key = %key, "Cache data set");
        self.inner.emit(CacheChange::Updated { key });
        Ok(())
    }

    /// Patch existing data in place.
    ///
    /// Returns `None` without calling `patch` when the key has no data.
    pub fn update_data<R>(
        &self,
        key: &QueryKey,
        patch: impl FnOnce(&mut Value) -> R,
    ) -> CacheResult<Option<R>> {
        let result = {
            let mut entries = self.inner.entries()?;
            let Some(slot) = entries.get_mut(key) else {
                return Ok(None);
            };
            let Some(data) = slot.data.as_mut() else {
                return Ok(None);
            };
            let result = patch(data);
            slot.last_updated = Some(chrono::Utc::now());
            result
        };
        self.inner.emit(CacheChange::Updated { key: key.clone() });
        Ok(Some(result))
    }

    /// Patch data in place, seeding it with `init()` when absent.
    pub fn upsert_data<R>(
        &self,
        key: &QueryKey,
        init: impl FnOnce() -> Value,
        patch: impl FnOnce(&mut Value) -> R,
    ) -> CacheResult<R> {
        let result = {
            let mut entries = self.inner.entries()?;
            let slot = match entries.entry(key.clone()) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    let mut slot = Slot::empty(self.inner.serial());
                    slot.status = EntryStatus::Fresh;
                    vacant.insert(slot)
                }
            };
            let result = patch(slot.data.get_or_insert_with(init));
            slot.last_updated = Some(chrono::Utc::now());
            result
        };
        self.inner.emit(CacheChange::Updated { key: key.clone() });
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Invalidation and eviction
    // ------------------------------------------------------------------------

    /// Mark every entry under `prefix` stale and refetch the observed ones.
    ///
    /// Returns the number of entries matched.
    pub fn invalidate(&self, prefix: &QueryKey) -> CacheResult<usize> {
        let fetcher = self.inner.fetcher()?;
        let runtime = Handle::try_current().ok();
        let mut touched = Vec::new();
        let mut starts = Vec::new();
        {
            let observers = self.inner.observers()?;
            let mut entries = self.inner.entries()?;
            for (key, slot) in entries.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
                slot.generation += 1;
                touched.push(key.clone());
                let observed = observers.get(key).is_some_and(|n| *n > 0);

                if slot.in_flight {
                    if observed {
                        slot.refetch_queued = true;
                    }
                    continue;
                }
                if observed && fetcher.is_some() && runtime.is_some() {
                    slot.in_flight = true;
                    slot.status = EntryStatus::Fetching;
                    starts.push((key.clone(), slot.serial, slot.generation));
                } else {
                    slot.status = EntryStatus::Stale;
                }
            }
        }

        bump(&self.inner.counters.invalidations, touched.len() as u64);
        debug!(
            prefix = %prefix,
            matched = touched.len(),
            refetching = starts.len(),
            "Invalidated queries"
        );
        for key in &touched {
            self.inner.emit(CacheChange::Invalidated { key: key.clone() });
        }
        if let (Some(fetcher), Some(runtime)) = (fetcher, runtime) {
            for (key, serial, generation) in starts {
                let inner = Arc::clone(&self.inner);
                let fetcher = Arc::clone(&fetcher);
                runtime.spawn(async move {
                    inner.run_fetch(fetcher, key, serial, generation).await;
                });
            }
        }
        Ok(touched.len())
    }

    /// Remove every entry under `prefix`.
    ///
    /// Returns the number of entries removed.
    pub fn evict(&self, prefix: &QueryKey) -> CacheResult<usize> {
        let removed: Vec<QueryKey> = {
            let mut entries = self.inner.entries()?;
            let matching: Vec<QueryKey> = entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            for key in &matching {
                entries.remove(key);
            }
            matching
        };

        bump(&self.inner.counters.evictions, removed.len() as u64);
        debug!(prefix = %prefix, removed = removed.len(), "Evicted queries");
        for key in &removed {
            self.inner.emit(CacheChange::Evicted { key: key.clone() });
        }
        Ok(removed.len())
    }

    /// Remove every entry.
    pub fn clear(&self) -> CacheResult<usize> {
        self.evict(&QueryKey::new(Vec::new()))
    }

    // ------------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------------

    /// Read `key`, fetching if the data is older than the default stale time.
    pub async fn fetch_query(&self, key: &QueryKey) -> CacheResult<Option<Value>> {
        self.fetch_query_with(key, self.inner.config.default_stale_time)
            .await
    }

    /// Read `key`, fetching if the data is older than `stale_time`.
    ///
    /// Joins a fetch already in flight instead of starting another. Returns
    /// `Ok(None)` if the entry was evicted before its fetch completed.
    pub async fn fetch_query_with(
        &self,
        key: &QueryKey,
        stale_time: Duration,
    ) -> CacheResult<Option<Value>> {
        let fetcher = self.inner.fetcher()?;
        let plan = {
            let mut entries = self.inner.entries()?;
            match entries.get_mut(key) {
                Some(slot) if slot.snapshot(key).is_fresh_within(stale_time) => {
                    ReadPlan::Hit(slot.data.clone().unwrap_or(Value::Null))
                }
                Some(slot) if slot.in_flight => ReadPlan::Wait(self.inner.changes.subscribe()),
                Some(slot) => {
                    if fetcher.is_none() {
                        return Err(CacheError::NoFetcher { key: key.clone() });
                    }
                    slot.in_flight = true;
                    slot.status = EntryStatus::Fetching;
                    ReadPlan::Start {
                        serial: slot.serial,
                        generation: slot.generation,
                    }
                }
                None => {
                    if fetcher.is_none() {
                        return Err(CacheError::NoFetcher { key: key.clone() });
                    }
                    let serial = self.inner.serial();
                    let mut slot = Slot::empty(serial);
                    slot.in_flight = true;
                    slot.status = EntryStatus::Fetching;
                    entries.insert(key.clone(), slot);
                    ReadPlan::Start {
                        serial,
                        generation: 0,
                    }
                }
            }
        };

        match plan {
            ReadPlan::Hit(data) => {
                bump(&self.inner.counters.hits, 1);
                Ok(Some(data))
            }
            ReadPlan::Wait(rx) => {
                bump(&self.inner.counters.misses, 1);
                self.wait_for(key, rx).await
            }
            ReadPlan::Start { serial, generation } => {
                bump(&self.inner.counters.misses, 1);
                let Some(fetcher) = fetcher else {
                    return Err(CacheError::NoFetcher { key: key.clone() });
                };
                match self
                    .inner
                    .run_fetch(fetcher, key.clone(), serial, generation)
                    .await
                {
                    Completion::Stored(data) => Ok(Some(data)),
                    Completion::Failed(reason) => Err(CacheError::Fetch {
                        key: key.clone(),
                        reason,
                    }),
                    Completion::Dropped | Completion::Refetch { .. } => Ok(None),
                }
            }
        }
    }

    /// Load `key` into the cache unless it is fresh within `stale_time`.
    pub async fn prefetch(&self, key: &QueryKey, stale_time: Duration) -> CacheResult<()> {
        self.fetch_query_with(key, stale_time).await.map(|_| ())
    }

    async fn wait_for(
        &self,
        key: &QueryKey,
        mut rx: broadcast::Receiver<CacheChange>,
    ) -> CacheResult<Option<Value>> {
        loop {
            match rx.recv().await {
                Ok(CacheChange::Updated { key: changed }) if &changed == key => {
                    return self.get_data(key);
                }
                Ok(CacheChange::Evicted { key: changed }) if &changed == key => return Ok(None),
                Ok(CacheChange::FetchFailed {
                    key: changed,
                    reason,
                }) if &changed == key => {
                    return Err(CacheError::Fetch {
                        key: key.clone(),
                        reason,
                    });
                }
                Ok(_) => continue,
                Err(_) => return self.get_data(key),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Observers and stats
    // ------------------------------------------------------------------------

    /// Mark `key` as actively consumed until the returned guard is dropped.
    pub fn observe(&self, key: QueryKey) -> CacheResult<QueryObserver> {
        *self.inner.observers()?.entry(key.clone()).or_insert(0) += 1;
        Ok(QueryObserver {
            key,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of live observers for exactly `key`.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .observers()
            .map(|o| o.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
            coalesced_refetches: c.coalesced_refetches.load(Ordering::Relaxed),
            dropped_results: c.dropped_results.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }
}

/// Keeps one cache key observed while alive.
///
/// Only observed entries are refetched when invalidated; unobserved entries
/// are just marked stale and refetched on their next read.
pub struct QueryObserver {
    key: QueryKey,
    inner: Arc<Inner>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Snapshot of the observed entry.
    pub fn entry(&self) -> CacheResult<Option<CacheEntry>> {
        Ok(self
            .inner
            .entries()?
            .get(&self.key)
            .map(|slot| slot.snapshot(&self.key)))
    }
}

impl std::fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver").field("key", &self.key).finish()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        if let Ok(mut observers) = self.inner.observers.lock() {
            if let Some(count) = observers.get_mut(&self.key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    observers.remove(&self.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use ship_core::{keys, ProjectId};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Fetcher that blocks each call until a permit is released and returns
    /// the call number.
    struct GatedFetcher {
        calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    impl GatedFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                fail: false,
            })
        }

        fn open() -> Arc<Self> {
            let fetcher = Self::new();
            fetcher.gate.add_permits(1_000);
            fetcher
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(1_000),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryFetcher for GatedFetcher {
        async fn fetch(&self, _key: &QueryKey) -> Result<Value, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| FetchError::new(e.to_string()))?;
            permit.forget();
            if self.fail {
                return Err(FetchError::new("boom"));
            }
            Ok(json!({ "call": n }))
        }
    }

    async fn settle(cache: &QueryCache, key: &QueryKey) {
        for _ in 0..200 {
            if cache.status(key).unwrap() != Some(EntryStatus::Fetching) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("entry {} never settled", key);
    }

    fn cache_with(fetcher: Arc<GatedFetcher>) -> QueryCache {
        QueryCache::with_fetcher(CacheConfig::default(), fetcher)
    }

    #[test]
    fn test_set_and_update_data() {
        let cache = QueryCache::new(CacheConfig::default());
        let key = keys::project(&ProjectId::new("abc"));
        cache.set_data(key.clone(), json!({"voteCount": 5})).unwrap();

        let patched = cache
            .update_data(&key, |v| {
                v["voteCount"] = json!(6);
                "ok"
            })
            .unwrap();
        assert_eq!(patched, Some("ok"));
        assert_eq!(cache.get_data(&key).unwrap(), Some(json!({"voteCount": 6})));
        assert_eq!(cache.status(&key).unwrap(), Some(EntryStatus::Fresh));
    }

    #[test]
    fn test_update_missing_key_is_noop() {
        let cache = QueryCache::new(CacheConfig::default());
        let called = cache.update_data(&keys::projects(), |_| ()).unwrap();
        assert!(called.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_upsert_seeds_missing_entry() {
        let cache = QueryCache::new(CacheConfig::default());
        let key = keys::messages().with("conversation").with("u2");
        cache
            .upsert_data(&key, || json!([]), |v| {
                if let Some(list) = v.as_array_mut() {
                    list.push(json!("hi"));
                }
            })
            .unwrap();
        assert_eq!(cache.get_data(&key).unwrap(), Some(json!(["hi"])));
    }

    #[test]
    fn test_invalidate_unobserved_marks_stale_without_fetch() {
        let fetcher = GatedFetcher::open();
        let cache = cache_with(fetcher.clone());
        cache.set_data(keys::feed("hot", 1), json!([])).unwrap();
        cache.set_data(keys::feed("new", 1), json!([])).unwrap();
        cache.set_data(keys::leaderboard(), json!([])).unwrap();

        assert_eq!(cache.invalidate(&keys::projects()).unwrap(), 2);
        assert_eq!(
            cache.status(&keys::feed("hot", 1)).unwrap(),
            Some(EntryStatus::Stale)
        );
        assert_eq!(
            cache.status(&keys::leaderboard()).unwrap(),
            Some(EntryStatus::Fresh)
        );
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn test_evict_by_prefix() {
        let cache = QueryCache::new(CacheConfig::default());
        cache.set_data(keys::feed("hot", 1), json!([])).unwrap();
        cache.set_data(keys::feed("top", 1), json!([])).unwrap();
        cache
            .set_data(keys::project(&ProjectId::new("a")), json!({}))
            .unwrap();

        assert_eq!(cache.evict(&keys::projects()).unwrap(), 2);
        assert_eq!(cache.keys().unwrap(), vec![keys::project(&ProjectId::new("a"))]);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test]
    async fn test_observed_invalidation_refetches() {
        let fetcher = GatedFetcher::open();
        let cache = cache_with(fetcher.clone());
        let key = keys::project(&ProjectId::new("abc"));
        cache.set_data(key.clone(), json!({"call": 0})).unwrap();
        let _observer = cache.observe(key.clone()).unwrap();

        cache.invalidate(&key).unwrap();
        settle(&cache, &key).await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.get_data(&key).unwrap(), Some(json!({"call": 1})));
        assert_eq!(cache.status(&key).unwrap(), Some(EntryStatus::Fresh));
    }

    #[tokio::test]
    async fn test_invalidations_during_fetch_coalesce() {
        let fetcher = GatedFetcher::new();
        let cache = cache_with(fetcher.clone());
        let key = keys::feed("hot", 1);
        cache.set_data(key.clone(), json!({"call": 0})).unwrap();
        let _observer = cache.observe(key.clone()).unwrap();

        cache.invalidate(&keys::projects()).unwrap();
        tokio::task::yield_now().await;
        cache.invalidate(&keys::projects()).unwrap();
        cache.invalidate(&keys::projects()).unwrap();

        fetcher.gate.add_permits(10);
        settle(&cache, &key).await;

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.stats().coalesced_refetches, 1);
        assert_eq!(cache.get_data(&key).unwrap(), Some(json!({"call": 2})));
        assert_eq!(cache.status(&key).unwrap(), Some(EntryStatus::Fresh));
    }

    #[tokio::test]
    async fn test_eviction_discards_in_flight_result() {
        let fetcher = GatedFetcher::new();
        let cache = cache_with(fetcher.clone());
        let key = keys::project(&ProjectId::new("abc"));
        cache.set_data(key.clone(), json!({"title": "old"})).unwrap();
        let _observer = cache.observe(key.clone()).unwrap();

        cache.invalidate(&key).unwrap();
        tokio::task::yield_now().await;
        cache.evict(&key).unwrap();

        fetcher.gate.add_permits(1);
        for _ in 0..50 {
            if cache.stats().dropped_results == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(cache.stats().dropped_results, 1);
        assert_eq!(cache.get(&key).unwrap(), None);
    }

    #[tokio::test]
    async fn test_recreated_entry_ignores_older_fetch() {
        let fetcher = GatedFetcher::new();
        let cache = cache_with(fetcher.clone());
        let key = keys::project(&ProjectId::new("abc"));
        cache.set_data(key.clone(), json!({"v": 1})).unwrap();
        let _observer = cache.observe(key.clone()).unwrap();

        cache.invalidate(&key).unwrap();
        tokio::task::yield_now().await;
        cache.evict(&key).unwrap();
        cache.set_data(key.clone(), json!({"v": 2})).unwrap();

        fetcher.gate.add_permits(1);
        for _ in 0..50 {
            if cache.stats().dropped_results == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.get_data(&key).unwrap(), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_fetch_query_hit_and_miss() {
        let fetcher = GatedFetcher::open();
        let cache = cache_with(fetcher.clone());
        let key = keys::leaderboard_projects(50);

        let first = cache.fetch_query(&key).await.unwrap();
        let second = cache.fetch_query(&key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_fetch() {
        let fetcher = GatedFetcher::new();
        let cache = cache_with(fetcher.clone());
        let key = keys::conversations();

        let a = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.fetch_query(&key).await })
        };
        let b = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.fetch_query(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fetcher.gate.add_permits(10);

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a, Some(json!({"call": 1})));
        assert_eq!(a, b);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_stale() {
        let cache = cache_with(GatedFetcher::failing());
        let key = keys::intros_sent();
        let mut changes = cache.subscribe();

        let err = cache.fetch_query(&key).await.unwrap_err();
        assert_eq!(
            err,
            CacheError::Fetch {
                key: key.clone(),
                reason: "boom".to_string()
            }
        );
        assert_eq!(cache.status(&key).unwrap(), Some(EntryStatus::Stale));
        assert_eq!(cache.stats().fetch_failures, 1);
        assert!(matches!(
            changes.recv().await.unwrap(),
            CacheChange::FetchFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_fetch_without_fetcher() {
        let cache = QueryCache::new(CacheConfig::default());
        let err = cache.fetch_query(&keys::projects()).await.unwrap_err();
        assert!(matches!(err, CacheError::NoFetcher { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_observer_drop_releases_key() {
        let cache = QueryCache::new(CacheConfig::default());
        let key = keys::intros_received();
        let a = cache.observe(key.clone()).unwrap();
        let b = cache.observe(key.clone()).unwrap();
        assert_eq!(cache.observer_count(&key), 2);
        drop(a);
        assert_eq!(cache.observer_count(&key), 1);
        drop(b);
        assert_eq!(cache.observer_count(&key), 0);
    }

    fn segment() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["projects", "project", "hot", "new", "a", "b"])
            .prop_map(str::to_string)
    }

    fn key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(segment(), 1..4).prop_map(|s| s.into_iter().collect::<QueryKey>())
    }

    proptest! {
        #[test]
        fn prop_invalidate_matches_exactly_the_prefixed_keys(
            stored in prop::collection::hash_set(key(), 0..12),
            prefix in prop::collection::vec(segment(), 0..3),
        ) {
            let cache = QueryCache::new(CacheConfig::default());
            for k in &stored {
                cache.set_data(k.clone(), json!(null)).unwrap();
            }
            let prefix: QueryKey = prefix.into_iter().collect();
            let expected = stored.iter().filter(|k| k.starts_with(&prefix)).count();

            prop_assert_eq!(cache.invalidate(&prefix).unwrap(), expected);
            prop_assert_eq!(cache.evict(&prefix).unwrap(), expected);
            prop_assert_eq!(cache.len(), stored.len() - expected);
            for k in cache.keys().unwrap() {
                prop_assert!(!k.starts_with(&prefix));
            }
        }
    }
}
