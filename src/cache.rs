//! TTL cache with in-flight request deduplication.
//!
//! Semantics of [`CacheStore::get_or_fetch`]:
//! - A live entry is returned without calling the fetch function.
//! - If a fetch for the same key is already outstanding, the caller joins it and receives
//!   the same result (at most one concurrent fetch per key).
//! - Otherwise a new fetch is started on the tokio runtime and registered as outstanding.
//!   It runs to completion even if every caller goes away, stores its value on success,
//!   and is deregistered whether it succeeds, fails, or panics, so a failure never wedges
//!   the key.
//!
//! Failures are never cached.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::FetchError;
use crate::telemetry::{CacheOutcome, LimiterEvent, SharedSink, TelemetrySink};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

type PendingFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: u64,
}

enum Lookup<V> {
    Hit(V),
    Pending(PendingFetch<V>),
}

struct InFlight<V> {
    generation: u64,
    pending: PendingFetch<V>,
}

struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    next_generation: u64,
}

struct Inner<V> {
    name: &'static str,
    state: Mutex<State<V>>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
}

impl<V> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Expiry purge over a cache of any value type, for the limiter's sweeper.
trait ExpiringCache: Send + Sync {
    fn name(&self) -> &'static str;

    fn purge_expired(&self) -> usize;
}

impl<V: Send + Sync> ExpiringCache for Inner<V> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.expires_at > now);
        before - state.entries.len()
    }
}

/// Keyed TTL cache. Clones share entries and in-flight fetches.
pub struct CacheStore<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CacheStore")
            .field("name", &self.inner.name)
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

/// Caches purged together by the limiter's sweeper. Holds no strong references.
#[derive(Default)]
pub(crate) struct CacheRegistry {
    caches: Mutex<Vec<Weak<dyn ExpiringCache>>>,
}

impl CacheRegistry {
    pub(crate) fn track<V>(&self, cache: &CacheStore<V>)
    where
        V: Clone + Send + Sync + 'static,
    {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner).push(cache.downgrade());
    }

    /// Purge every live cache and forget dropped ones. Returns the total entries removed.
    pub(crate) fn purge_expired(&self) -> usize {
        let live: Vec<Arc<dyn ExpiringCache>> = {
            let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
            caches.retain(|weak| weak.strong_count() > 0);
            caches.iter().filter_map(Weak::upgrade).collect()
        };
        live.iter()
            .map(|cache| {
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::trace!(cache = cache.name(), purged, "purged expired cache entries");
                }
                purged
            })
            .sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry").field("caches", &self.len()).finish()
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache on the wall clock. `name` labels telemetry.
    pub fn new(name: &'static str) -> Self {
        Self::with_clock(name, SystemClock)
    }

    pub fn with_clock<C: Clock + 'static>(name: &'static str, clock: C) -> Self {
        Self::from_parts(name, Arc::new(clock), SharedSink::default())
    }

    pub(crate) fn from_parts(name: &'static str, clock: Arc<dyn Clock>, sink: SharedSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_generation: 0,
                }),
                clock,
                sink,
            }),
        }
    }

    /// Route cache hit/miss/join events to `sink`.
    ///
    /// Only valid before the cache is shared; clones made earlier keep the old sink.
    pub fn with_sink<S>(self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let name = self.inner.name;
        let clock = Arc::clone(&self.inner.clock);
        Self::from_parts(name, clock, SharedSink::new(sink))
    }

    /// Live value for `key`. An expired entry is removed on read.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.inner.clock.now_millis();
        let mut state = self.inner.lock();
        live_value(&mut state, key, now)
    }

    /// Store `value` for `ttl`, replacing any existing entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = self.inner.clock.now_millis().saturating_add(duration_millis(ttl));
        self.inner.lock().entries.insert(key.into(), CacheEntry { value, expires_at });
    }

    /// Drop the entry for `key` and forget any outstanding fetch for it.
    ///
    /// A fetch that was in flight still completes for the callers already joined on it,
    /// but its result is not stored.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        let had_entry = state.entries.remove(key).is_some();
        let had_fetch = state.in_flight.remove(key).is_some();
        had_entry || had_fetch
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.in_flight.clear();
    }

    /// Remove all expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        ExpiringCache::purge_expired(&*self.inner)
    }

    /// Handle for periodic purging that does not keep the cache alive.
    fn downgrade(&self) -> Weak<dyn ExpiringCache> {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        weak
    }

    /// Number of stored entries, including ones that expired but were not read since.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Return the cached value or run `fetch` once for all concurrent callers of `key`.
    ///
    /// Must be called within a tokio runtime.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: impl Into<String>,
        fetch: F,
        ttl: Duration,
    ) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = key.into();
        let now = self.inner.clock.now_millis();

        let (pending, outcome) = {
            let mut state = self.inner.lock();
            match live_value(&mut state, &key, now) {
                Some(value) => (Lookup::Hit(value), CacheOutcome::Hit),
                None => match state.in_flight.get(&key) {
                    Some(flight) => (Lookup::Pending(flight.pending.clone()), CacheOutcome::Joined),
                    None => {
                        let generation = state.next_generation;
                        state.next_generation += 1;

                        let pending = self.start_fetch(key.clone(), generation, fetch, ttl);
                        state
                            .in_flight
                            .insert(key.clone(), InFlight { generation, pending: pending.clone() });
                        (Lookup::Pending(pending), CacheOutcome::Miss)
                    }
                },
            }
        };

        if let (Lookup::Pending(pending), CacheOutcome::Miss) = (&pending, outcome) {
            // Drive the fetch independently of this caller.
            tokio::spawn(pending.clone().map(|_| ()));
        }

        self.record(&key, outcome).await;
        match pending {
            Lookup::Hit(value) => Ok(value),
            Lookup::Pending(pending) => pending.await,
        }
    }

    fn start_fetch<F, Fut, E>(
        &self,
        key: String,
        generation: u64,
        fetch: F,
        ttl: Duration,
    ) -> PendingFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            let result = match AssertUnwindSafe(async move { fetch().await }).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(FetchError::failed(err)),
                Err(_) => Err(FetchError::Aborted),
            };

            let now = inner.clock.now_millis();
            let mut state = inner.lock();
            let current = state.in_flight.get(&key).is_some_and(|f| f.generation == generation);
            if current {
                state.in_flight.remove(&key);
                if let Ok(value) = &result {
                    let expires_at = now.saturating_add(duration_millis(ttl));
                    state.entries.insert(key, CacheEntry { value: value.clone(), expires_at });
                }
            } else {
                tracing::debug!(cache = inner.name, key = %key, "discarding result of invalidated fetch");
            }
            result
        }
        .boxed()
        .shared()
    }

    async fn record(&self, key: &str, outcome: CacheOutcome) {
        tracing::trace!(cache = self.inner.name, key, ?outcome, "cache access");
        self.inner
            .sink
            .emit(LimiterEvent::Cache { cache: self.inner.name, key: key.to_string(), outcome })
            .await;
    }
}

fn live_value<V: Clone>(state: &mut State<V>, key: &str, now: u64) -> Option<V> {
    match state.entries.get(key) {
        Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
        Some(_) => {
            state.entries.remove(key);
            None
        }
        None => None,
    }
}
