//! Cached, paced, rate-limited lookups.
//!
//! A [`GuardedLookup`] is what the sponsorship and SOC-code features sit on: a cache
//! miss joins or starts one fetch per key, that fetch waits for a slot in the batch
//! scheduler, asks the limiter for permission, and only then calls the network.
//! Denials and failures are returned to every joined caller but never cached.

use crate::batch::BatchScheduler;
use crate::cache::CacheStore;
use crate::config::BatchConfig;
use crate::error::{FetchError, LookupError};
use crate::rate_limit::RateLimiter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How long a successful lookup is reused.
pub const LOOKUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache → scheduler → limiter → fetch, for one rate-limited endpoint.
#[derive(Debug, Clone)]
pub struct GuardedLookup<V> {
    endpoint: Arc<str>,
    limiter: RateLimiter,
    scheduler: BatchScheduler,
    cache: CacheStore<V>,
    ttl: Duration,
}

impl<V> GuardedLookup<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// `name` labels the cache in logs and telemetry.
    pub fn new(
        name: &'static str,
        endpoint: impl Into<Arc<str>>,
        limiter: RateLimiter,
        scheduler: BatchScheduler,
        ttl: Duration,
    ) -> Self {
        let cache = CacheStore::from_parts(name, limiter.clock(), limiter.sink());
        limiter.track_cache(&cache);
        Self {
            cache,
            endpoint: endpoint.into(),
            limiter,
            scheduler,
            ttl,
        }
    }

    /// Employer sponsorship lookups (`sponsor-lookup`, 100 ms between batches).
    pub fn sponsor(limiter: RateLimiter) -> Self {
        let scheduler = BatchScheduler::new(BatchConfig::sponsor_lookups());
        Self::new("sponsor", "sponsor-lookup", limiter, scheduler, LOOKUP_TTL)
    }

    /// SOC-code matching (`soc-lookup`, 50 ms between batches).
    pub fn soc_code(limiter: RateLimiter) -> Self {
        let scheduler = BatchScheduler::new(BatchConfig::soc_lookups());
        Self::new("soc", "soc-lookup", limiter, scheduler, LOOKUP_TTL)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Look up `key`, calling `fetch` only on a cache miss with no fetch in flight and
    /// only if the limiter admits the request.
    pub async fn lookup<F, Fut, E>(&self, key: impl Into<String>, fetch: F) -> Result<V, LookupError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let limiter = self.limiter.clone();
        let scheduler = self.scheduler.clone();
        let endpoint = Arc::clone(&self.endpoint);

        let guarded = move || {
            let queued = scheduler.add(async move {
                let decision = match limiter.check(&endpoint).await {
                    Ok(decision) => decision,
                    Err(err) => return Err(LookupError::Config(err)),
                };
                if !decision.is_allowed() {
                    tracing::debug!(endpoint = %endpoint, "lookup throttled");
                    return Err(LookupError::Throttled(decision));
                }
                fetch().await.map_err(|err| LookupError::Fetch(FetchError::failed(err)))
            });
            async move { queued.await.unwrap_or_else(|err| Err(LookupError::from(err))) }
        };

        self.cache.get_or_fetch(key, guarded, self.ttl).await.map_err(|err| {
            match err.downcast_ref::<LookupError>() {
                Some(inner) => inner.clone(),
                None => LookupError::Fetch(err),
            }
        })
    }

    /// Look up many keys concurrently; results are returned in input order.
    pub async fn lookup_many<I, K, F, Fut, E>(
        &self,
        keys: I,
        fetch: F,
    ) -> Vec<(String, Result<V, LookupError>)>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let lookups = keys.into_iter().map(|key| {
            let key: String = key.into();
            let fut = fetch(key.clone());
            async move {
                let result = self.lookup(key.clone(), move || fut).await;
                (key, result)
            }
        });
        futures::future::join_all(lookups).await
    }

    /// Drop the cached result for `key` so the next lookup fetches again.
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    pub fn cache(&self) -> &CacheStore<V> {
        &self.cache
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }
}
