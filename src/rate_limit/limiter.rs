//! The rate-limit decision service.
//!
//! [`RateLimiter::check`] runs the full pipeline for one candidate request:
//!
//! 1. resolve the caller's tier (cached, shared between concurrent callers),
//! 2. resolve the `(endpoint, tier)` policy,
//! 3. evaluate the local window, burst sub-window, and lock,
//! 4. if locally permitted, confirm with the remote authority under a deadline,
//! 5. merge the verdict and, when admitted, count the request locally.
//!
//! The local state is only updated after the remote round trip, so two callers that
//! pass the local check before either commits may both be admitted.

use crate::adaptive::DynamicConfig;
use crate::cache::{CacheRegistry, CacheStore};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{AuthorityError, ConfigError};
use crate::rate_limit::authority::{RateLimitAuthority, ServerVerdict};
use crate::rate_limit::policy::{PolicyTable, RateLimitConfig};
use crate::rate_limit::window::{EndpointStatus, LocalEvaluation, WindowTracker};
use crate::rate_limit::{Decision, DenyReason, VerdictSource};
use crate::storage::{InMemoryStore, KeyValueStore, Record};
use crate::telemetry::{LimiterEvent, SharedSink, TelemetrySink};
use crate::tier::{SubscriptionSource, Tier, TierResolver};
use crate::timeout::TimeoutPolicy;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

/// Storage key set while the remote authority is unreachable (value: ms timestamp).
pub const SERVER_UNAVAILABLE_KEY: &str = "rateLimitServerUnavailableAt";

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_OK: u8 = 1;
const HEALTH_DEGRADED: u8 = 2;

/// Client-side rate limiter. Clones share all state.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Debug)]
struct LimiterInner {
    config: LimiterConfig,
    policies: DynamicConfig<PolicyTable>,
    tiers: TierResolver,
    windows: WindowTracker,
    authority: Arc<dyn RateLimitAuthority>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
    server_timeout: TimeoutPolicy,
    health: AtomicU8,
    caches: CacheRegistry,
    sweeper: Mutex<Option<AbortHandle>>,
}

/// Builder for [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimiterBuilder {
    authority: Arc<dyn RateLimitAuthority>,
    subscriptions: Arc<dyn SubscriptionSource>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    policies: PolicyTable,
    config: LimiterConfig,
    sink: SharedSink,
}

impl RateLimiterBuilder {
    /// Persistent store for the tier snapshot and health marker. Default: in-memory.
    pub fn store<K: KeyValueStore + 'static>(mut self, store: K) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Time source. Default: [`SystemClock`], so persisted timestamps survive restarts.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Initial policy table. Default: [`PolicyTable::builtin`].
    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn config(mut self, config: LimiterConfig) -> Self {
        self.config = config;
        self
    }

    /// Telemetry sink for [`LimiterEvent`]s. Default: discard.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.sink = SharedSink::new(sink);
        self
    }

    pub fn build(self) -> RateLimiter {
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let tiers = TierResolver::new(
            self.subscriptions,
            Arc::clone(&store),
            Arc::clone(&clock),
            self.config.tier_ttl(),
            self.config.status_timeout(),
            self.config.tier_retry_backoff(),
            self.sink.clone(),
        );
        let caches = CacheRegistry::default();
        caches.track(tiers.cache());

        RateLimiter {
            inner: Arc::new(LimiterInner {
                windows: WindowTracker::new(&self.config),
                server_timeout: TimeoutPolicy::new(self.config.server_timeout()),
                config: self.config,
                policies: DynamicConfig::new(self.policies),
                tiers,
                authority: self.authority,
                store,
                clock,
                sink: self.sink,
                health: AtomicU8::new(HEALTH_UNKNOWN),
                caches,
                sweeper: Mutex::new(None),
            }),
        }
    }
}

/// Periodic sweep task started by [`RateLimiter::spawn_sweeper`]. Dropping the handle
/// stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RateLimiter {
    pub fn builder<A, S>(authority: A, subscriptions: S) -> RateLimiterBuilder
    where
        A: RateLimitAuthority + 'static,
        S: SubscriptionSource + 'static,
    {
        RateLimiterBuilder {
            authority: Arc::new(authority),
            subscriptions: Arc::new(subscriptions),
            store: None,
            clock: None,
            policies: PolicyTable::builtin(),
            config: LimiterConfig::default(),
            sink: SharedSink::default(),
        }
    }

    /// May a request to `endpoint` proceed right now, at the caller's current tier?
    ///
    /// Throttling, lockouts, and server denials are `Ok(Decision::Denied { .. })`; only a
    /// missing or invalid policy is an error.
    pub async fn check(&self, endpoint: &str) -> Result<Decision, ConfigError> {
        let tier = self.inner.tiers.resolve().await;
        self.check_as(endpoint, tier).await
    }

    /// [`check`](Self::check) with an explicit tier instead of the resolved one.
    pub async fn check_as(&self, endpoint: &str, tier: Tier) -> Result<Decision, ConfigError> {
        let inner = &self.inner;
        let config = inner.policies.get().resolve(endpoint, tier)?;
        let now = inner.clock.now_millis();
        let local = inner.windows.evaluate(endpoint, &config, now);

        if !local.allowed {
            return Ok(self.local_denial(endpoint, local).await);
        }

        let verdict = inner.server_timeout.execute(|| inner.authority.confirm(endpoint)).await;
        let decision = match verdict {
            Ok(verdict) if verdict.allowed => {
                self.admit(endpoint, tier, &config, &local, verdict).await
            }
            Ok(verdict) => self.server_denial(endpoint, &config, verdict).await,
            Err(err) => self.fail_open(endpoint, tier, &config, &local, err).await,
        };
        Ok(decision)
    }

    /// The policy that applies to `endpoint`, at `tier` or the resolved tier.
    pub async fn resolve_policy(
        &self,
        endpoint: &str,
        tier: Option<Tier>,
    ) -> Result<RateLimitConfig, ConfigError> {
        let tier = match tier {
            Some(tier) => tier,
            None => self.inner.tiers.resolve().await,
        };
        self.inner.policies.get().resolve(endpoint, tier)
    }

    async fn local_denial(&self, endpoint: &str, local: LocalEvaluation) -> Decision {
        let reason = local.reason.unwrap_or(DenyReason::WindowExceeded);
        tracing::debug!(
            endpoint,
            reason = ?reason,
            reset_in_ms = duration_millis(local.reset_in),
            violations = local.violations,
            "request throttled locally"
        );
        self.emit(LimiterEvent::Throttled {
            endpoint: endpoint.to_string(),
            reason,
            reset_in: local.reset_in,
        })
        .await;

        match local.locked_for {
            Some(lock_for) => self.lock_engaged(endpoint, local.violations, lock_for).await,
            None => Decision::Denied { reason, reset_in: local.reset_in, retry_after: local.reset_in },
        }
    }

    async fn admit(
        &self,
        endpoint: &str,
        tier: Tier,
        config: &RateLimitConfig,
        local: &LocalEvaluation,
        verdict: ServerVerdict,
    ) -> Decision {
        let now = self.inner.clock.now_millis();
        let local_remaining = self.inner.windows.commit(endpoint, config, now);
        self.mark_server_healthy().await;

        let remaining = verdict.remaining.unwrap_or(local_remaining);
        let reset_in = verdict.reset_in().unwrap_or(local.reset_in);
        tracing::debug!(
            endpoint,
            tier = %tier,
            remaining,
            reset_in_ms = duration_millis(reset_in),
            "request admitted"
        );
        self.emit(LimiterEvent::Admitted {
            endpoint: endpoint.to_string(),
            tier,
            remaining,
            source: VerdictSource::Server,
        })
        .await;
        Decision::Allowed { remaining, reset_in, tier, source: VerdictSource::Server }
    }

    async fn server_denial(
        &self,
        endpoint: &str,
        config: &RateLimitConfig,
        verdict: ServerVerdict,
    ) -> Decision {
        let now = self.inner.clock.now_millis();
        self.mark_server_healthy().await;
        let violation = self.inner.windows.record_violation(endpoint, now);
        let retry_after =
            verdict.retry_after().or_else(|| verdict.reset_in()).unwrap_or_else(|| config.window());
        self.inner
            .windows
            .note_server_denial(endpoint, now.saturating_add(duration_millis(retry_after)));

        tracing::debug!(
            endpoint,
            retry_after_s = retry_after.as_secs(),
            violations = violation.violations,
            "request denied by server"
        );
        self.emit(LimiterEvent::ServerDenied { endpoint: endpoint.to_string(), retry_after })
            .await;

        match violation.locked_for {
            Some(lock_for) => self.lock_engaged(endpoint, violation.violations, lock_for).await,
            None => Decision::Denied {
                reason: DenyReason::ServerDenied,
                reset_in: verdict.reset_in().unwrap_or(retry_after),
                retry_after,
            },
        }
    }

    async fn lock_engaged(&self, endpoint: &str, violations: u32, lock_for: Duration) -> Decision {
        tracing::info!(
            endpoint,
            violations,
            lock_for_s = lock_for.as_secs(),
            "endpoint locked after repeated violations"
        );
        self.emit(LimiterEvent::LockedOut {
            endpoint: endpoint.to_string(),
            violations,
            lock_for,
        })
        .await;
        Decision::Denied { reason: DenyReason::LockedOut, reset_in: lock_for, retry_after: lock_for }
    }

    async fn fail_open(
        &self,
        endpoint: &str,
        tier: Tier,
        config: &RateLimitConfig,
        local: &LocalEvaluation,
        err: AuthorityError,
    ) -> Decision {
        let now = self.inner.clock.now_millis();
        tracing::warn!(endpoint, error = %err, "rate-limit server unavailable; failing open");
        self.mark_server_unavailable(now).await;
        let remaining = self.inner.windows.commit(endpoint, config, now);

        self.emit(LimiterEvent::FailedOpen { endpoint: endpoint.to_string(), error: err.to_string() })
            .await;
        self.emit(LimiterEvent::Admitted {
            endpoint: endpoint.to_string(),
            tier,
            remaining,
            source: VerdictSource::Local,
        })
        .await;
        Decision::Allowed { remaining, reset_in: local.reset_in, tier, source: VerdictSource::Local }
    }

    async fn mark_server_unavailable(&self, now: u64) {
        if self.inner.health.swap(HEALTH_DEGRADED, Ordering::AcqRel) == HEALTH_DEGRADED {
            return;
        }
        let record = Record::from([(SERVER_UNAVAILABLE_KEY.to_string(), Value::from(now))]);
        if let Err(err) = self.inner.store.set(record).await {
            tracing::warn!(error = %err, "failed to persist server health marker");
        }
    }

    async fn mark_server_healthy(&self) {
        // The first success also clears a marker left by an earlier process.
        if self.inner.health.swap(HEALTH_OK, Ordering::AcqRel) == HEALTH_OK {
            return;
        }
        if let Err(err) = self.inner.store.remove(&[SERVER_UNAVAILABLE_KEY]).await {
            tracing::warn!(error = %err, "failed to clear server health marker");
        }
    }

    /// Whether the most recent remote confirmation failed.
    pub fn server_degraded(&self) -> bool {
        self.inner.health.load(Ordering::Acquire) == HEALTH_DEGRADED
    }

    /// Monitoring snapshot of one endpoint, or `None` if it has never been used.
    pub fn status(&self, endpoint: &str) -> Option<EndpointStatus> {
        self.inner.windows.status(endpoint, self.inner.clock.now_millis())
    }

    /// Snapshots of every tracked endpoint, sorted by name.
    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        self.inner.windows.snapshot(self.inner.clock.now_millis())
    }

    /// Forget all state for `endpoint`, including violations and any lock.
    pub fn reset(&self, endpoint: &str) -> bool {
        let removed = self.inner.windows.reset(endpoint);
        if removed {
            tracing::info!(endpoint, "rate-limit state reset");
        }
        removed
    }

    pub fn reset_all(&self) {
        self.inner.windows.clear();
        tracing::info!("all rate-limit state reset");
    }

    /// Remove idle, unlocked endpoint state and purge expired entries from the tier cache
    /// and every lookup cache built on this limiter. Returns how many endpoint entries
    /// were dropped.
    pub async fn sweep(&self) -> usize {
        let purged = self.inner.caches.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "purged expired cache entries");
        }
        let removed = self.inner.windows.sweep(self.inner.clock.now_millis());
        if removed > 0 {
            tracing::debug!(removed, "swept idle rate-limit state");
            self.emit(LimiterEvent::Swept { removed }).await;
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle is dropped,
    /// [`dispose`](Self::dispose) is called, or every limiter clone is gone.
    ///
    /// Spawning a new sweeper stops the previous one.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                RateLimiter { inner }.sweep().await;
            }
        });

        let previous = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        SweeperHandle { task }
    }

    /// Stop the sweeper and drop all in-memory state (window state and tier snapshot).
    pub fn dispose(&self) {
        let sweeper = self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        self.inner.windows.clear();
        self.inner.tiers.clear();
        tracing::debug!("rate limiter disposed");
    }

    /// Live handle to the policy table; updates apply to the next decision.
    pub fn policies(&self) -> DynamicConfig<PolicyTable> {
        self.inner.policies.clone()
    }

    /// Replace the policy table. Entries are checked when they are resolved.
    pub fn set_policies(&self, policies: PolicyTable) {
        self.inner.policies.set(policies);
    }

    pub fn tiers(&self) -> &TierResolver {
        &self.inner.tiers
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    pub(crate) fn sink(&self) -> SharedSink {
        self.inner.sink.clone()
    }

    /// Include `cache` in every [`sweep`](Self::sweep).
    pub(crate) fn track_cache<V>(&self, cache: &CacheStore<V>)
    where
        V: Clone + Send + Sync + 'static,
    {
        self.inner.caches.track(cache);
    }

    async fn emit(&self, event: LimiterEvent) {
        self.inner.sink.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::OfflineAuthority;
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Default)]
    struct Scripted {
        fail: Arc<std::sync::atomic::AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RateLimitAuthority for Scripted {
        async fn confirm(&self, _endpoint: &str) -> Result<ServerVerdict, AuthorityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(AuthorityError::Status(503))
            } else {
                Ok(ServerVerdict::allow())
            }
        }
    }

    #[derive(Debug)]
    struct Plan(Value);

    #[async_trait]
    impl SubscriptionSource for Plan {
        async fn fetch_status(&self) -> Result<Value, AuthorityError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn health_marker_follows_server_availability() {
        let authority = Scripted::default();
        let store = InMemoryStore::with_record(Record::from([(
            SERVER_UNAVAILABLE_KEY.to_string(),
            json!(1),
        )]));
        let limiter = RateLimiter::builder(authority.clone(), Plan(json!({"plan": "free"})))
            .store(store.clone())
            .clock(ManualClock::starting_at(10_000))
            .build();

        // A stale marker from a previous process is cleared by the first success.
        assert!(limiter.check("general").await.unwrap().is_allowed());
        assert!(!store.dump().contains_key(SERVER_UNAVAILABLE_KEY));

        authority.fail.store(true, Ordering::SeqCst);
        let decision = limiter.check("general").await.unwrap();
        assert!(matches!(decision, Decision::Allowed { source: VerdictSource::Local, .. }));
        assert!(limiter.server_degraded());
        assert_eq!(store.dump().get(SERVER_UNAVAILABLE_KEY), Some(&json!(10_000)));

        authority.fail.store(false, Ordering::SeqCst);
        limiter.check("general").await.unwrap();
        assert!(!limiter.server_degraded());
        assert!(!store.dump().contains_key(SERVER_UNAVAILABLE_KEY));
    }

    #[tokio::test]
    async fn unknown_endpoint_without_generic_is_config_error() {
        let limiter = RateLimiter::builder(OfflineAuthority, Plan(json!({})))
            .policies(PolicyTable::empty())
            .build();
        let err = limiter.check_as("general", Tier::Free).await.unwrap_err();
        assert_eq!(err, ConfigError::UnknownEndpoint { endpoint: "general".into() });
    }

    #[tokio::test]
    async fn policy_updates_apply_to_next_decision() {
        let limiter = RateLimiter::builder(OfflineAuthority, Plan(json!({})))
            .clock(ManualClock::starting_at(0))
            .build();
        limiter
            .policies()
            .update(|table| table.clone().with_generic(RateLimitConfig::per_minute(2)));
        let config = limiter.resolve_policy("lockout-test", Some(Tier::Admin)).await.unwrap();
        assert_eq!(config.max_requests(), 2);
        assert_eq!(
            limiter.resolve_policy("ai-resume", None).await.unwrap().max_requests(),
            3,
            "unrecognized subscription shape resolves to free"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drops_idle_state() {
        let clock = ManualClock::starting_at(0);
        let sink = MemorySink::new();
        let config = LimiterConfig::builder()
            .sweep_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let limiter = RateLimiter::builder(Scripted::default(), Plan(json!({})))
            .clock(clock.clone())
            .config(config)
            .sink(sink.clone())
            .build();

        limiter.check_as("general", Tier::Free).await.unwrap();
        assert_eq!(limiter.snapshot().len(), 1);

        let handle = limiter.spawn_sweeper();
        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(limiter.snapshot().is_empty());
        assert_eq!(sink.count(|e| matches!(e, LimiterEvent::Swept { removed: 1 })), 1);

        limiter.dispose();
        for _ in 0..10 {
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());
        assert!(limiter.snapshot().is_empty());
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(Arc::clone(&self.0))
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_open_is_logged_once_per_call() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(SharedWriter(Arc::clone(&buffer)))
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let limiter = RateLimiter::builder(OfflineAuthority, Plan(json!({"plan": "free"})))
            .clock(ManualClock::starting_at(0))
            .build();
        assert!(limiter.check("job-add").await.unwrap().is_allowed());

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("failing open").count(), 1);
        assert!(logs.contains("job-add"));
    }
}
