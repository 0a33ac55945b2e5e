//! Subscription tier resolution.
//!
//! The tier decides which row of the policy table applies. It is resolved from the
//! backend's subscription-status lookup, cached for a TTL, persisted so a restarted
//! process can reuse it before its first network round trip, and falls back to
//! [`Tier::Free`] whenever the lookup fails or returns something unrecognizable.
//! After a failure the fallback is kept for a short back-off so an outage does not
//! put the status deadline in front of every check.

use crate::cache::CacheStore;
use crate::clock::{duration_millis, Clock};
use crate::error::{AuthorityError, StorageError};
use crate::storage::{KeyValueStore, Record};
use crate::telemetry::{LimiterEvent, SharedSink};
use crate::timeout::TimeoutPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Storage key holding the last resolved tier.
pub const TIER_KEY: &str = "tier";
/// Storage key holding when [`TIER_KEY`] was resolved (ms).
pub const TIER_RESOLVED_AT_KEY: &str = "tierResolvedAt";

const SNAPSHOT_KEY: &str = "subscription";

/// Subscription class of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Admin,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Premium, Tier::Admin];

    /// The tier used whenever the real one cannot be determined.
    pub const fn lowest() -> Tier {
        Tier::Free
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            "admin" => Ok(Tier::Admin),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Where a resolved tier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSource {
    /// Fresh subscription-status lookup.
    Network,
    /// Restored from storage left by an earlier process.
    Persisted,
    /// Lookup failed; lowest tier assumed.
    Fallback,
}

/// Classified subscription-status response.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionStatus {
    Admin,
    Premium { plan: String },
    /// Explicitly free, or a paid plan that is not currently active.
    Free,
    /// No known marker was present.
    Unknown(Value),
}

const PREMIUM_PLANS: &[&str] = &["premium", "pro", "plus", "paid"];
const ACTIVE_STATUSES: &[&str] = &["active", "trialing", "trial"];

impl SubscriptionStatus {
    /// Inspect a status payload. Fields are read from the top level, falling back to a
    /// nested `subscription` object.
    pub fn classify(payload: &Value) -> Self {
        let nested = payload.get("subscription").filter(|v| v.is_object());
        let field = |name: &str| payload.get(name).or_else(|| nested.and_then(|n| n.get(name)));
        let text = |name: &str| field(name).and_then(Value::as_str).map(str::to_ascii_lowercase);
        let flag = |name: &str| field(name).and_then(Value::as_bool);

        let plan = text("plan").or_else(|| text("tier"));
        let status = text("status");

        if flag("isAdmin") == Some(true)
            || flag("is_admin") == Some(true)
            || text("role").as_deref() == Some("admin")
            || plan.as_deref() == Some("admin")
        {
            return Self::Admin;
        }

        let active = match (&status, flag("isActive").or_else(|| flag("is_active"))) {
            (Some(s), _) => ACTIVE_STATUSES.contains(&s.as_str()),
            (None, Some(active)) => active,
            (None, None) => true,
        };

        let premium_flag = flag("isPremium").or_else(|| flag("is_premium"));
        match (plan, premium_flag) {
            (Some(plan), _) if PREMIUM_PLANS.contains(&plan.as_str()) => {
                if active {
                    Self::Premium { plan }
                } else {
                    Self::Free
                }
            }
            (_, Some(true)) if active => Self::Premium { plan: "premium".to_string() },
            (Some(plan), _) if plan == "free" => Self::Free,
            (_, Some(false)) => Self::Free,
            _ if status.is_some() && !active => Self::Free,
            _ => Self::Unknown(payload.clone()),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Self::Admin => Tier::Admin,
            Self::Premium { .. } => Tier::Premium,
            Self::Free | Self::Unknown(_) => Tier::lowest(),
        }
    }
}

/// Remote subscription-status lookup.
#[async_trait]
pub trait SubscriptionSource: Send + Sync + fmt::Debug {
    async fn fetch_status(&self) -> Result<Value, AuthorityError>;
}

/// A resolved tier and when it was resolved (ms on the resolver's clock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub tier: Tier,
    pub resolved_at: u64,
}

/// Resolves and caches the caller's tier. Clones share the snapshot.
#[derive(Clone, Debug)]
pub struct TierResolver {
    source: Arc<dyn SubscriptionSource>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    cache: CacheStore<TierSnapshot>,
    ttl: Duration,
    timeout: TimeoutPolicy,
    backoff: Duration,
    /// Clock time (ms) until which a failed lookup is not retried; 0 when clear.
    backoff_until: Arc<AtomicU64>,
    sink: SharedSink,
    hydrated: Arc<OnceCell<()>>,
}

impl TierResolver {
    pub(crate) fn new(
        source: Arc<dyn SubscriptionSource>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        timeout: Duration,
        backoff: Duration,
        sink: SharedSink,
    ) -> Self {
        Self {
            cache: CacheStore::from_parts("tier", Arc::clone(&clock), sink.clone()),
            source,
            store,
            clock,
            ttl,
            timeout: TimeoutPolicy::new(timeout),
            backoff,
            backoff_until: Arc::new(AtomicU64::new(0)),
            sink,
            hydrated: Arc::new(OnceCell::new()),
        }
    }

    pub(crate) fn cache(&self) -> &CacheStore<TierSnapshot> {
        &self.cache
    }

    /// Current tier. Never fails: any lookup problem resolves to [`Tier::lowest`].
    pub async fn resolve(&self) -> Tier {
        self.hydrate().await;

        if self.cache.get(SNAPSHOT_KEY).is_none() && self.backing_off() {
            tracing::trace!("subscription lookup backing off; assuming lowest tier");
            return Tier::lowest();
        }

        let resolver = self.clone();
        let fetched = self
            .cache
            .get_or_fetch(SNAPSHOT_KEY, move || async move { resolver.fetch().await }, self.ttl)
            .await;

        match fetched {
            Ok(snapshot) => snapshot.tier,
            Err(err) => {
                tracing::warn!(error = %err, "subscription lookup failed; assuming lowest tier");
                let until = self.clock.now_millis().saturating_add(duration_millis(self.backoff));
                self.backoff_until.store(until, Ordering::Release);
                self.sink
                    .emit(LimiterEvent::TierResolved {
                        tier: Tier::lowest(),
                        source: TierSource::Fallback,
                    })
                    .await;
                Tier::lowest()
            }
        }
    }

    fn backing_off(&self) -> bool {
        self.clock.now_millis() < self.backoff_until.load(Ordering::Acquire)
    }

    /// Cached snapshot, if one is still fresh.
    pub fn snapshot(&self) -> Option<TierSnapshot> {
        self.cache.get(SNAPSHOT_KEY)
    }

    /// Forget the cached and persisted tier, e.g. after the user changes plan.
    pub async fn invalidate(&self) {
        self.cache.invalidate(SNAPSHOT_KEY);
        self.backoff_until.store(0, Ordering::Release);
        if let Err(err) = self.store.remove(&[TIER_KEY, TIER_RESOLVED_AT_KEY]).await {
            tracing::warn!(error = %err, "failed to clear persisted tier");
        }
    }

    /// Drop the in-memory snapshot only.
    pub(crate) fn clear(&self) {
        self.cache.clear();
        self.backoff_until.store(0, Ordering::Release);
    }

    async fn fetch(&self) -> Result<TierSnapshot, AuthorityError> {
        let payload = self.timeout.execute(|| self.source.fetch_status()).await?;
        let status = SubscriptionStatus::classify(&payload);
        if let SubscriptionStatus::Unknown(_) = status {
            tracing::debug!("unrecognized subscription status shape; using lowest tier");
        }

        let snapshot = TierSnapshot { tier: status.tier(), resolved_at: self.clock.now_millis() };
        self.persist(snapshot).await;
        tracing::debug!(tier = %snapshot.tier, "subscription tier resolved");
        self.sink
            .emit(LimiterEvent::TierResolved { tier: snapshot.tier, source: TierSource::Network })
            .await;
        Ok(snapshot)
    }

    async fn persist(&self, snapshot: TierSnapshot) {
        let record = Record::from([
            (TIER_KEY.to_string(), Value::from(snapshot.tier.as_str())),
            (TIER_RESOLVED_AT_KEY.to_string(), Value::from(snapshot.resolved_at)),
        ]);
        if let Err(err) = self.store.set(record).await {
            tracing::warn!(error = %err, "failed to persist subscription tier");
        }
    }

    /// Seed the cache from storage once per resolver.
    async fn hydrate(&self) {
        self.hydrated
            .get_or_init(|| async {
                let snapshot = match self.load_persisted().await {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => return,
                    Err(err) => {
                        tracing::warn!(error = %err, "ignoring persisted tier");
                        return;
                    }
                };
                let age = self.clock.now_millis().saturating_sub(snapshot.resolved_at);
                let ttl = duration_millis(self.ttl);
                if age < ttl && snapshot.resolved_at <= self.clock.now_millis() {
                    self.cache.set(SNAPSHOT_KEY, snapshot, Duration::from_millis(ttl - age));
                    self.sink
                        .emit(LimiterEvent::TierResolved {
                            tier: snapshot.tier,
                            source: TierSource::Persisted,
                        })
                        .await;
                }
            })
            .await;
    }

    async fn load_persisted(&self) -> Result<Option<TierSnapshot>, StorageError> {
        let record = self.store.get(&[TIER_KEY, TIER_RESOLVED_AT_KEY]).await?;
        let (Some(tier), Some(resolved_at)) = (record.get(TIER_KEY), record.get(TIER_RESOLVED_AT_KEY))
        else {
            return Ok(None);
        };
        let tier = tier
            .as_str()
            .and_then(|t| t.parse::<Tier>().ok())
            .ok_or_else(|| corrupt(TIER_KEY, tier))?;
        let resolved_at = resolved_at.as_u64().ok_or_else(|| corrupt(TIER_RESOLVED_AT_KEY, resolved_at))?;
        Ok(Some(TierSnapshot { tier, resolved_at }))
    }
}

fn corrupt(key: &str, value: &Value) -> StorageError {
    StorageError::Corrupt { key: key.to_string(), reason: format!("unexpected value {value}") }
}
