//! Convenient re-exports for common ratewarden types.
pub use crate::{
    batch::BatchScheduler,
    cache::CacheStore,
    clock::{Clock, ManualClock, SystemClock},
    config::{BatchConfig, LimiterConfig},
    error::{ConfigError, LookupError},
    lookup::GuardedLookup,
    notice::NoticeGate,
    rate_limit::{
        Decision, DenyReason, OfflineAuthority, PolicyTable, RateLimitAuthority,
        RateLimitConfig, RateLimitLayer, RateLimiter, ServerVerdict,
    },
    storage::{InMemoryStore, KeyValueStore},
    tier::{SubscriptionSource, Tier},
};
