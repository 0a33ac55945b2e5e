#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratewarden
//!
//! Client-side guard rails for calls to a rate-limited backend.
//!
//! ## Features
//!
//! - **Tiered policies**: per-endpoint, per-subscription-tier quotas with generic
//!   fallbacks, live-updatable at runtime
//! - **Sliding window + burst detection** with sticky violation counting and a fixed
//!   lockout after repeated abuse
//! - **Server reconciliation**: every locally permitted request is confirmed with the
//!   backend's own limiter under a deadline, failing open when it is unreachable
//! - **TTL cache with in-flight deduplication**: concurrent lookups of one key share a
//!   single fetch
//! - **Paced batch execution** bounding how many lookups are in flight at once
//! - **Tower integration**: [`RateLimitLayer`] gates any service, and telemetry sinks
//!   are `tower::Service`s
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use ratewarden::{AuthorityError, OfflineAuthority, RateLimiter, SubscriptionSource};
//! use serde_json::{json, Value};
//!
//! #[derive(Debug)]
//! struct Premium;
//!
//! #[async_trait]
//! impl SubscriptionSource for Premium {
//!     async fn fetch_status(&self) -> Result<Value, AuthorityError> {
//!         Ok(json!({ "plan": "premium", "status": "active" }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     // With the authority unreachable every decision fails open on local state.
//!     let limiter = RateLimiter::builder(OfflineAuthority, Premium).build();
//!
//!     let decision = limiter.check("job-add").await.unwrap();
//!     assert!(decision.is_allowed());
//!     assert_eq!(decision.remaining(), 99);
//! }
//! ```

#[cfg(not(any(feature = "arc-swap", feature = "adaptive-rwlock")))]
compile_error!("enable either the `arc-swap` or the `adaptive-rwlock` feature");

pub mod adaptive;
pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod lookup;
pub mod notice;
pub mod prelude;
pub mod rate_limit;
pub mod sleeper;
pub mod storage;
pub mod telemetry;
pub mod tier;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use batch::BatchScheduler;
pub use cache::CacheStore;
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{BatchConfig, LimiterConfig, LimiterConfigBuilder};
pub use error::{
    AuthorityError, ConfigError, FetchError, LookupError, SchedulerError, StorageError,
};
#[cfg(feature = "http")]
pub use http::{HttpBackend, HttpConfig, StaticToken, TokenProvider};
pub use lookup::{GuardedLookup, LOOKUP_TTL};
pub use notice::NoticeGate;
pub use rate_limit::{
    Decision, DenyReason, EndpointPolicy, EndpointState, EndpointStatus, OfflineAuthority,
    PolicyTable, RateLimitAuthority, RateLimitConfig, RateLimitError, RateLimitLayer,
    RateLimitService, RateLimiter, RateLimiterBuilder, ServerVerdict, SweeperHandle,
    VerdictSource, WindowTracker,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use storage::{InMemoryStore, KeyValueStore, Record};
pub use telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use tier::{SubscriptionSource, SubscriptionStatus, Tier, TierResolver, TierSnapshot, TierSource};
pub use timeout::TimeoutPolicy;
