//! Compile-time prelude coverage test.
use ratewarden::prelude::*;
use serde_json::json;
use std::time::Duration;
use tower::{service_fn, ServiceExt};
use tower_layer::Layer;

#[derive(Debug)]
struct Admin;

#[async_trait::async_trait]
impl SubscriptionSource for Admin {
    async fn fetch_status(&self) -> Result<serde_json::Value, ratewarden::AuthorityError> {
        Ok(json!({"role": "admin"}))
    }
}

#[tokio::test]
async fn prelude_reexports_core_types() {
    let limiter = RateLimiter::builder(OfflineAuthority, Admin)
        .store(InMemoryStore::new())
        .clock(ManualClock::starting_at(0))
        .policies(PolicyTable::builtin())
        .config(LimiterConfig::default())
        .build();
    assert_eq!(limiter.tiers().resolve().await, Tier::Admin);

    let svc = RateLimitLayer::new(limiter.clone(), "general")
        .layer(service_fn(|_req: ()| async { Ok::<_, std::io::Error>(()) }));
    svc.oneshot(()).await.expect("service call failed");

    let _cache: CacheStore<u32> = CacheStore::new("prelude");
    let _scheduler = BatchScheduler::new(BatchConfig::default());
    let _lookup: GuardedLookup<u32> = GuardedLookup::sponsor(limiter);
    let _gate = NoticeGate::new(InMemoryStore::new(), SystemClock);
    let _policy = RateLimitConfig::new(10, Duration::from_secs(60).as_millis() as u64);
}
