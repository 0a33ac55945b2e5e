use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ratewarden::{
    AuthorityError, LimiterConfig, OfflineAuthority, RateLimitAuthority, RateLimitConfig,
    RateLimiter, ServerVerdict, SubscriptionSource, WindowTracker,
};
use serde_json::{json, Value};

// Subscription lookup that answers immediately.
#[derive(Debug)]
struct FreePlan;

#[async_trait]
impl SubscriptionSource for FreePlan {
    async fn fetch_status(&self) -> Result<Value, AuthorityError> {
        Ok(json!({"plan": "free"}))
    }
}

// Authority that always confirms.
#[derive(Debug)]
struct AlwaysAllow;

#[async_trait]
impl RateLimitAuthority for AlwaysAllow {
    async fn confirm(&self, _endpoint: &str) -> Result<ServerVerdict, AuthorityError> {
        Ok(ServerVerdict::allow())
    }
}

fn window_tracker_evaluate_commit(c: &mut Criterion) {
    let tracker = WindowTracker::new(&LimiterConfig::default());
    // Large enough that the hot path never denies.
    let policy = RateLimitConfig::per_minute(1_000_000);
    let mut now = 0u64;

    c.bench_function("window_tracker_evaluate_commit", |b| {
        b.iter(|| {
            now += 1;
            let evaluation = tracker.evaluate(black_box("job-add"), &policy, now);
            if evaluation.allowed {
                black_box(tracker.commit("job-add", &policy, now));
            }
        });
    });
}

fn window_tracker_denied(c: &mut Criterion) {
    let tracker = WindowTracker::new(&LimiterConfig::default());
    let policy = RateLimitConfig::per_minute(3);
    for t in 0..3 {
        tracker.commit("ai-resume", &policy, t);
    }

    c.bench_function("window_tracker_denied_window", |b| {
        b.iter(|| black_box(tracker.evaluate(black_box("ai-resume"), &policy, 10)));
    });
}

fn limiter_check_server_confirmed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::builder(AlwaysAllow, FreePlan).build();

    c.bench_function("limiter_check_server_confirmed", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(limiter.check(black_box("general")).await);
            limiter.reset("general");
        });
    });
}

fn limiter_check_fail_open(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::builder(OfflineAuthority, FreePlan).build();

    c.bench_function("limiter_check_fail_open", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(limiter.check(black_box("general")).await);
            limiter.reset("general");
        });
    });
}

criterion_group!(
    benches,
    window_tracker_evaluate_commit,
    window_tracker_denied,
    limiter_check_server_confirmed,
    limiter_check_fail_open
);
criterion_main!(benches);
