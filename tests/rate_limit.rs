mod common;

use common::{Reply, ScriptedAuthority, ScriptedPlan};
use ratewarden::{
    AuthorityError, ConfigError, Decision, DenyReason, EndpointState, LimiterEvent, ManualClock,
    MemorySink, PolicyTable, RateLimitConfig, RateLimiter, ServerVerdict, Tier, VerdictSource,
};
use serde_json::json;
use std::time::Duration;

const START: u64 = 1_700_000_000_000;

fn free_plan() -> ScriptedPlan {
    ScriptedPlan::returning(json!({ "plan": "free" }))
}

fn limiter(authority: &ScriptedAuthority, clock: &ManualClock) -> RateLimiter {
    RateLimiter::builder(authority.clone(), free_plan()).clock(clock.clone()).build()
}

#[tokio::test]
async fn third_rapid_ai_resume_call_is_burst_denied() {
    let authority = ScriptedAuthority::allowing();
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    assert!(limiter.check("ai-resume").await.unwrap().is_allowed());
    assert!(limiter.check("ai-resume").await.unwrap().is_allowed());

    let third = limiter.check("ai-resume").await.unwrap();
    assert_eq!(third.reason(), Some(DenyReason::BurstExceeded));
    assert!(third.reset_in() <= Duration::from_millis(5_000));
    assert_eq!(authority.calls(), 2, "local denials never reach the server");
}

#[tokio::test]
async fn window_bound_holds_while_time_moves() {
    let authority = ScriptedAuthority::allowing();
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);
    let max = limiter.resolve_policy("ai-resume", None).await.unwrap().max_requests() as usize;

    let mut admitted = 0;
    for _ in 0..40 {
        if limiter.check("ai-resume").await.unwrap().is_allowed() {
            admitted += 1;
        }
        let status = limiter.status("ai-resume").unwrap();
        assert!(status.in_window <= max, "in_window {} > {max}", status.in_window);
        clock.advance(Duration::from_secs(6));
    }
    assert!(admitted > 0);
}

#[tokio::test]
async fn fourth_spaced_call_hits_the_window() {
    let authority = ScriptedAuthority::allowing();
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    for _ in 0..3 {
        assert!(limiter.check("ai-resume").await.unwrap().is_allowed());
        clock.advance(Duration::from_secs(6));
    }
    let fourth = limiter.check("ai-resume").await.unwrap();
    assert_eq!(fourth.reason(), Some(DenyReason::WindowExceeded));
    assert_eq!(limiter.status("ai-resume").unwrap().state, EndpointState::Throttled);

    // The first request leaves the window 60s after it was made.
    clock.advance(Duration::from_secs(43));
    assert!(limiter.check("ai-resume").await.unwrap().is_allowed());
}

#[tokio::test]
async fn five_server_denials_lock_without_a_sixth_call() {
    let authority = ScriptedAuthority::denying(30);
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    for attempt in 1..=4 {
        let decision = limiter.check("lockout-test").await.unwrap();
        assert_eq!(decision.reason(), Some(DenyReason::ServerDenied), "attempt {attempt}");
        assert_eq!(decision.retry_after(), Duration::from_secs(30));
    }
    let fifth = limiter.check("lockout-test").await.unwrap();
    assert!(fifth.is_locked_out(), "the fifth violation engages the lock");

    let sixth = limiter.check("lockout-test").await.unwrap();
    assert!(sixth.is_locked_out());
    assert!(sixth.retry_after_secs() > 600);
    assert_eq!(authority.calls(), 5);
    assert_eq!(limiter.status("lockout-test").unwrap().state, EndpointState::LockedOut);
}

#[tokio::test]
async fn five_local_denials_lock_the_endpoint() {
    let authority = ScriptedAuthority::allowing();
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    limiter.check("ai-resume").await.unwrap();
    limiter.check("ai-resume").await.unwrap();
    for _ in 0..5 {
        assert!(!limiter.check("ai-resume").await.unwrap().is_allowed());
    }

    let sixth_denial = limiter.check("ai-resume").await.unwrap();
    assert!(sixth_denial.is_locked_out());
    assert!(sixth_denial.retry_after() > Duration::from_secs(600));
    assert_eq!(limiter.status("ai-resume").unwrap().violations, 5);

    // The lock outlives the window and the burst.
    clock.advance(Duration::from_secs(120));
    assert!(limiter.check("ai-resume").await.unwrap().is_locked_out());
    clock.advance(Duration::from_secs(15 * 60));
    assert!(limiter.check("ai-resume").await.unwrap().is_allowed());
    assert_eq!(authority.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn hung_server_times_out_and_fails_open() {
    let authority = ScriptedAuthority::hanging();
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    let started = tokio::time::Instant::now();
    let decision = limiter.check("general").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(2_500));

    match decision {
        Decision::Allowed { remaining, source, tier, .. } => {
            assert_eq!(source, VerdictSource::Local);
            assert_eq!(tier, Tier::Free);
            assert_eq!(remaining, 59);
        }
        other => panic!("expected fail-open admission, got {other:?}"),
    }
    assert_eq!(limiter.status("general").unwrap().in_window, 1);
    assert!(limiter.server_degraded());
}

#[tokio::test(start_paused = true)]
async fn sweep_during_confirmation_keeps_remaining_accurate() {
    let authority = ScriptedAuthority::failing().delayed(Duration::from_millis(500));
    let limiter = limiter(&authority, &ManualClock::starting_at(START));
    limiter.tiers().resolve().await;

    let pending = tokio::spawn({
        let limiter = limiter.clone();
        async move { limiter.check("general").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(limiter.sweep().await, 1, "entry has no admitted requests yet");

    let decision = pending.await.unwrap().unwrap();
    assert!(matches!(
        decision,
        Decision::Allowed { source: VerdictSource::Local, remaining: 59, .. }
    ));
    assert_eq!(limiter.status("general").unwrap().in_window, 1);
}

#[tokio::test]
async fn failing_server_still_respects_local_limits() {
    let authority = ScriptedAuthority::failing();
    let clock = ManualClock::starting_at(START);
    let sink = MemorySink::new();
    let limiter = RateLimiter::builder(authority.clone(), free_plan())
        .clock(clock.clone())
        .sink(sink.clone())
        .build();

    assert!(limiter.check("ai-resume").await.unwrap().is_allowed());
    assert!(limiter.check("ai-resume").await.unwrap().is_allowed());
    assert!(!limiter.check("ai-resume").await.unwrap().is_allowed());
    assert_eq!(sink.count(|e| matches!(e, LimiterEvent::FailedOpen { .. })), 2);
}

#[tokio::test]
async fn server_values_are_preferred_when_admitted() {
    let verdict = ServerVerdict { allowed: true, reset_in: Some(1_234), remaining: Some(17), retry_after: None };
    let authority = ScriptedAuthority::allowing().then(Reply::Verdict(verdict));
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    let first = limiter.check("job-add").await.unwrap();
    assert_eq!(first.remaining(), 17);
    assert_eq!(first.reset_in(), Duration::from_millis(1_234));

    // Without server values the local count is reported.
    let second = limiter.check("job-add").await.unwrap();
    assert_eq!(second.remaining(), 18);
    assert_eq!(authority.endpoints(), ["job-add", "job-add"]);
}

#[tokio::test]
async fn server_denial_without_retry_after_uses_reset_in() {
    let verdict = ServerVerdict { allowed: false, reset_in: Some(12_000), remaining: Some(0), retry_after: None };
    let authority = ScriptedAuthority::allowing().then(Reply::Verdict(verdict));
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    let decision = limiter.check("user-settings").await.unwrap();
    assert_eq!(decision.reason(), Some(DenyReason::ServerDenied));
    assert_eq!(decision.retry_after(), Duration::from_secs(12));
    assert_eq!(limiter.status("user-settings").unwrap().state, EndpointState::ServerDenied);

    // ServerDenied is advisory: the next call is still confirmed with the server.
    assert!(limiter.check("user-settings").await.unwrap().is_allowed());
    assert_eq!(authority.calls(), 2);
}

#[tokio::test]
async fn tier_selects_the_policy_row() {
    let authority = ScriptedAuthority::allowing();
    let clock = ManualClock::starting_at(START);
    let admin = RateLimiter::builder(authority.clone(), ScriptedPlan::returning(json!({"isAdmin": true})))
        .clock(clock.clone())
        .build();

    let decision = admin.check("ai-resume").await.unwrap();
    assert!(matches!(decision, Decision::Allowed { tier: Tier::Admin, remaining: 99, .. }));

    let decision = admin.check_as("ai-resume", Tier::Premium).await.unwrap();
    assert!(matches!(decision, Decision::Allowed { tier: Tier::Premium, .. }));
    assert_eq!(admin.resolve_policy("ai-resume", Some(Tier::Premium)).await.unwrap().max_requests(), 15);
}

#[tokio::test]
async fn unknown_endpoint_uses_generic_and_missing_policy_errors() {
    let authority = ScriptedAuthority::allowing();
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);

    let decision = limiter.check("company-search").await.unwrap();
    assert_eq!(decision.remaining(), 59);

    limiter.set_policies(PolicyTable::empty().with_endpoint(
        "job-add",
        ratewarden::EndpointPolicy { premium: Some(RateLimitConfig::per_minute(5)), ..Default::default() },
    ));
    let err = limiter.check("job-add").await.unwrap_err();
    assert_eq!(err, ConfigError::UnknownEndpoint { endpoint: "job-add".into() });
    assert_eq!(authority.calls(), 1, "configuration errors never reach the server");
}

#[tokio::test]
async fn invalid_policy_fails_fast() {
    let authority = ScriptedAuthority::allowing();
    let clock = ManualClock::starting_at(START);
    let mut table = PolicyTable::builtin();
    table.set("ai-resume", Tier::Free, RateLimitConfig::new(3, 0));
    let limiter = RateLimiter::builder(authority.clone(), free_plan())
        .clock(clock)
        .policies(table)
        .build();

    let err = limiter.check("ai-resume").await.unwrap_err();
    assert!(matches!(err, ConfigError::InvalidPolicy { window_ms: 0, .. }));
    assert_eq!(authority.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_admissions_race_but_retained_window_is_capped() {
    let authority = ScriptedAuthority::allowing().delayed(Duration::from_millis(200));
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);
    limiter.tiers().resolve().await;

    let checks = (0..6).map(|_| limiter.check("ai-resume"));
    let decisions = futures::future::join_all(checks).await;

    // Every caller passed the local check before any committed.
    assert!(decisions.iter().all(|d| d.as_ref().unwrap().is_allowed()));
    assert_eq!(limiter.status("ai-resume").unwrap().in_window, 3);
    assert!(!limiter.check("ai-resume").await.unwrap().is_allowed());
}

#[tokio::test]
async fn events_describe_each_outcome() {
    let authority = ScriptedAuthority::denying(10).then(Reply::Verdict(ServerVerdict::allow()));
    let clock = ManualClock::starting_at(START);
    let sink = MemorySink::new();
    let limiter = RateLimiter::builder(authority, free_plan())
        .clock(clock.clone())
        .sink(sink.clone())
        .build();

    limiter.check("job-add").await.unwrap();
    for _ in 0..5 {
        limiter.check("job-add").await.unwrap();
    }
    limiter.check("job-add").await.unwrap();

    assert!(sink.events().contains(&LimiterEvent::TierResolved {
        tier: Tier::Free,
        source: ratewarden::TierSource::Network,
    }));
    assert_eq!(
        sink.count(|e| matches!(e, LimiterEvent::Admitted { source: VerdictSource::Server, .. })),
        1
    );
    assert_eq!(sink.count(|e| matches!(e, LimiterEvent::ServerDenied { .. })), 5);
    assert_eq!(sink.count(|e| matches!(e, LimiterEvent::LockedOut { violations: 5, .. })), 1);
    assert_eq!(
        sink.count(|e| matches!(e, LimiterEvent::Throttled { reason: DenyReason::LockedOut, .. })),
        1
    );
}

#[tokio::test]
async fn reset_clears_lockout() {
    let authority = ScriptedAuthority::denying(5);
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&authority, &clock);
    for _ in 0..5 {
        limiter.check("job-add").await.unwrap();
    }
    assert!(limiter.check("job-add").await.unwrap().is_locked_out());

    assert!(limiter.reset("job-add"));
    assert!(limiter.status("job-add").is_none());
    assert_eq!(limiter.check("job-add").await.unwrap().reason(), Some(DenyReason::ServerDenied));

    limiter.check("general").await.unwrap();
    limiter.reset_all();
    assert!(limiter.snapshot().is_empty());
}

#[tokio::test]
async fn timeout_errors_are_classified() {
    let err = AuthorityError::Timeout { elapsed: Duration::from_secs(3), timeout: Duration::from_millis(2_500) };
    assert!(err.is_timeout());
}
