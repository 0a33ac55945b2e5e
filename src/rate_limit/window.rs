//! Per-endpoint local window state.
//!
//! Each endpoint keeps the timestamps of admitted requests inside its sliding window,
//! a sticky violation counter, and an optional lock. Evaluation order:
//!
//! 1. An active lock denies outright (no violation is recorded for this).
//! 2. Timestamps older than the window are pruned.
//! 3. A full window, or `ceil(max_requests × fraction)` requests inside the burst
//!    window, denies and records a violation.
//! 4. Otherwise the request is locally permitted; it is only counted once
//!    [`WindowTracker::commit`] is called after remote confirmation.
//!
//! Violations never decay. Once the threshold is reached every further violation
//! re-arms the lock, so an endpoint that keeps misbehaving after its lock expires is
//! locked again on its next violation.

use crate::config::LimiterConfig;
use crate::clock::duration_millis;
use crate::rate_limit::policy::RateLimitConfig;
use crate::rate_limit::DenyReason;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct RateLimitState {
    requests: VecDeque<u64>,
    violations: u32,
    locked_until: Option<u64>,
    last_request: Option<u64>,
    server_denied_until: Option<u64>,
    /// Policy seen at the most recent evaluation; drives pruning during sweeps.
    config: Option<RateLimitConfig>,
}

impl RateLimitState {
    /// Keep only timestamps in `(now - window_ms, now]`.
    ///
    /// Entries ahead of `now` are left by a wall clock that stepped backwards and are
    /// dropped; a lock that now reaches further than `lock_ms` is shortened to it.
    fn prune(&mut self, now: u64, window_ms: u64, lock_ms: u64) {
        self.requests.retain(|&t| within(t, now, window_ms));
        let max_lock = now.saturating_add(lock_ms);
        if let Some(until) = self.locked_until.as_mut() {
            *until = (*until).min(max_lock);
        }
    }

    fn active_lock(&self, now: u64) -> Option<u64> {
        self.locked_until.filter(|&until| until > now)
    }

    fn burst_count(&self, now: u64, burst_ms: u64) -> usize {
        self.requests.iter().filter(|&&t| within(t, now, burst_ms)).count()
    }
}

/// Whether `ts` lies in `(now - span, now]`.
fn within(ts: u64, now: u64, span: u64) -> bool {
    ts <= now && now.checked_sub(span).map_or(true, |cutoff| ts > cutoff)
}

/// Result of a local evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvaluation {
    pub allowed: bool,
    /// For denials, the time until the lock or offending window elapses; for
    /// permits, the time until the oldest counted request leaves the window.
    pub reset_in: Duration,
    /// Requests left after admitting this one (0 when denied).
    pub remaining: u32,
    pub reason: Option<DenyReason>,
    /// Violation count after this evaluation.
    pub violations: u32,
    /// Set when this evaluation engaged a new lock.
    pub locked_for: Option<Duration>,
}

/// Result of recording a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    pub violations: u32,
    /// Set when this violation engaged the lock.
    pub locked_for: Option<Duration>,
}

/// Coarse state of an endpoint, for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Normal,
    /// Window or burst quota currently used up.
    Throttled,
    /// The remote authority refused recently and its `retry_after` has not elapsed.
    ServerDenied,
    LockedOut,
}

/// Monitoring snapshot of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub state: EndpointState,
    /// Admitted requests still inside the window.
    pub in_window: usize,
    pub violations: u32,
    pub locked_until: Option<u64>,
    pub last_request: Option<u64>,
    pub config: Option<RateLimitConfig>,
}

/// Thresholds the tracker enforces.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Thresholds {
    burst_ms: u64,
    burst_fraction: f64,
    violation_threshold: u32,
    lock_ms: u64,
}

/// Per-endpoint local state, partitioned by endpoint name.
///
/// The map is guarded by a mutex that is never held across an await, so every
/// evaluate/commit/violation is applied atomically with respect to other callers.
#[derive(Debug)]
pub struct WindowTracker {
    states: Mutex<HashMap<String, RateLimitState>>,
    thresholds: Thresholds,
}

impl Default for WindowTracker {
    fn default() -> Self {
        Self::new(&LimiterConfig::default())
    }
}

impl WindowTracker {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            thresholds: Thresholds {
                burst_ms: duration_millis(config.burst_window()),
                burst_fraction: config.burst_fraction(),
                violation_threshold: config.abuse_violation_threshold(),
                lock_ms: duration_millis(config.abuse_lock_window()),
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateLimitState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate a candidate request at `now` without counting it.
    pub fn evaluate(&self, endpoint: &str, config: &RateLimitConfig, now: u64) -> LocalEvaluation {
        let t = self.thresholds;
        let mut states = self.lock();
        let state = states.entry(endpoint.to_string()).or_default();
        state.config = Some(*config);
        state.prune(now, config.window_ms(), t.lock_ms);

        if let Some(until) = state.active_lock(now) {
            return LocalEvaluation {
                allowed: false,
                reset_in: Duration::from_millis(until - now),
                remaining: 0,
                reason: Some(DenyReason::LockedOut),
                violations: state.violations,
                locked_for: None,
            };
        }

        let in_window = state.requests.len();
        let burst_count = state.burst_count(now, t.burst_ms);
        let max = config.max_requests() as usize;
        let burst_limit = config.burst_limit(t.burst_fraction) as usize;

        let denial = if in_window >= max {
            Some((DenyReason::WindowExceeded, config.window()))
        } else if burst_count >= burst_limit {
            Some((DenyReason::BurstExceeded, Duration::from_millis(t.burst_ms)))
        } else {
            None
        };

        match denial {
            Some((reason, reset_in)) => {
                let violation = Self::violate(state, now, t);
                LocalEvaluation {
                    allowed: false,
                    reset_in,
                    remaining: 0,
                    reason: Some(reason),
                    violations: violation.violations,
                    locked_for: violation.locked_for,
                }
            }
            None => {
                let reset_in = state
                    .requests
                    .front()
                    .map_or(config.window_ms(), |&oldest| {
                        (oldest + config.window_ms()).saturating_sub(now)
                    });
                LocalEvaluation {
                    allowed: true,
                    reset_in: Duration::from_millis(reset_in),
                    remaining: (max - in_window - 1) as u32,
                    reason: None,
                    violations: state.violations,
                    locked_for: None,
                }
            }
        }
    }

    /// Count a request admitted under `config` at `now`; returns the requests left in
    /// the window.
    ///
    /// The retained list is capped at `max_requests`: when concurrent admissions
    /// overshoot, the oldest timestamps are dropped. The entry is recreated if a sweep
    /// removed it while the request was being confirmed.
    pub fn commit(&self, endpoint: &str, config: &RateLimitConfig, now: u64) -> u32 {
        let mut states = self.lock();
        let state = states.entry(endpoint.to_string()).or_default();
        state.config = Some(*config);
        state.prune(now, config.window_ms(), self.thresholds.lock_ms);
        state.requests.push_back(now);
        state.last_request = Some(now);

        let max = config.max_requests() as usize;
        while state.requests.len() > max {
            state.requests.pop_front();
        }
        (max - state.requests.len()) as u32
    }

    /// Record a violation (e.g. a server denial) at `now`.
    pub fn record_violation(&self, endpoint: &str, now: u64) -> Violation {
        let mut states = self.lock();
        let state = states.entry(endpoint.to_string()).or_default();
        Self::violate(state, now, self.thresholds)
    }

    /// Remember that the remote authority asked us to back off until `until`.
    pub(crate) fn note_server_denial(&self, endpoint: &str, until: u64) {
        let mut states = self.lock();
        states.entry(endpoint.to_string()).or_default().server_denied_until = Some(until);
    }

    fn violate(state: &mut RateLimitState, now: u64, t: Thresholds) -> Violation {
        state.violations = state.violations.saturating_add(1);
        let locked_for = if state.violations >= t.violation_threshold {
            state.locked_until = Some(now.saturating_add(t.lock_ms));
            Some(Duration::from_millis(t.lock_ms))
        } else {
            None
        };
        Violation { violations: state.violations, locked_for }
    }

    /// Snapshot of one endpoint, or `None` if it has no state.
    pub fn status(&self, endpoint: &str, now: u64) -> Option<EndpointStatus> {
        let states = self.lock();
        states.get(endpoint).map(|state| self.describe(endpoint, state, now))
    }

    /// Snapshots of every tracked endpoint, sorted by name.
    pub fn snapshot(&self, now: u64) -> Vec<EndpointStatus> {
        let states = self.lock();
        let mut all: Vec<_> =
            states.iter().map(|(endpoint, state)| self.describe(endpoint, state, now)).collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    fn describe(&self, endpoint: &str, state: &RateLimitState, now: u64) -> EndpointStatus {
        let t = self.thresholds;
        let in_window = match state.config {
            Some(config) => {
                state.requests.iter().filter(|&&ts| within(ts, now, config.window_ms())).count()
            }
            None => state.requests.len(),
        };

        let state_kind = if state.active_lock(now).is_some() {
            EndpointState::LockedOut
        } else if state.server_denied_until.is_some_and(|until| until > now) {
            EndpointState::ServerDenied
        } else if state.config.is_some_and(|config| {
            in_window >= config.max_requests() as usize
                || state.burst_count(now, t.burst_ms)
                    >= config.burst_limit(t.burst_fraction) as usize
        }) {
            EndpointState::Throttled
        } else {
            EndpointState::Normal
        };

        EndpointStatus {
            endpoint: endpoint.to_string(),
            state: state_kind,
            in_window,
            violations: state.violations,
            locked_until: state.active_lock(now),
            last_request: state.last_request,
            config: state.config,
        }
    }

    /// Drop endpoints whose window has fully elapsed and that are not locked.
    ///
    /// Removing an entry also forgets its violations.
    pub fn sweep(&self, now: u64) -> usize {
        let mut states = self.lock();
        let before = states.len();
        let lock_ms = self.thresholds.lock_ms;
        states.retain(|_, state| {
            if let Some(config) = state.config {
                state.prune(now, config.window_ms(), lock_ms);
            }
            !state.requests.is_empty() || state.active_lock(now).is_some()
        });
        before - states.len()
    }

    /// Forget one endpoint entirely.
    pub fn reset(&self, endpoint: &str) -> bool {
        self.lock().remove(endpoint).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamps currently retained for `endpoint`.
    pub fn requests(&self, endpoint: &str) -> Vec<u64> {
        self.lock()
            .get(endpoint)
            .map(|state| state.requests.iter().copied().collect())
            .unwrap_or_default()
    }
}
