//! Rate-limit decision engine.
//!
//! - [`RateLimiter`]: the service callers ask "may I call endpoint E?".
//! - [`PolicyTable`]: `(endpoint, tier) → RateLimitConfig` with generic fallbacks.
//! - [`WindowTracker`]: per-endpoint sliding window, burst sub-window, violations, lockout.
//! - [`RateLimitAuthority`]: the remote decision point consulted after local admission.
//! - [`RateLimitLayer`]: Tower middleware that gates a service behind a decision.
//!
//! Denials are data, not errors: [`RateLimiter::check`] returns `Ok(Decision::Denied{..})`
//! when throttled and only fails with a [`ConfigError`](crate::ConfigError) when no usable
//! policy exists.

use crate::tier::Tier;
use std::time::Duration;

pub mod authority;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod window;

pub use authority::{OfflineAuthority, RateLimitAuthority, ServerVerdict};
pub use limiter::{RateLimiter, RateLimiterBuilder, SweeperHandle, SERVER_UNAVAILABLE_KEY};
pub use middleware::{RateLimitError, RateLimitLayer, RateLimitService};
pub use policy::{EndpointPolicy, PolicyTable, RateLimitConfig};
pub use window::{EndpointState, EndpointStatus, LocalEvaluation, WindowTracker};

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    /// `max_requests` already used inside the sliding window.
    WindowExceeded,
    /// Too many requests inside the short burst window.
    BurstExceeded,
    /// The endpoint is locked after repeated violations.
    LockedOut,
    /// The remote authority refused the request.
    ServerDenied,
}

/// Who made the final admission call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerdictSource {
    /// The remote authority confirmed the request.
    Server,
    /// The authority was unreachable; admitted on local state alone.
    Local,
}

/// The outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Requests left in the current window (server value when available).
        remaining: u32,
        /// Time until the window frees a slot.
        reset_in: Duration,
        /// Tier whose policy applied.
        tier: Tier,
        source: VerdictSource,
    },
    /// The request must not be sent.
    Denied {
        reason: DenyReason,
        /// Time until the offending window or lock elapses.
        reset_in: Duration,
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn is_locked_out(&self) -> bool {
        matches!(self, Decision::Denied { reason: DenyReason::LockedOut, .. })
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Decision::Denied { reason, .. } => Some(*reason),
            Decision::Allowed { .. } => None,
        }
    }

    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }

    pub fn reset_in(&self) -> Duration {
        match self {
            Decision::Allowed { reset_in, .. } | Decision::Denied { reset_in, .. } => *reset_in,
        }
    }

    /// Zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed { .. } => Duration::ZERO,
            Decision::Denied { retry_after, .. } => *retry_after,
        }
    }

    /// `retry_after` rounded up to whole seconds, for `Retry-After` style displays.
    pub fn retry_after_secs(&self) -> u64 {
        let wait = self.retry_after();
        wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
    }

    /// Human-readable explanation suitable for a notification.
    ///
    /// Lockouts read differently from ordinary throttling so users can tell a long fixed
    /// wait from a short rolling one.
    pub fn message(&self) -> String {
        let wait = humanize(self.retry_after());
        match self.reason() {
            None => "Request allowed.".to_string(),
            Some(DenyReason::LockedOut) => {
                format!("Too many rejected requests. This feature is paused for {wait}.")
            }
            Some(DenyReason::ServerDenied) => {
                format!("The server is limiting requests. Try again in {wait}.")
            }
            Some(DenyReason::WindowExceeded | DenyReason::BurstExceeded) => {
                format!("Slow down a little. Try again in {wait}.")
            }
        }
    }
}

fn humanize(wait: Duration) -> String {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    match secs {
        0 | 1 => "1 second".to_string(),
        2..=59 => format!("{secs} seconds"),
        _ => {
            let minutes = secs.div_ceil(60);
            if minutes == 1 {
                "1 minute".to_string()
            } else {
                format!("{minutes} minutes")
            }
        }
    }
}
