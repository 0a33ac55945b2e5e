//! Limiter and batch settings.
//!
//! Defaults match the reference deployment; every setting is validated on build so a
//! bad value fails at startup instead of silently loosening enforcement.

use crate::error::ConfigError;
use std::time::Duration;

/// Sub-window used by the burst check.
pub const BURST_WINDOW: Duration = Duration::from_secs(5);
/// Fraction of `max_requests` that may land inside one burst window.
pub const BURST_FRACTION: f64 = 0.5;
/// Violations after which an endpoint is locked.
pub const ABUSE_VIOLATION_THRESHOLD: u32 = 5;
/// How long a lockout lasts.
pub const ABUSE_LOCK_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Deadline for `POST /rate-limit-check`.
pub const SERVER_CHECK_TIMEOUT: Duration = Duration::from_millis(2_500);
/// Deadline for `GET /subscription/status`.
pub const SUBSCRIPTION_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a resolved tier is trusted.
pub const TIER_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// How long the lowest tier is assumed after a failed subscription lookup.
pub const TIER_RETRY_BACKOFF: Duration = Duration::from_secs(30);
/// Interval of the idle-state sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Tasks run concurrently per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Pause between batches.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Validated limiter settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    burst_window: Duration,
    burst_fraction: f64,
    abuse_violation_threshold: u32,
    abuse_lock_window: Duration,
    server_timeout: Duration,
    status_timeout: Duration,
    tier_ttl: Duration,
    tier_retry_backoff: Duration,
    sweep_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            burst_window: BURST_WINDOW,
            burst_fraction: BURST_FRACTION,
            abuse_violation_threshold: ABUSE_VIOLATION_THRESHOLD,
            abuse_lock_window: ABUSE_LOCK_WINDOW,
            server_timeout: SERVER_CHECK_TIMEOUT,
            status_timeout: SUBSCRIPTION_STATUS_TIMEOUT,
            tier_ttl: TIER_CACHE_TTL,
            tier_retry_backoff: TIER_RETRY_BACKOFF,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl LimiterConfig {
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder { config: Self::default() }
    }

    pub fn burst_window(&self) -> Duration {
        self.burst_window
    }

    pub fn burst_fraction(&self) -> f64 {
        self.burst_fraction
    }

    pub fn abuse_violation_threshold(&self) -> u32 {
        self.abuse_violation_threshold
    }

    pub fn abuse_lock_window(&self) -> Duration {
        self.abuse_lock_window
    }

    pub fn server_timeout(&self) -> Duration {
        self.server_timeout
    }

    pub fn status_timeout(&self) -> Duration {
        self.status_timeout
    }

    pub fn tier_ttl(&self) -> Duration {
        self.tier_ttl
    }

    /// Zero retries the lookup on every resolution.
    pub fn tier_retry_backoff(&self) -> Duration {
        self.tier_retry_backoff
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("burst_window", self.burst_window),
            ("abuse_lock_window", self.abuse_lock_window),
            ("server_timeout", self.server_timeout),
            ("status_timeout", self.status_timeout),
            ("tier_ttl", self.tier_ttl),
            ("sweep_interval", self.sweep_interval),
        ];
        for (field, value) in non_zero {
            if value.is_zero() || value == Duration::MAX {
                return Err(ConfigError::InvalidSetting {
                    field,
                    reason: format!("must be non-zero and finite (got {value:?})"),
                });
            }
        }
        if !(self.burst_fraction > 0.0 && self.burst_fraction <= 1.0) {
            return Err(ConfigError::InvalidSetting {
                field: "burst_fraction",
                reason: format!("must be in (0, 1] (got {})", self.burst_fraction),
            });
        }
        if self.abuse_violation_threshold == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "abuse_violation_threshold",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`LimiterConfig`].
#[derive(Debug, Clone)]
pub struct LimiterConfigBuilder {
    config: LimiterConfig,
}

impl LimiterConfigBuilder {
    pub fn burst_window(mut self, window: Duration) -> Self {
        self.config.burst_window = window;
        self
    }

    pub fn burst_fraction(mut self, fraction: f64) -> Self {
        self.config.burst_fraction = fraction;
        self
    }

    pub fn abuse_violation_threshold(mut self, violations: u32) -> Self {
        self.config.abuse_violation_threshold = violations;
        self
    }

    pub fn abuse_lock_window(mut self, window: Duration) -> Self {
        self.config.abuse_lock_window = window;
        self
    }

    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.config.server_timeout = timeout;
        self
    }

    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.config.status_timeout = timeout;
        self
    }

    pub fn tier_ttl(mut self, ttl: Duration) -> Self {
        self.config.tier_ttl = ttl;
        self
    }

    pub fn tier_retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.tier_retry_backoff = backoff;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Batch scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    batch_size: usize,
    batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, batch_delay: DEFAULT_BATCH_DELAY }
    }
}

impl BatchConfig {
    /// `batch_size` must be > 0; a zero delay is allowed.
    pub fn new(batch_size: usize, batch_delay: Duration) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(Self { batch_size, batch_delay })
    }

    /// Pacing used for sponsorship lookups.
    pub fn sponsor_lookups() -> Self {
        Self::default()
    }

    /// Pacing used for SOC-code lookups.
    pub fn soc_lookups() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, batch_delay: Duration::from_millis(50) }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_delay(&self) -> Duration {
        self.batch_delay
    }
}
