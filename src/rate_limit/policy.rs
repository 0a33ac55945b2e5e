//! Policy table: which quota applies to an endpoint for a tier.
//!
//! Resolution order is the tier-specific entry of the endpoint, then the endpoint's
//! generic entry, then the table-wide generic policy. If none exists, or the one found
//! is not usable, resolution fails with a [`ConfigError`]; a policy is never invented.

use crate::error::ConfigError;
use crate::tier::Tier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Quota for one `(endpoint, tier)`: at most `max_requests` per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    max_requests: u32,
    window_ms: u64,
}

impl RateLimitConfig {
    /// Unchecked constructor; values are validated when the policy is resolved.
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self { max_requests, window_ms }
    }

    pub const fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, 60_000)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// How many requests may land inside one burst window: `ceil(max_requests × fraction)`,
    /// never less than one.
    pub fn burst_limit(&self, fraction: f64) -> u32 {
        let limit = (f64::from(self.max_requests) * fraction).ceil();
        // `limit` is within [0, max_requests] for fractions in (0, 1].
        (limit as u32).max(1)
    }

    fn is_valid(&self) -> bool {
        self.max_requests > 0 && self.window_ms > 0
    }
}

/// Quotas for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<RateLimitConfig>,
    /// Used when the tier has no entry of its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<RateLimitConfig>,
}

impl EndpointPolicy {
    pub fn tiered(free: RateLimitConfig, premium: RateLimitConfig, admin: RateLimitConfig) -> Self {
        Self { free: Some(free), premium: Some(premium), admin: Some(admin), generic: None }
    }

    pub fn for_tier(&self, tier: Tier) -> Option<RateLimitConfig> {
        match tier {
            Tier::Free => self.free,
            Tier::Premium => self.premium,
            Tier::Admin => self.admin,
        }
    }
}

/// Endpoint → quotas, plus a table-wide generic policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    endpoints: BTreeMap<String, EndpointPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generic: Option<RateLimitConfig>,
}

impl PolicyTable {
    /// An empty table; every resolution fails until entries are added.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in quotas shipped with the assistant.
    pub fn builtin() -> Self {
        let per_min = RateLimitConfig::per_minute;
        Self::empty()
            .with_endpoint("general", EndpointPolicy::tiered(per_min(60), per_min(120), per_min(1_000)))
            .with_endpoint("job-add", EndpointPolicy::tiered(per_min(20), per_min(100), per_min(1_000)))
            .with_endpoint(
                "sponsor-lookup",
                EndpointPolicy::tiered(per_min(30), per_min(150), per_min(1_000)),
            )
            .with_endpoint(
                "soc-lookup",
                EndpointPolicy::tiered(per_min(30), per_min(150), per_min(1_000)),
            )
            .with_endpoint(
                "user-settings",
                EndpointPolicy::tiered(per_min(10), per_min(30), per_min(100)),
            )
            .with_endpoint("ai-resume", EndpointPolicy::tiered(per_min(3), per_min(15), per_min(100)))
            .with_generic(per_min(60))
    }

    /// Parse a JSON document and validate every entry.
    ///
    /// ```
    /// use ratewarden::PolicyTable;
    /// let table = PolicyTable::from_json(r#"{
    ///     "endpoints": { "ai-resume": { "free": { "maxRequests": 3, "windowMs": 60000 } } },
    ///     "generic": { "maxRequests": 60, "windowMs": 60000 }
    /// }"#).unwrap();
    /// assert_eq!(table.resolve("ai-resume", ratewarden::Tier::Free).unwrap().max_requests(), 3);
    /// ```
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let table: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        table.validate()?;
        Ok(table)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, policy: EndpointPolicy) -> Self {
        self.endpoints.insert(endpoint.into(), policy);
        self
    }

    pub fn with_generic(mut self, config: RateLimitConfig) -> Self {
        self.generic = Some(config);
        self
    }

    /// Set a single `(endpoint, tier)` quota, creating the endpoint if needed.
    pub fn set(&mut self, endpoint: impl Into<String>, tier: Tier, config: RateLimitConfig) {
        let policy = self.endpoints.entry(endpoint.into()).or_default();
        match tier {
            Tier::Free => policy.free = Some(config),
            Tier::Premium => policy.premium = Some(config),
            Tier::Admin => policy.admin = Some(config),
        }
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<&EndpointPolicy> {
        self.endpoints.get(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    /// Resolve the quota for `endpoint` at `tier`.
    pub fn resolve(&self, endpoint: &str, tier: Tier) -> Result<RateLimitConfig, ConfigError> {
        let entry = self.endpoints.get(endpoint);
        let (config, source_tier) = match entry.and_then(|p| p.for_tier(tier)) {
            Some(config) => (config, Some(tier)),
            None => match entry.and_then(|p| p.generic).or(self.generic) {
                Some(config) => (config, None),
                None => {
                    return Err(ConfigError::UnknownEndpoint { endpoint: endpoint.to_string() })
                }
            },
        };

        if !config.is_valid() {
            return Err(ConfigError::invalid_policy(
                endpoint,
                source_tier,
                u64::from(config.max_requests),
                config.window_ms,
            ));
        }
        Ok(config)
    }

    /// Check every entry, failing on the first unusable one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (endpoint, policy) in &self.endpoints {
            for tier in Tier::ALL {
                if let Some(config) = policy.for_tier(tier) {
                    if !config.is_valid() {
                        return Err(ConfigError::invalid_policy(
                            endpoint,
                            Some(tier),
                            u64::from(config.max_requests),
                            config.window_ms,
                        ));
                    }
                }
            }
            if let Some(config) = policy.generic.filter(|c| !c.is_valid()) {
                return Err(ConfigError::invalid_policy(
                    endpoint,
                    None,
                    u64::from(config.max_requests),
                    config.window_ms,
                ));
            }
        }
        if let Some(config) = self.generic.filter(|c| !c.is_valid()) {
            return Err(ConfigError::invalid_policy(
                "*",
                None,
                u64::from(config.max_requests),
                config.window_ms,
            ));
        }
        Ok(())
    }
}
