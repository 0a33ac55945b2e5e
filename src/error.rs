//! Error types.
//!
//! Only [`ConfigError`] ever reaches a rate-limit caller as an error. Throttling,
//! lockouts, and server denials are returned as [`Decision`](crate::Decision) values,
//! and a failing remote authority is logged and absorbed (fail-open).

use crate::rate_limit::Decision;
use crate::tier::Tier;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Invalid or missing rate-limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No tier-specific entry and no generic fallback exist.
    #[error("no rate-limit policy for endpoint '{endpoint}'")]
    UnknownEndpoint { endpoint: String },
    /// A policy exists but is not usable.
    #[error(
        "invalid rate-limit policy for '{endpoint}' ({tier}): max_requests={max_requests}, window_ms={window_ms}"
    )]
    InvalidPolicy { endpoint: String, tier: String, max_requests: u64, window_ms: u64 },
    /// A limiter or scheduler setting failed validation.
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
    /// A policy table document could not be parsed.
    #[error("failed to parse policy table: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid_policy(
        endpoint: &str,
        tier: Option<Tier>,
        max_requests: u64,
        window_ms: u64,
    ) -> Self {
        Self::InvalidPolicy {
            endpoint: endpoint.to_string(),
            tier: tier.map_or_else(|| "generic".to_string(), |t| t.to_string()),
            max_requests,
            window_ms,
        }
    }
}

/// Failure talking to a remote collaborator (rate-limit authority or subscription lookup).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error("remote call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("no bearer token available")]
    MissingToken,
}

impl AuthorityError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failure of the persistent key-value substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored value for '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Error shared by every caller joined on one deduplicated cache fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
    /// The fetch task ended without producing a value (panicked or was cancelled).
    #[error("fetch aborted before completing")]
    Aborted,
}

impl FetchError {
    /// Wrap any error so it can be shared between joined callers.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(err))
    }

    /// Borrow the original error if it has type `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Failed(inner) => inner.downcast_ref::<E>(),
            Self::Aborted => None,
        }
    }
}

/// Batch scheduler failures; the task's own error is carried in its output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("batch scheduler closed before the task ran")]
    Closed,
    #[error("batch task panicked")]
    TaskPanicked,
}

/// Error from a cached, paced, rate-limited lookup.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("lookup throttled: {}", .0.message())]
    Throttled(Decision),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Fetch(FetchError),
}

impl LookupError {
    /// The denial, if the lookup was refused by the limiter.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Throttled(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}
