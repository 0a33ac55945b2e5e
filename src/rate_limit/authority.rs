//! Remote rate-limit authority.
//!
//! After a request passes the local window it is confirmed with the backend's own
//! limiter (`POST /rate-limit-check`). The authority is opaque: anything implementing
//! [`RateLimitAuthority`] can stand in for it, and any error it returns is treated as
//! "unreachable", which the limiter answers by failing open.

use crate::error::AuthorityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The remote decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVerdict {
    pub allowed: bool,
    /// Milliseconds until the server-side window resets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    /// Seconds the client should wait after a denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ServerVerdict {
    pub fn allow() -> Self {
        Self { allowed: true, reset_in: None, remaining: None, retry_after: None }
    }

    pub fn deny(retry_after_secs: u64) -> Self {
        Self { allowed: false, reset_in: None, remaining: None, retry_after: Some(retry_after_secs) }
    }

    pub fn reset_in(&self) -> Option<Duration> {
        self.reset_in.map(Duration::from_millis)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after.map(Duration::from_secs)
    }
}

/// Authoritative remote decision point.
#[async_trait]
pub trait RateLimitAuthority: Send + Sync + std::fmt::Debug {
    /// Ask whether a request to `endpoint` may proceed.
    async fn confirm(&self, endpoint: &str) -> Result<ServerVerdict, AuthorityError>;
}

/// An authority that is never reachable, so every decision is made locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineAuthority;

#[async_trait]
impl RateLimitAuthority for OfflineAuthority {
    async fn confirm(&self, _endpoint: &str) -> Result<ServerVerdict, AuthorityError> {
        Err(AuthorityError::Transport("offline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verdict_parses_partial_payloads() {
        let verdict: ServerVerdict = serde_json::from_value(json!({"allowed": true})).unwrap();
        assert_eq!(verdict, ServerVerdict::allow());

        let verdict: ServerVerdict =
            serde_json::from_value(json!({"allowed": false, "retryAfter": 30, "resetIn": 4500}))
                .unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(verdict.reset_in(), Some(Duration::from_millis(4_500)));
    }

    #[tokio::test]
    async fn offline_authority_always_errors() {
        assert!(OfflineAuthority.confirm("general").await.is_err());
    }
}
