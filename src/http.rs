//! HTTP implementations of the remote collaborators.
//!
//! [`HttpBackend`] talks to the companion web application:
//!
//! - `POST {base}/rate-limit-check` with `{"endpoint": ..}` → [`ServerVerdict`]
//! - `GET {base}/subscription/status` → raw JSON, classified by the tier resolver
//!
//! Both are bearer-authenticated. No client-side timeout is configured here; deadlines
//! are enforced by the limiter around every call.

use crate::error::AuthorityError;
use crate::rate_limit::{RateLimitAuthority, ServerVerdict};
use crate::tier::SubscriptionSource;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Source of the bearer token attached to backend calls.
#[async_trait]
pub trait TokenProvider: Send + Sync + fmt::Debug {
    async fn bearer_token(&self) -> Result<String, AuthorityError>;
}

/// A fixed token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, AuthorityError> {
        if self.0.is_empty() {
            return Err(AuthorityError::MissingToken);
        }
        Ok(self.0.clone())
    }
}

/// Where the backend lives and how to authenticate.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpConfig {
    pub fn new<T: TokenProvider + 'static>(base_url: impl Into<String>, tokens: T) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, tokens: Arc::new(tokens) }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// `reqwest` client for the rate-limit authority and subscription lookup.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: HttpConfig,
}

impl HttpBackend {
    pub fn new(config: HttpConfig) -> Result<Self, AuthorityError> {
        let client = Client::builder().build().map_err(transport)?;
        Ok(Self { client, config })
    }

    /// Use an existing client, e.g. one shared with the rest of the application.
    pub fn with_client(client: Client, config: HttpConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }
}

fn transport(err: reqwest::Error) -> AuthorityError {
    AuthorityError::Transport(err.to_string())
}

#[async_trait]
impl RateLimitAuthority for HttpBackend {
    async fn confirm(&self, endpoint: &str) -> Result<ServerVerdict, AuthorityError> {
        let token = self.config.tokens.bearer_token().await?;
        let response = self
            .client
            .post(self.url("/rate-limit-check"))
            .bearer_auth(token)
            .json(&json!({ "endpoint": endpoint }))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthorityError::Status(status.as_u16()));
        }
        let retry_header = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.bytes().await.map_err(transport)?;

        match serde_json::from_slice::<ServerVerdict>(&body) {
            Ok(mut verdict) => {
                if status == StatusCode::TOO_MANY_REQUESTS {
                    verdict.allowed = false;
                }
                verdict.retry_after = verdict.retry_after.or(retry_header);
                Ok(verdict)
            }
            // A bare 429 is still a denial.
            Err(_) if status == StatusCode::TOO_MANY_REQUESTS => Ok(ServerVerdict {
                allowed: false,
                reset_in: None,
                remaining: None,
                retry_after: retry_header,
            }),
            Err(err) => Err(AuthorityError::Decode(err.to_string())),
        }
    }
}

#[async_trait]
impl SubscriptionSource for HttpBackend {
    async fn fetch_status(&self) -> Result<Value, AuthorityError> {
        let token = self.config.tokens.bearer_token().await?;
        let response = self
            .client
            .get(self.url("/subscription/status"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityError::Status(status.as_u16()));
        }
        response.json::<Value>().await.map_err(|e| AuthorityError::Decode(e.to_string()))
    }
}
