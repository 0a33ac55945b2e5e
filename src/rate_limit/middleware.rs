use crate::error::ConfigError;
use crate::rate_limit::{Decision, RateLimiter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

/// Error returned by [`RateLimitService`].
#[derive(Debug, Error)]
pub enum RateLimitError<E> {
    /// The limiter refused the request; the inner service was not called.
    #[error("rate limited: {}", .0.message())]
    Throttled(Decision),
    /// No usable policy for the endpoint.
    #[error(transparent)]
    Config(ConfigError),
    /// The inner service failed.
    #[error("inner service error: {0}")]
    Inner(E),
}

impl<E> RateLimitError<E> {
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Throttled(decision) => Some(decision),
            _ => None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}

/// A layer that gates a service behind [`RateLimiter::check`] for one endpoint.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
    endpoint: Arc<str>,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter, endpoint: impl Into<Arc<str>>) -> Self {
        Self { limiter, endpoint: endpoint.into() }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            endpoint: Arc::clone(&self.endpoint),
        }
    }
}

/// Middleware service that checks the limiter before every call.
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: RateLimiter,
    endpoint: Arc<str>,
}

impl<S, Req> Service<Req> for RateLimitService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    S::Response: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = RateLimitError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RateLimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let endpoint = Arc::clone(&self.endpoint);
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.check(&endpoint).await {
                Ok(decision) if decision.is_allowed() => {
                    inner.call(req).await.map_err(RateLimitError::Inner)
                }
                Ok(decision) => Err(RateLimitError::Throttled(decision)),
                Err(err) => Err(RateLimitError::Config(err)),
            }
        })
    }
}
