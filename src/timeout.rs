//! Deadline for remote calls.
//!
//! Both remote collaborators race against a timer; the timer path produces
//! [`AuthorityError::Timeout`], which callers treat exactly like a network failure.

use crate::error::AuthorityError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Panics if duration is zero or `Duration::MAX`;
    /// validated configuration never produces either.
    pub fn new(duration: Duration) -> Self {
        assert!(
            duration > Duration::ZERO && duration < Duration::MAX,
            "timeout duration must be non-zero and finite",
        );
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `operation`, giving up once the deadline passes. No retries.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, AuthorityError>
    where
        Fut: Future<Output = Result<T, AuthorityError>>,
        Op: FnOnce() -> Fut,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => Err(AuthorityError::Timeout {
                elapsed: start.elapsed(),
                timeout: self.duration,
            }),
        }
    }
}
