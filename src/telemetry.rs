//! Telemetry for the limiter, tier resolver, and caches.
//!
//! Every component emits structured [`LimiterEvent`]s into a [`TelemetrySink`], which is
//! a `tower::Service<LimiterEvent>` so sinks compose with ordinary tower combinators.
//! Emission is best-effort: a sink that is not ready or fails never affects a decision.
//!
//! ```rust
//! use ratewarden::telemetry::{LimiterEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(LimiterEvent::Swept { removed: 3 }).await.unwrap();
//! assert_eq!(sink.events(), vec![LimiterEvent::Swept { removed: 3 }]);
//! # }
//! ```

use crate::rate_limit::{DenyReason, VerdictSource};
use crate::tier::{Tier, TierSource};
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// A sink consuming limiter events.
pub trait TelemetrySink:
    Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: Service<LimiterEvent, Response = ()> + Send,
    S::Future: Send,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted while making rate-limit decisions and serving cached lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// A request was admitted.
    Admitted { endpoint: String, tier: Tier, remaining: u32, source: VerdictSource },
    /// A request was refused by the local window, burst check, or an active lock.
    Throttled { endpoint: String, reason: DenyReason, reset_in: Duration },
    /// The remote authority refused a locally permitted request.
    ServerDenied { endpoint: String, retry_after: Duration },
    /// The violation threshold was crossed and the endpoint is now locked.
    LockedOut { endpoint: String, violations: u32, lock_for: Duration },
    /// The remote authority could not be reached; admitted on local state alone.
    FailedOpen { endpoint: String, error: String },
    /// A subscription tier was resolved.
    TierResolved { tier: Tier, source: TierSource },
    /// Cache activity for `key`.
    Cache { cache: &'static str, key: String, outcome: CacheOutcome },
    /// Idle endpoint state was removed.
    Swept { removed: usize },
}

/// How a cache read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from a live entry.
    Hit,
    /// Started a new fetch.
    Miss,
    /// Joined a fetch already in flight.
    Joined,
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admitted { endpoint, tier, remaining, source } => write!(
                f,
                "Admitted(endpoint={endpoint}, tier={tier}, remaining={remaining}, source={source:?})"
            ),
            Self::Throttled { endpoint, reason, reset_in } => write!(
                f,
                "Throttled(endpoint={endpoint}, reason={reason:?}, reset_in={}ms)",
                reset_in.as_millis()
            ),
            Self::ServerDenied { endpoint, retry_after } => write!(
                f,
                "ServerDenied(endpoint={endpoint}, retry_after={}s)",
                retry_after.as_secs()
            ),
            Self::LockedOut { endpoint, violations, lock_for } => write!(
                f,
                "LockedOut(endpoint={endpoint}, violations={violations}, lock_for={}s)",
                lock_for.as_secs()
            ),
            Self::FailedOpen { endpoint, error } => {
                write!(f, "FailedOpen(endpoint={endpoint}, error={error})")
            }
            Self::TierResolved { tier, source } => {
                write!(f, "TierResolved(tier={tier}, source={source:?})")
            }
            Self::Cache { cache, key, outcome } => {
                write!(f, "Cache(cache={cache}, key={key}, outcome={outcome:?})")
            }
            Self::Swept { removed } => write!(f, "Swept(removed={removed})"),
        }
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        tracing::info!(event = %event, "limiter_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Bounded in-memory sink; oldest events are evicted once full.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Default cap: 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<LimiterEvent> {
        self.lock().clone()
    }

    /// Count events matching `pred`.
    pub fn count(&self, pred: impl Fn(&LimiterEvent) -> bool) -> usize {
        self.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LimiterEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Type-erased sink handle shared by the limiter's components.
#[derive(Clone)]
pub(crate) struct SharedSink {
    inner: Arc<Mutex<BoxCloneService<LimiterEvent, (), ()>>>,
}

impl SharedSink {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let erased = BoxCloneService::new(sink.map_err(|_| ()));
        Self { inner: Arc::new(Mutex::new(erased)) }
    }

    pub(crate) async fn emit(&self, event: LimiterEvent) {
        let svc = self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone();
        emit_best_effort(svc, event).await;
    }
}

impl Default for SharedSink {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSink").finish_non_exhaustive()
    }
}
