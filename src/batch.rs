//! Paced batch executor.
//!
//! Tasks are queued and drained in fixed-size concurrent batches with a pause between
//! batches, bounding how many lookups are in flight at once. Each task settles
//! independently: one failing or panicking task never affects its batch mates.

use crate::config::BatchConfig;
use crate::error::SchedulerError;
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type Job = BoxFuture<'static, ()>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    draining: bool,
    closed: bool,
}

struct SchedulerInner {
    queue: Mutex<Queue>,
    config: BatchConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl SchedulerInner {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded-concurrency batch executor. Clones share one queue.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.inner.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self::with_sleeper(config, TokioSleeper)
    }

    pub fn with_sleeper<S: Sleeper + 'static>(config: BatchConfig, sleeper: S) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(Queue::default()),
                config,
                sleeper: Arc::new(sleeper),
            }),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.inner.config
    }

    /// Queue `task` and return its eventual output.
    ///
    /// The task is enqueued immediately and runs whether or not the returned future is
    /// awaited. Must be called within a Tokio runtime.
    pub fn add<T, Fut>(&self, task: Fut) -> impl Future<Output = Result<T, SchedulerError>> + Send
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|_| SchedulerError::TaskPanicked);
            let _ = tx.send(outcome);
        });

        let start_drain = {
            let mut queue = self.inner.queue();
            if queue.closed {
                // Dropping the job drops `tx`, which resolves the caller with `Closed`.
                drop(job);
                false
            } else {
                queue.jobs.push_back(job);
                !std::mem::replace(&mut queue.draining, true)
            }
        };
        if start_drain {
            tokio::spawn(Self::drain(Arc::clone(&self.inner)));
        }

        async move { rx.await.unwrap_or(Err(SchedulerError::Closed)) }
    }

    async fn drain(inner: Arc<SchedulerInner>) {
        let size = inner.config.batch_size();
        loop {
            let batch: Vec<Job> = {
                let mut queue = inner.queue();
                let take = size.min(queue.jobs.len());
                if take == 0 {
                    queue.draining = false;
                    return;
                }
                queue.jobs.drain(..take).collect()
            };
            tracing::trace!(tasks = batch.len(), "running batch");
            futures::future::join_all(batch).await;

            {
                let mut queue = inner.queue();
                if queue.jobs.is_empty() {
                    queue.draining = false;
                    return;
                }
            }
            inner.sleeper.sleep(inner.config.batch_delay()).await;
        }
    }

    /// Tasks queued but not yet started.
    pub fn pending(&self) -> usize {
        self.inner.queue().jobs.len()
    }

    /// Reject new tasks and drop queued ones; their callers get
    /// [`SchedulerError::Closed`]. A batch already running completes.
    pub fn close(&self) {
        let dropped: Vec<Job> = {
            let mut queue = self.inner.queue();
            queue.closed = true;
            queue.jobs.drain(..).collect()
        };
        if !dropped.is_empty() {
            tracing::debug!(dropped = dropped.len(), "batch scheduler closed with queued tasks");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue().closed
    }
}
