//! Task queue: FIFO delivery of task references to routers
//!
//! The queue carries [`TaskRef`]s only. Payloads stay in the stores, so a
//! reference that outlives its task is detected at dispatch time rather than
//! silently executed.

pub mod memory;

use crate::model::TaskRef;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use memory::InMemoryTaskQueue;

/// Queue errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
    #[error("Queue closed")]
    Closed,
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Work queue shared by producers (the state machine) and consumers (routers)
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a reference at the tail
    async fn enqueue(&self, task: TaskRef) -> Result<(), QueueError>;

    /// Append a reference at the tail once `delay` has elapsed
    async fn enqueue_after(&self, task: TaskRef, delay: Duration) -> Result<(), QueueError>;

    /// Wait for the head reference; `None` once the queue is closed and drained
    async fn dequeue(&self) -> Result<Option<TaskRef>, QueueError>;

    /// References currently deliverable (delayed ones excluded)
    async fn depth(&self) -> usize;

    /// Stop accepting work and wake every waiting consumer
    async fn close(&self);
}

/// Exponential backoff with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Enqueue, retrying while the queue reports itself unavailable
///
/// Gives up after `max_tries` attempts and returns the last error. A closed
/// queue is never retried.
pub async fn enqueue_with_retry(
    queue: &dyn TaskQueue,
    task: TaskRef,
    delay: Option<Duration>,
    backoff: &BackoffPolicy,
    max_tries: u32,
) -> Result<(), QueueError> {
    let max_tries = max_tries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match delay {
            Some(delay) if !delay.is_zero() => queue.enqueue_after(task, delay).await,
            _ => queue.enqueue(task).await,
        };
        match result {
            Ok(()) => {
                if attempt > 1 {
                    debug!(task_id = %task.task_id, attempt, "Enqueue succeeded after retry");
                }
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < max_tries => {
                let wait = backoff.delay_for(attempt);
                warn!(
                    task_id = %task.task_id,
                    attempt,
                    max_tries,
                    backoff_ms = wait.as_millis() as u64,
                    error = %e,
                    "Queue unavailable, retrying enqueue"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}
