//! In-process FIFO queue

use super::{QueueError, TaskQueue};
use crate::model::TaskRef;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

#[derive(Default)]
struct QueueState {
    items: VecDeque<TaskRef>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    available: Notify,
    delayed: AtomicUsize,
}

impl Inner {
    async fn push(&self, task: TaskRef) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.items.push_back(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }
}

/// FIFO queue of task references backed by a `VecDeque`
///
/// Cloning yields another handle to the same queue. Delayed enqueues are
/// held by a timer task and appended at the tail when they fire.
#[derive(Clone, Default)]
pub struct InMemoryTaskQueue {
    inner: Arc<Inner>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// References waiting on a backoff timer
    pub fn delayed(&self) -> usize {
        self.inner.delayed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: TaskRef) -> Result<(), QueueError> {
        self.inner.push(task).await
    }

    async fn enqueue_after(&self, task: TaskRef, delay: Duration) -> Result<(), QueueError> {
        if self.inner.state.lock().await.closed {
            return Err(QueueError::Closed);
        }
        let inner = Arc::clone(&self.inner);
        inner.delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.delayed.fetch_sub(1, Ordering::SeqCst);
            match inner.push(task).await {
                Ok(()) => debug!(task_id = %task.task_id, "Delayed task reference released"),
                Err(e) => warn!(
                    task_id = %task.task_id,
                    error = %e,
                    "Dropping delayed task reference; recovery will requeue it"
                ),
            }
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<TaskRef>, QueueError> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if let Some(task) = state.items.pop_front() {
                    if !state.items.is_empty() {
                        // Hand the wakeup on to the next consumer
                        self.inner.available.notify_one();
                    }
                    return Ok(Some(task));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn depth(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryTaskQueue::new();
        let refs: Vec<TaskRef> = (0..3).map(|_| TaskRef::new(Uuid::new_v4())).collect();
        for r in &refs {
            queue.enqueue(*r).await.unwrap();
        }
        assert_eq!(queue.depth().await, 3);
        for r in &refs {
            assert_eq!(queue.dequeue().await.unwrap(), Some(*r));
        }
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = InMemoryTaskQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = TaskRef::new(Uuid::new_v4());
        queue.enqueue(task).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_close_wakes_consumers() {
        let queue = InMemoryTaskQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;
        assert_eq!(consumer.await.unwrap().unwrap(), None);
        assert_eq!(
            queue.enqueue(TaskRef::new(Uuid::new_v4())).await,
            Err(QueueError::Closed)
        );
    }

    #[tokio::test]
    async fn test_close_drains_remaining_items() {
        let queue = InMemoryTaskQueue::new();
        let task = TaskRef::new(Uuid::new_v4());
        queue.enqueue(task).await.unwrap();
        queue.close().await;
        assert_eq!(queue.dequeue().await.unwrap(), Some(task));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_enqueue() {
        let queue = InMemoryTaskQueue::new();
        let task = TaskRef::new(Uuid::new_v4());
        queue
            .enqueue_after(task, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(queue.delayed(), 1);
        assert_eq!(queue.depth().await, 0);

        assert_eq!(queue.dequeue().await.unwrap(), Some(task));
        assert_eq!(queue.delayed(), 0);
    }
}
