//! Mock implementations for testing
//!
//! Provides a scriptable analysis service and a queue that fails on demand, so
//! runs can be driven end to end without a network or a broker.

use crate::analysis::{AnalysisError, AnalysisOutput, AnalysisRequest, AnalysisService, TokenUsage};
use crate::model::{StageKind, TaskRef};
use crate::queue::{InMemoryTaskQueue, QueueError, TaskQueue};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Handler = dyn Fn(&AnalysisRequest) -> Result<AnalysisOutput, AnalysisError> + Send + Sync;

/// Mock analysis service driven by a handler closure
///
/// Every request is recorded before the handler runs, so tests can count
/// calls per stage even when the handler fails.
pub struct MockAnalysisService {
    handler: Box<Handler>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<AnalysisRequest>>>,
    should_fail_health: bool,
}

impl MockAnalysisService {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&AnalysisRequest) -> Result<AnalysisOutput, AnalysisError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            should_fail_health: false,
        }
    }

    /// Answers every stage with a well-formed response
    ///
    /// Fact checks report no findings; other stages echo their stage and context.
    pub fn echo() -> Self {
        Self::new(|request| {
            let content = match request.stage.kind {
                StageKind::FactCheck => json!({"findings": []}),
                _ => json!({
                    "stage": request.stage.to_string(),
                    "echo": request.context,
                }),
            };
            Ok(AnalysisOutput {
                content,
                model: Some("mock-model".to_string()),
                usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
            })
        })
    }

    /// Sleep before answering, to exercise timeouts and in-flight shutdown
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failing_health_check(mut self) -> Self {
        self.should_fail_health = true;
        self
    }

    pub fn calls(&self) -> Vec<AnalysisRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, kind: StageKind) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.stage.kind == kind).count())
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl AnalysisService for MockAnalysisService {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: AnalysisRequest) -> Result<AnalysisOutput, AnalysisError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&request)
    }

    async fn health_check(&self) -> Result<(), AnalysisError> {
        if self.should_fail_health {
            Err(AnalysisError::unavailable("Mock health check failure"))
        } else {
            Ok(())
        }
    }
}

/// In-memory queue whose first `n` enqueues fail as unavailable
#[derive(Clone, Default)]
pub struct UnavailableQueue {
    inner: InMemoryTaskQueue,
    failures_left: Arc<AtomicU32>,
}

impl UnavailableQueue {
    pub fn failing(n: u32) -> Self {
        Self {
            inner: InMemoryTaskQueue::new(),
            failures_left: Arc::new(AtomicU32::new(n)),
        }
    }

    pub fn failures_left(&self) -> u32 {
        self.failures_left.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), QueueError> {
        let took = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(QueueError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskQueue for UnavailableQueue {
    async fn enqueue(&self, task: TaskRef) -> Result<(), QueueError> {
        self.take_failure()?;
        self.inner.enqueue(task).await
    }

    async fn enqueue_after(&self, task: TaskRef, delay: Duration) -> Result<(), QueueError> {
        self.take_failure()?;
        self.inner.enqueue_after(task, delay).await
    }

    async fn dequeue(&self) -> Result<Option<TaskRef>, QueueError> {
        self.inner.dequeue().await
    }

    async fn depth(&self) -> usize {
        self.inner.depth().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
