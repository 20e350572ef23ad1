//! Router: the dispatch loop between the queue and the agent harness
//!
//! Each router dequeues task references in FIFO order, validates them against
//! the task store, marks them dispatched and hands them to the harness once a
//! concurrency permit is available. Several routers may share one queue and
//! one permit pool.

use crate::agent::AgentHarness;
use crate::audit::{self, AuditEntry, AuditEventType};
use crate::dispatch_span;
use crate::error::ExecutionError;
use crate::model::{Task, TaskRef, TaskTransition};
use crate::observability::metrics::metrics;
use crate::pipeline::Backends;
use crate::queue::{enqueue_with_retry, BackoffPolicy};
use crate::store::StoreError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Dispatch settings shared by every router instance
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    /// How long to wait for a concurrency permit before the spawn counts as failed
    pub dispatch_wait: Duration,
    pub backoff: BackoffPolicy,
    pub queue_retry_attempts: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            dispatch_wait: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            queue_retry_attempts: 5,
        }
    }
}

pub struct Router {
    id: usize,
    backends: Backends,
    harness: AgentHarness,
    permits: Arc<Semaphore>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        id: usize,
        backends: Backends,
        harness: AgentHarness,
        permits: Arc<Semaphore>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            id,
            backends,
            harness,
            permits,
            settings,
        }
    }

    /// Dispatch until `shutdown` flips or the queue closes, then wait for in-flight agents
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(router = self.id, "Router started");
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(finished) = in_flight.try_join_next() {
                log_join(self.id, finished);
            }
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.backends.queue.dequeue() => next,
            };

            match next {
                Ok(Some(task_ref)) => self.dispatch(task_ref, &mut in_flight).await,
                Ok(None) => {
                    info!(router = self.id, "Queue closed");
                    break;
                }
                Err(e) => {
                    let wait = self.settings.backoff.delay_for(1);
                    warn!(router = self.id, error = %e, "Dequeue failed, backing off");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        if !in_flight.is_empty() {
            info!(router = self.id, in_flight = in_flight.len(), "Waiting for in-flight agents");
        }
        while let Some(finished) = in_flight.join_next().await {
            log_join(self.id, finished);
        }
        info!(router = self.id, "Router stopped");
    }

    async fn dispatch(&self, task_ref: TaskRef, in_flight: &mut JoinSet<()>) {
        let span = dispatch_span!(task_id = %task_ref.task_id, router = self.id);
        async {
            let Some(task) = self.load(task_ref).await else {
                return;
            };
            if task.is_terminal() {
                self.duplicate_delivery(&task, "task already terminal").await;
                return;
            }

            let task = match self
                .backends
                .tasks
                .transition(task.task_id, TaskTransition::Dispatch)
                .await
            {
                Ok(task) => task,
                Err(StoreError::Transition(e)) => {
                    self.duplicate_delivery(&task, &e.to_string()).await;
                    return;
                }
                Err(e) if e.is_transient() => {
                    self.redeliver(task_ref, &e).await;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Could not mark task dispatched");
                    return;
                }
            };
            audit::record(
                self.backends.audit.as_ref(),
                AuditEntry::task(task.run_id, task.task_id, AuditEventType::TaskDispatched)
                    .with_detail(json!({
                        "stage": task.stage.to_string(),
                        "shard": task.shard,
                        "attempt": task.attempt_count + 1,
                        "router": self.id,
                    })),
            )
            .await;
            metrics().task_dispatched();
            debug!(stage = %task.stage, shard = task.shard, "Task dispatched");

            let acquired = tokio::time::timeout(
                self.settings.dispatch_wait,
                Arc::clone(&self.permits).acquire_owned(),
            )
            .await;
            let permit = match acquired {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    self.spawn_failed(&task, "executor closed").await;
                    return;
                }
                Err(_) => {
                    self.spawn_failed(&task, "no execution slot within dispatch wait")
                        .await;
                    return;
                }
            };

            let harness = self.harness.clone();
            let task_id = task.task_id;
            in_flight.spawn(async move {
                harness.run(task_id).await;
                drop(permit);
            });
        }
        .instrument(span)
        .await
    }

    /// Task record behind a reference; `None` when there is nothing to dispatch
    async fn load(&self, task_ref: TaskRef) -> Option<Task> {
        match self.backends.tasks.get_task(task_ref.task_id).await {
            Ok(task) => Some(task),
            Err(e) if e.is_transient() => {
                self.redeliver(task_ref, &e).await;
                None
            }
            Err(e) => {
                // No run to attribute the reference to; audited under the nil run
                audit::record(
                    self.backends.audit.as_ref(),
                    AuditEntry::task(Uuid::nil(), task_ref.task_id, AuditEventType::CorruptReference)
                        .with_detail(json!({"error": e.to_string(), "router": self.id})),
                )
                .await;
                warn!(error = %e, "Dropping queue entry without a task record");
                None
            }
        }
    }

    async fn duplicate_delivery(&self, task: &Task, reason: &str) {
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::task(task.run_id, task.task_id, AuditEventType::DuplicateDelivery)
                .with_detail(json!({
                    "status": task.status,
                    "reason": reason,
                    "router": self.id,
                })),
        )
        .await;
        debug!(status = %task.status.as_str(), "Duplicate delivery ignored");
    }

    /// Put a reference back when the task store is briefly unavailable
    async fn redeliver(&self, task_ref: TaskRef, cause: &StoreError) {
        warn!(error = %cause, "Task store unavailable, redelivering reference");
        let requeued = enqueue_with_retry(
            self.backends.queue.as_ref(),
            task_ref,
            Some(self.settings.backoff.delay_for(1)),
            &self.settings.backoff,
            self.settings.queue_retry_attempts,
        )
        .await;
        if let Err(e) = requeued {
            error!(error = %e, "Could not redeliver reference; recovery will requeue the task");
        }
    }

    async fn spawn_failed(&self, task: &Task, reason: &str) {
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::task(task.run_id, task.task_id, AuditEventType::SpawnFailed).with_detail(
                json!({
                    "stage": task.stage.to_string(),
                    "reason": reason,
                    "wait_ms": self.settings.dispatch_wait.as_millis() as u64,
                }),
            ),
        )
        .await;
        metrics().spawn_failed();
        warn!(reason, "Agent spawn failed");
        self.harness
            .fail_task(task, ExecutionError::transient(format!("spawn failed: {reason}")))
            .await;
    }
}

fn log_join(router: usize, finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!(router, error = %e, "Agent task panicked; recovery will requeue it");
        } else if !e.is_cancelled() {
            error!(router, error = %e, "Agent task failed to join");
        }
    }
}
