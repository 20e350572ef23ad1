//! The agent execution harness
//!
//! Wraps every agent execution in the same sequence:
//!
//! 1. idempotent replay check on `(stage, idempotency_key)`
//! 2. `fetch`: load the task input and the artifacts it references
//! 3. `execute`: run the stage agent under the per-agent timeout
//! 4. `persist`: write exactly one artifact
//! 5. `report`: record the terminal transition and notify the state machine
//!
//! Transient failures are retried through the queue with backoff until the
//! task's `max_attempts` is used up.

use super::{AgentRegistry, TaskContext, TaskReport};
use crate::analysis::AnalysisService;
use crate::audit::{self, AuditEntry, AuditEventType};
use crate::error::{sanitize_error_message, ExecutionError};
use crate::model::{ArtifactId, NewArtifact, Task, TaskStatus, TaskTransition};
use crate::observability::metrics::{metrics, ExecutionOutcome};
use crate::pipeline::{load_stage_input, Backends, EngineEvent, EventSender};
use crate::queue::{enqueue_with_retry, BackoffPolicy};
use crate::store::StoreError;
use crate::task_span;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Retry and timeout settings shared by every execution
#[derive(Debug, Clone, Copy)]
pub struct HarnessSettings {
    pub backoff: BackoffPolicy,
    /// Enqueue attempts while the queue reports itself unavailable
    pub queue_retry_attempts: u32,
    /// Used when the run record cannot be read
    pub default_agent_timeout: Duration,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            queue_retry_attempts: 5,
            default_agent_timeout: Duration::from_secs(300),
        }
    }
}

/// Runs one dispatched task to an outcome
#[derive(Clone)]
pub struct AgentHarness {
    backends: Backends,
    registry: Arc<AgentRegistry>,
    service: Arc<dyn AnalysisService>,
    settings: HarnessSettings,
    events: EventSender,
}

impl AgentHarness {
    pub fn new(
        backends: Backends,
        registry: Arc<AgentRegistry>,
        service: Arc<dyn AnalysisService>,
        settings: HarnessSettings,
        events: EventSender,
    ) -> Self {
        Self {
            backends,
            registry,
            service,
            settings,
            events,
        }
    }

    /// Execute a task the router has already transitioned to `dispatched`
    pub async fn run(&self, task_id: Uuid) {
        let span = task_span!(task_id = %task_id);
        self.run_task(task_id).instrument(span).await
    }

    async fn run_task(&self, task_id: Uuid) {
        let task = match self.backends.tasks.get_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "Dispatched task could not be loaded; recovery will pick it up");
                return;
            }
        };

        match self
            .backends
            .artifacts
            .find_by_key(&task.stage, &task.idempotency_key)
            .await
        {
            Ok(Some(existing)) => return self.replay(&task, existing).await,
            Ok(None) => {}
            Err(e) => return self.fail_task(&task, e.into()).await,
        }

        let task = match self
            .backends
            .tasks
            .transition(task_id, TaskTransition::Start)
            .await
        {
            Ok(task) => task,
            Err(StoreError::Transition(e)) => {
                debug!(error = %e, "Task no longer startable, skipping");
                return;
            }
            Err(e) => return self.fail_task(&task, e.into()).await,
        };
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::task(task.run_id, task.task_id, AuditEventType::TaskStarted).with_detail(
                json!({"stage": task.stage.to_string(), "attempt": task.attempt_count + 1}),
            ),
        )
        .await;
        info!(
            run_id = %task.run_id,
            stage = %task.stage,
            shard = task.shard,
            attempt = task.attempt_count + 1,
            max_attempts = task.max_attempts,
            "Executing task"
        );

        let timeout = self.agent_timeout(&task).await;
        let started = Instant::now();
        metrics().execution_started();

        let executed = match tokio::time::timeout(timeout, self.execute(&task)).await {
            Ok(result) => result.map_err(|e| (e, false)),
            Err(_) => Err((ExecutionError::timed_out(timeout), true)),
        };
        let persisted = match executed {
            Ok(content) => self.persist(&task, content).await.map_err(|e| (e, false)),
            Err(failure) => Err(failure),
        };
        let stage = task.stage.kind.as_str();

        match persisted {
            Ok(artifact_id) => {
                metrics().execution_finished(stage, started.elapsed(), ExecutionOutcome::Succeeded);
                self.succeed(&task, artifact_id).await;
            }
            Err((err, timed_out)) => {
                let outcome = if timed_out {
                    ExecutionOutcome::TimedOut
                } else if err.is_transient() && task.attempt_count + 1 < task.max_attempts {
                    ExecutionOutcome::Retried
                } else {
                    ExecutionOutcome::PermanentlyFailed
                };
                metrics().execution_finished(stage, started.elapsed(), outcome);
                self.fail_task(&task, err).await;
            }
        }
    }

    async fn agent_timeout(&self, task: &Task) -> Duration {
        match self.backends.tasks.get_run(task.run_id).await {
            Ok(run) => Duration::from_secs(run.policy.agent_timeout_secs),
            Err(e) => {
                warn!(error = %e, "Run record unreadable, using default agent timeout");
                self.settings.default_agent_timeout
            }
        }
    }

    /// Resolve the task input and every artifact it references
    pub async fn fetch(&self, task: &Task) -> Result<TaskContext, ExecutionError> {
        let input = load_stage_input(self.backends.artifacts.as_ref(), &task.payload).await?;
        let mut artifacts = BTreeMap::new();
        for artifact_id in input.referenced_artifacts() {
            let artifact = self.backends.artifacts.get(&artifact_id).await?;
            artifacts.insert(artifact_id, artifact);
        }
        Ok(TaskContext {
            task: task.clone(),
            input,
            artifacts,
        })
    }

    async fn execute(&self, task: &Task) -> Result<Value, ExecutionError> {
        let ctx = self.fetch(task).await?;
        let agent = self.registry.get(task.stage.kind).ok_or_else(|| {
            ExecutionError::permanent(format!("no agent registered for stage '{}'", task.stage.kind))
        })?;
        agent.execute(&ctx, self.service.as_ref()).await
    }

    /// Write the output artifact, registering the task's idempotency key
    pub async fn persist(&self, task: &Task, content: Value) -> Result<ArtifactId, ExecutionError> {
        let artifact = NewArtifact::json(
            task.run_id,
            task.stage,
            task.task_id,
            task.shard,
            task.idempotency_key.clone(),
            content,
        );
        let artifact_id = self.backends.artifacts.put(artifact).await?;
        metrics().artifact_written();
        debug!(artifact_id = %artifact_id.short(), "Artifact persisted");
        Ok(artifact_id)
    }

    async fn succeed(&self, task: &Task, artifact_id: ArtifactId) {
        let transition = TaskTransition::Succeed {
            artifact_id: artifact_id.clone(),
        };
        match self.backends.tasks.transition(task.task_id, transition).await {
            Ok(done) => {
                audit::record(
                    self.backends.audit.as_ref(),
                    AuditEntry::task(done.run_id, done.task_id, AuditEventType::TaskSucceeded)
                        .with_detail(json!({
                            "stage": done.stage.to_string(),
                            "artifact_id": artifact_id,
                            "attempt": done.attempt_count + 1,
                        })),
                )
                .await;
                info!(artifact_id = %artifact_id.short(), "Task succeeded");
                self.report(&done);
            }
            Err(StoreError::Transition(e)) => {
                // Cancelled by a run abort while executing; the artifact stays for replay
                warn!(error = %e, "Task finished after it was cancelled");
            }
            Err(e) => self.fail_task(task, e.into()).await,
        }
    }

    /// Short-circuit a task whose output already exists
    async fn replay(&self, task: &Task, artifact_id: ArtifactId) {
        let tasks = &self.backends.tasks;
        let result = async {
            tasks.transition(task.task_id, TaskTransition::Start).await?;
            tasks
                .transition(
                    task.task_id,
                    TaskTransition::Succeed {
                        artifact_id: artifact_id.clone(),
                    },
                )
                .await
        }
        .await;

        match result {
            Ok(done) => {
                audit::record(
                    self.backends.audit.as_ref(),
                    AuditEntry::task(done.run_id, done.task_id, AuditEventType::ReplaySkipped)
                        .with_detail(json!({
                            "stage": done.stage.to_string(),
                            "artifact_id": artifact_id,
                        })),
                )
                .await;
                metrics().replay_skipped();
                info!(artifact_id = %artifact_id.short(), "Output already exists, skipped execution");
                self.report(&done);
            }
            Err(StoreError::Transition(e)) => debug!(error = %e, "Replay raced another outcome"),
            Err(e) => self.fail_task(task, e.into()).await,
        }
    }

    /// Record a failed execution: requeue with backoff or fail permanently
    ///
    /// Also used by the router when a task cannot be spawned.
    pub async fn fail_task(&self, task: &Task, err: ExecutionError) {
        let message = sanitize_error_message(err.message());
        let transition = if err.is_transient() {
            audit::record(
                self.backends.audit.as_ref(),
                AuditEntry::task(task.run_id, task.task_id, AuditEventType::TransientFailure)
                    .with_detail(json!({
                        "stage": task.stage.to_string(),
                        "error": message,
                        "attempt": task.attempt_count + 1,
                    })),
            )
            .await;
            TaskTransition::RetryLater {
                error: message.clone(),
            }
        } else {
            TaskTransition::Fail {
                reason: message.clone(),
            }
        };

        let updated = match self.backends.tasks.transition(task.task_id, transition).await {
            Ok(updated) => updated,
            Err(StoreError::Transition(e)) => {
                debug!(error = %e, "Task already settled, dropping failure");
                return;
            }
            Err(e) => {
                error!(
                    error = %e,
                    task_error = %message,
                    "Could not record task failure; recovery will requeue the task"
                );
                return;
            }
        };

        match updated.status {
            TaskStatus::Failed => self.requeue(updated).await,
            TaskStatus::PermanentlyFailed => self.permanently_failed(&updated).await,
            status => debug!(status = %status.as_str(), "Unexpected status after failure"),
        }
    }

    async fn requeue(&self, task: Task) {
        let delay = self.settings.backoff.delay_for(task.attempt_count);
        let enqueued = enqueue_with_retry(
            self.backends.queue.as_ref(),
            task.task_ref(),
            Some(delay),
            &self.settings.backoff,
            self.settings.queue_retry_attempts,
        )
        .await;

        match enqueued {
            Ok(()) => {
                metrics().task_retried();
                audit::record(
                    self.backends.audit.as_ref(),
                    AuditEntry::task(task.run_id, task.task_id, AuditEventType::TaskRequeued)
                        .with_detail(json!({
                            "stage": task.stage.to_string(),
                            "attempts_used": task.attempt_count,
                            "max_attempts": task.max_attempts,
                            "delay_ms": delay.as_millis() as u64,
                        })),
                )
                .await;
                warn!(
                    attempts_used = task.attempt_count,
                    max_attempts = task.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = task.last_error.as_deref().unwrap_or_default(),
                    "Transient failure, task requeued"
                );
            }
            Err(e) => {
                let reason = format!("requeue failed: {e}");
                match self
                    .backends
                    .tasks
                    .transition(task.task_id, TaskTransition::Fail { reason })
                    .await
                {
                    Ok(failed) => self.permanently_failed(&failed).await,
                    Err(e) => error!(error = %e, "Could not fail unrequeueable task"),
                }
            }
        }
    }

    async fn permanently_failed(&self, task: &Task) {
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::task(task.run_id, task.task_id, AuditEventType::TaskPermanentlyFailed)
                .with_detail(json!({
                    "stage": task.stage.to_string(),
                    "shard": task.shard,
                    "attempts_used": task.attempt_count,
                    "reason": task.last_error,
                })),
        )
        .await;
        error!(
            run_id = %task.run_id,
            stage = %task.stage,
            shard = task.shard,
            attempts_used = task.attempt_count,
            reason = task.last_error.as_deref().unwrap_or_default(),
            "Task permanently failed"
        );
        self.report(task);
    }

    /// Tell the state machine a task is terminal
    pub fn report(&self, task: &Task) {
        if self
            .events
            .send(EngineEvent::TaskTerminal(TaskReport::for_task(task)))
            .is_err()
        {
            debug!("Engine stopped; terminal report will be re-derived on recovery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisError, AnalysisOutput};
    use crate::model::{
        PayloadRef, PipelineRun, RunPolicy, RunSpec, StageInput, StageKey, StageKind, StageSpec,
    };
    use crate::model::Artifact;
    use crate::store::hashing::content_id;
    use crate::store::{ArtifactStore, InMemoryArtifactStore};
    use async_trait::async_trait;
    use crate::testing::mocks::MockAnalysisService;
    use tokio::sync::mpsc;

    struct Fixture {
        backends: Backends,
        harness: AgentHarness,
        service: Arc<MockAnalysisService>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        run_id: Uuid,
    }

    async fn fixture(service: MockAnalysisService, policy: RunPolicy) -> Fixture {
        fixture_with(Backends::in_memory(), service, policy).await
    }

    async fn fixture_with(
        backends: Backends,
        service: MockAnalysisService,
        policy: RunPolicy,
    ) -> Fixture {
        let service = Arc::new(service);
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = HarnessSettings {
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            ..Default::default()
        };
        let harness = AgentHarness::new(
            backends.clone(),
            Arc::new(AgentRegistry::standard()),
            service.clone(),
            settings,
            tx,
        );
        let run = PipelineRun::new(
            RunSpec {
                stages: vec![StageSpec::new(StageKind::Synthesis)],
                policy,
            },
            content_id(&json!({})),
            Vec::new(),
            Uuid::new_v4(),
        );
        backends.tasks.insert_run(&run).await.unwrap();
        Fixture {
            backends,
            harness,
            service,
            events: rx,
            run_id: run.run_id,
        }
    }

    async fn dispatched_task(f: &Fixture, max_attempts: u32) -> Task {
        let input = StageInput::Upstream {
            upstream: Vec::new(),
            parameters: json!({"topic": "x"}),
        };
        let task = Task::new(
            f.run_id,
            StageKey::first(StageKind::Synthesis),
            0,
            PayloadRef::Inline(serde_json::to_value(input).unwrap()),
            "synthesis-key".to_string(),
            max_attempts,
        );
        f.backends.tasks.insert_task(&task).await.unwrap();
        f.backends
            .tasks
            .transition(task.task_id, TaskTransition::Dispatch)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_persists_one_artifact_and_reports() {
        let mut f = fixture(MockAnalysisService::echo(), RunPolicy::default()).await;
        let task = dispatched_task(&f, 3).await;

        f.harness.run(task.task_id).await;

        let done = f.backends.tasks.get_task(task.task_id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert!(done.output_artifact.is_some());
        assert_eq!(f.backends.artifacts.count().await.unwrap(), 1);
        match f.events.try_recv().unwrap() {
            EngineEvent::TaskTerminal(report) => {
                assert_eq!(report.task_id, task.task_id);
                assert_eq!(report.status, TaskStatus::Succeeded);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_existing_output_is_replayed_without_calling_service() {
        let mut f = fixture(MockAnalysisService::echo(), RunPolicy::default()).await;
        let first = dispatched_task(&f, 3).await;
        f.harness.run(first.task_id).await;
        let _ = f.events.try_recv();

        // Same stage and idempotency key, e.g. re-created after a crash
        let second = dispatched_task(&f, 3).await;
        f.harness.run(second.task_id).await;

        assert_eq!(f.service.total_calls(), 1);
        assert_eq!(f.backends.artifacts.count().await.unwrap(), 1);
        let replayed = f.backends.tasks.get_task(second.task_id).await.unwrap();
        assert_eq!(replayed.status, TaskStatus::Succeeded);
        assert_eq!(
            replayed.output_artifact,
            f.backends
                .tasks
                .get_task(first.task_id)
                .await
                .unwrap()
                .output_artifact
        );
        let events = f.backends.audit.events_for_run(f.run_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == AuditEventType::ReplaySkipped));
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_attempt_charged() {
        let f = fixture(
            MockAnalysisService::new(|_| Err(AnalysisError::unavailable("502"))),
            RunPolicy::default(),
        )
        .await;
        let task = dispatched_task(&f, 3).await;

        f.harness.run(task.task_id).await;

        let failed = f.backends.tasks.get_task(task.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempt_count, 1);

        let requeued = tokio::time::timeout(Duration::from_secs(1), f.backends.queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued, Some(task.task_ref()));
    }

    #[tokio::test]
    async fn test_last_attempt_fails_permanently() {
        let mut f = fixture(
            MockAnalysisService::new(|_| Err(AnalysisError::unavailable("502"))),
            RunPolicy::default(),
        )
        .await;
        let task = dispatched_task(&f, 1).await;

        f.harness.run(task.task_id).await;

        let failed = f.backends.tasks.get_task(task.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::PermanentlyFailed);
        assert!(matches!(
            f.events.try_recv(),
            Ok(EngineEvent::TaskTerminal(TaskReport {
                status: TaskStatus::PermanentlyFailed,
                ..
            }))
        ));
        assert_eq!(f.backends.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let f = fixture(
            MockAnalysisService::new(|_| Err(AnalysisError::rejected("policy"))),
            RunPolicy::default(),
        )
        .await;
        let task = dispatched_task(&f, 3).await;

        f.harness.run(task.task_id).await;

        let failed = f.backends.tasks.get_task(task.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::PermanentlyFailed);
        assert_eq!(failed.attempt_count, 0);
        assert_eq!(f.service.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let policy = RunPolicy {
            agent_timeout_secs: 1,
            ..RunPolicy::default()
        };
        let f = fixture(
            MockAnalysisService::echo().with_delay(Duration::from_secs(5)),
            policy,
        )
        .await;
        let task = dispatched_task(&f, 3).await;

        tokio::time::pause();
        f.harness.run(task.task_id).await;

        let failed = f.backends.tasks.get_task(task.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_permanent() {
        let f = fixture(MockAnalysisService::echo(), RunPolicy::default()).await;
        let task = Task::new(
            f.run_id,
            StageKey::first(StageKind::Synthesis),
            0,
            PayloadRef::Inline(json!({"input": "nonsense"})),
            "bad".to_string(),
            3,
        );
        f.backends.tasks.insert_task(&task).await.unwrap();
        f.backends
            .tasks
            .transition(task.task_id, TaskTransition::Dispatch)
            .await
            .unwrap();

        f.harness.run(task.task_id).await;

        let failed = f.backends.tasks.get_task(task.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::PermanentlyFailed);
        assert_eq!(f.service.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_resolves_referenced_artifacts() {
        let f = fixture(
            MockAnalysisService::new(|_| Ok(AnalysisOutput::new(json!("ok")))),
            RunPolicy::default(),
        )
        .await;
        let upstream = f
            .backends
            .artifacts
            .put(NewArtifact::json(
                f.run_id,
                StageKey::first(StageKind::Analyse),
                Uuid::new_v4(),
                0,
                "analyse-key",
                json!({"result": "analysis"}),
            ))
            .await
            .unwrap();
        let input = StageInput::Upstream {
            upstream: vec![upstream.clone()],
            parameters: Value::Null,
        };
        let task = Task::new(
            f.run_id,
            StageKey::first(StageKind::Synthesis),
            0,
            PayloadRef::Inline(serde_json::to_value(input).unwrap()),
            "k".to_string(),
            3,
        );

        let ctx = f.harness.fetch(&task).await.unwrap();
        assert_eq!(ctx.artifacts[&upstream].content["result"], "analysis");
    }

    /// Artifact store whose key lookup misses, as if a concurrent writer
    /// registered the key between lookup and put
    struct RacingArtifactStore {
        inner: InMemoryArtifactStore,
    }

    #[async_trait]
    impl ArtifactStore for RacingArtifactStore {
        async fn put(&self, artifact: NewArtifact) -> Result<ArtifactId, StoreError> {
            let existing = self
                .inner
                .find_by_key(&artifact.producing_stage, &artifact.idempotency_key)
                .await?;
            match existing {
                Some(existing) => Err(StoreError::IdempotencyConflict {
                    stage: artifact.producing_stage,
                    key: artifact.idempotency_key.clone(),
                    existing,
                    attempted: content_id(&artifact.content),
                }),
                None => self.inner.put(artifact).await,
            }
        }

        async fn get(&self, artifact_id: &ArtifactId) -> Result<Artifact, StoreError> {
            self.inner.get(artifact_id).await
        }

        async fn exists(&self, artifact_id: &ArtifactId) -> Result<bool, StoreError> {
            self.inner.exists(artifact_id).await
        }

        async fn find_by_key(
            &self,
            _stage: &StageKey,
            _idempotency_key: &str,
        ) -> Result<Option<ArtifactId>, StoreError> {
            Ok(None)
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn test_idempotency_conflict_fails_the_later_task_permanently() {
        let memory = Backends::in_memory();
        let backends = Backends::new(
            memory.tasks.clone(),
            Arc::new(RacingArtifactStore {
                inner: InMemoryArtifactStore::new(),
            }),
            memory.audit.clone(),
            memory.queue.clone(),
        );
        let mut f = fixture_with(backends, MockAnalysisService::echo(), RunPolicy::default()).await;

        let first = dispatched_task(&f, 3).await;
        f.harness.run(first.task_id).await;
        let _ = f.events.try_recv();

        let second = dispatched_task(&f, 3).await;
        f.harness.run(second.task_id).await;

        let winner = f.backends.tasks.get_task(first.task_id).await.unwrap();
        assert_eq!(winner.status, TaskStatus::Succeeded);
        let loser = f.backends.tasks.get_task(second.task_id).await.unwrap();
        assert_eq!(loser.status, TaskStatus::PermanentlyFailed);
        assert_eq!(loser.attempt_count, 0);
        assert!(loser.output_artifact.is_none());

        assert_eq!(f.backends.queue.depth().await, 0);
        assert_eq!(f.backends.artifacts.count().await.unwrap(), 1);
        assert_eq!(f.service.total_calls(), 2);
        match f.events.try_recv().unwrap() {
            EngineEvent::TaskTerminal(report) => {
                assert_eq!(report.task_id, second.task_id);
                assert_eq!(report.status, TaskStatus::PermanentlyFailed);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let events = f.backends.audit.events_for_run(f.run_id).await.unwrap();
        let failures: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == AuditEventType::TaskPermanentlyFailed)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id, Some(second.task_id));
        assert!(!events
            .iter()
            .any(|e| e.event_type == AuditEventType::TransientFailure));
    }
}
