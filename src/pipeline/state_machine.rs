//! The pipeline state machine
//!
//! Owns every run-level decision: enqueueing a stage occurrence, joining its
//! fan-out, advancing to the next stage or into the fact-check loop, and
//! aborting. Decisions are recomputed from the task store on every terminal
//! report, so a duplicate report or a replay after recovery reaches the same
//! outcome and never enqueues a successor twice.

use super::planner::{self, payload_size, StagePlanner};
use super::{Backends, EngineEvent, EventReceiver, EventSender};
use crate::agent::TaskReport;
use crate::audit::{self, AuditEntry, AuditEventType};
use crate::error::{OrchestratorError, OrchestratorResult, RunError};
use crate::model::{
    Fanout, NewArtifact, PayloadRef, PipelineRun, RunStatus, StageInput, StageKey, StageKind,
    Task, TaskStatus, TaskTransition,
};
use crate::observability::metrics::{metrics, ExecutionOutcome};
use crate::queue::{enqueue_with_retry, BackoffPolicy};
use crate::store::{hashing, StoreError};
use crate::{run_span, stage_span};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// Settings the state machine needs from configuration
#[derive(Debug, Clone, Copy)]
pub struct MachineSettings {
    /// Serialised payloads above this many bytes are stored as artifacts
    pub inline_payload_threshold: usize,
    pub backoff: BackoffPolicy,
    pub queue_retry_attempts: u32,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            inline_payload_threshold: 4096,
            backoff: BackoffPolicy::default(),
            queue_retry_attempts: 5,
        }
    }
}

/// What `recover` found and did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub runs_resumed: usize,
    pub runs_aborted: usize,
    pub tasks_requeued: usize,
    pub tasks_created: usize,
}

/// Where a joined stage leads
enum Advance {
    Stage(StageKey),
    Complete,
}

pub struct StateMachine {
    backends: Backends,
    settings: MachineSettings,
    events: EventSender,
    timers: std::sync::Mutex<HashMap<Uuid, JoinHandle<()>>>,
    finished: Notify,
    /// Serialises run mutations between the engine loop and direct callers
    lock: Mutex<()>,
}

impl StateMachine {
    pub fn new(backends: Backends, settings: MachineSettings, events: EventSender) -> Self {
        Self {
            backends,
            settings,
            events,
            timers: std::sync::Mutex::new(HashMap::new()),
            finished: Notify::new(),
            lock: Mutex::new(()),
        }
    }

    /// Persist a new run, enqueue its first stage and arm its timer
    pub async fn start_run(&self, mut run: PipelineRun) -> OrchestratorResult<()> {
        let _guard = self.lock.lock().await;
        let span = run_span!(run_id = %run.run_id);

        async {
            self.backends.tasks.insert_run(&run).await?;
            audit::record(
                self.backends.audit.as_ref(),
                AuditEntry::run(run.run_id, AuditEventType::RunSubmitted).with_detail(json!({
                    "stages": run.stages.iter().map(|s| s.kind.to_string()).collect::<Vec<_>>(),
                    "documents": run.document_ids.len(),
                    "policy": run.policy,
                })),
            )
            .await;
            metrics().run_submitted();
            info!(
                stages = run.stages.len(),
                documents = run.document_ids.len(),
                "Run submitted"
            );

            let Some(first) = run.stages.first().copied() else {
                self.abort(&mut run, "run has no stages".to_string()).await?;
                return Ok(());
            };
            match self.enqueue_stage(&mut run, StageKey::first(first.kind), &[]).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    let reason = format!("cannot start run: {}", e.sanitized_message());
                    return self.abort(&mut run, reason).await;
                }
            }
            self.arm_timer(&run);
            Ok::<(), OrchestratorError>(())
        }
        .instrument(span)
        .await
    }

    /// Apply one engine event
    pub async fn handle_event(&self, event: EngineEvent) {
        let _guard = self.lock.lock().await;
        let result = match &event {
            EngineEvent::TaskTerminal(report) => {
                let span = stage_span!(run_id = %report.run_id, stage = %report.stage);
                self.evaluate_stage(report.run_id, report.stage)
                    .instrument(span)
                    .await
            }
            EngineEvent::RunTimedOut(run_id) => self.time_out(*run_id).await,
        };

        if let Err(e) = result {
            if e.is_transient() {
                let delay = self.settings.backoff.delay_for(1);
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "State transition deferred, store or queue unavailable"
                );
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(event);
                });
            } else {
                error!(error = %e, ?event, "State transition failed");
            }
        }
    }

    /// Engine loop: applies events until `stop` flips, then drains what is queued
    pub async fn run_engine(self: Arc<Self>, mut rx: EventReceiver, mut stop: watch::Receiver<bool>) {
        info!("State machine engine started");
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        while let Ok(event) = rx.try_recv() {
                            self.handle_event(event).await;
                        }
                        break;
                    }
                }
            }
        }
        info!("State machine engine stopped");
    }

    /// Recompute one stage occurrence's progress and act on a completed join
    async fn evaluate_stage(&self, run_id: Uuid, key: StageKey) -> OrchestratorResult<()> {
        let mut run = self.backends.tasks.get_run(run_id).await?;
        if run.is_terminal() {
            debug!(status = %run.status, "Report for finished run ignored");
            return Ok(());
        }
        let Some(progress) = run.progress(&key).copied() else {
            warn!("Report for a stage occurrence the run never enqueued");
            return Ok(());
        };

        let tasks = self.backends.tasks.tasks_for_run(run_id).await?;
        let stage_tasks: Vec<&Task> = tasks.iter().filter(|t| t.stage == key).collect();
        let completed = stage_tasks.iter().filter(|t| t.is_terminal()).count() as u32;
        let failed = stage_tasks
            .iter()
            .filter(|t| t.status == TaskStatus::PermanentlyFailed)
            .count() as u32;

        if completed != progress.completed {
            run.record_completed(&key, completed);
            self.backends.tasks.save_run(&run).await?;
        }
        if completed < progress.expected {
            debug!(completed, expected = progress.expected, "Stage still running");
            return Ok(());
        }

        if !run.policy.tolerates(failed, progress.expected) {
            warn!(
                failed,
                expected = progress.expected,
                tolerance = run.policy.failure_tolerance,
                "Failure tolerance breached"
            );
            return self
                .abort(&mut run, format!("failure tolerance breached at {key}"))
                .await;
        }

        match self.decide(&mut run, key, &tasks).await {
            Ok(Advance::Complete) => self.complete(&mut run, &tasks).await,
            Ok(Advance::Stage(target)) => {
                let existing = tasks.iter().filter(|t| t.stage == target).count() as u32;
                if let Some(planned) = run.progress(&target) {
                    if existing >= planned.expected {
                        debug!(target = %target, "Successor already enqueued, join is idempotent");
                        return Ok(());
                    }
                }
                if run.progress(&target).is_none() {
                    self.audit_stage_completed(&run, key, completed, failed).await;
                }
                match self.enqueue_stage(&mut run, target, &tasks).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_transient() => Err(e),
                    Err(e) => {
                        let reason = format!("cannot plan {target}: {}", e.sanitized_message());
                        self.abort(&mut run, reason).await
                    }
                }
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                let reason = format!("cannot advance past {key}: {}", e.sanitized_message());
                self.abort(&mut run, reason).await
            }
        }
    }

    /// Choose the successor of a joined stage, recording loop decisions
    async fn decide(
        &self,
        run: &mut PipelineRun,
        key: StageKey,
        tasks: &[Task],
    ) -> OrchestratorResult<Advance> {
        let next_listed = |run: &PipelineRun| match run.next_listed_stage(&key) {
            Some(spec) => Advance::Stage(StageKey::first(spec.kind)),
            None => Advance::Complete,
        };

        let advance = match key.kind {
            StageKind::Finalize => Advance::Complete,
            StageKind::Revision => {
                Advance::Stage(StageKey::new(StageKind::FactCheck, key.iteration + 1))
            }
            StageKind::FactCheck => {
                let findings = StagePlanner::new(self.backends.artifacts.as_ref())
                    .findings_of(tasks, &key)
                    .await?;
                if findings.is_empty() {
                    info!(iteration = key.iteration, "Fact check clean");
                    next_listed(&*run)
                } else {
                    let revision = StageKey::new(StageKind::Revision, key.iteration);
                    let undecided = run.progress(&revision).is_none()
                        && !run.warnings.iter().any(|w| w.iteration == key.iteration);
                    if undecided {
                        audit::record(
                            self.backends.audit.as_ref(),
                            AuditEntry::run(run.run_id, AuditEventType::FindingsRaised)
                                .with_detail(json!({
                                    "stage": key.to_string(),
                                    "count": findings.len(),
                                    "findings": findings,
                                })),
                        )
                        .await;
                    }

                    if key.iteration < run.policy.max_iterations {
                        if undecided {
                            audit::record(
                                self.backends.audit.as_ref(),
                                AuditEntry::run(run.run_id, AuditEventType::RevisionScheduled)
                                    .with_detail(json!({
                                        "stage": revision.to_string(),
                                        "findings": findings.len(),
                                    })),
                            )
                            .await;
                        }
                        info!(
                            iteration = key.iteration,
                            findings = findings.len(),
                            "Findings raised, scheduling revision"
                        );
                        Advance::Stage(revision)
                    } else {
                        if undecided {
                            audit::record(
                                self.backends.audit.as_ref(),
                                AuditEntry::run(run.run_id, AuditEventType::IterationCapReached)
                                    .with_detail(json!({
                                        "stage": key.to_string(),
                                        "max_iterations": run.policy.max_iterations,
                                        "unresolved": findings.len(),
                                    })),
                            )
                            .await;
                        }
                        warn!(
                            iteration = key.iteration,
                            unresolved = findings.len(),
                            "Iteration cap reached, continuing with warnings"
                        );
                        run.warnings = findings;
                        next_listed(&*run)
                    }
                }
            }
            _ => next_listed(&*run),
        };
        Ok(advance)
    }

    async fn audit_stage_completed(&self, run: &PipelineRun, key: StageKey, completed: u32, failed: u32) {
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::run(run.run_id, AuditEventType::StageCompleted).with_detail(json!({
                "stage": key.to_string(),
                "completed": completed,
                "permanently_failed": failed,
            })),
        )
        .await;
        info!(stage = %key, completed, failed, "Stage joined");
    }

    /// Plan a stage occurrence and enqueue the tasks it is missing
    ///
    /// The expected count is saved on the run before any task is inserted so a
    /// crash in between leaves enough to re-plan the missing shards.
    #[instrument(skip(self, run, tasks), fields(run_id = %run.run_id, stage = %key))]
    async fn enqueue_stage(
        &self,
        run: &mut PipelineRun,
        key: StageKey,
        tasks: &[Task],
    ) -> OrchestratorResult<Vec<Uuid>> {
        let fanout = run
            .stages
            .iter()
            .find(|s| s.kind == key.kind)
            .map(|s| s.fanout)
            .unwrap_or(Fanout::Single);
        let planned = StagePlanner::new(self.backends.artifacts.as_ref())
            .plan(run, key, fanout, tasks)
            .await?;

        run.record_expected(key, planned.len() as u32);
        run.status = if key.kind == StageKind::Finalize {
            RunStatus::Finalizing
        } else {
            RunStatus::Running
        };
        self.backends.tasks.save_run(run).await?;

        let existing: HashSet<u32> = tasks
            .iter()
            .filter(|t| t.stage == key)
            .map(|t| t.shard)
            .collect();
        let mut created = Vec::new();
        for (shard, input) in planned.iter().enumerate() {
            let shard = shard as u32;
            if existing.contains(&shard) {
                continue;
            }
            created.push(self.create_task(run, key, shard, input).await?);
        }

        if existing.is_empty() {
            audit::record(
                self.backends.audit.as_ref(),
                AuditEntry::run(run.run_id, AuditEventType::StageStarted).with_detail(json!({
                    "stage": key.to_string(),
                    "expected": planned.len(),
                })),
            )
            .await;
            info!(expected = planned.len(), "Stage started");
        } else {
            info!(missing = created.len(), "Filled missing stage tasks");
        }

        for task in &created {
            self.enqueue_task(task).await;
        }
        Ok(created.iter().map(|t| t.task_id).collect())
    }

    async fn create_task(
        &self,
        run: &PipelineRun,
        key: StageKey,
        shard: u32,
        input: &StageInput,
    ) -> OrchestratorResult<Task> {
        let (value, size) = payload_size(input)?;
        let idempotency_key = hashing::idempotency_key(run.run_id, &key, shard, &value);
        let payload = if size > self.settings.inline_payload_threshold {
            let artifact_id = self
                .backends
                .artifacts
                .put(NewArtifact::json(
                    run.run_id,
                    key,
                    Uuid::nil(),
                    shard,
                    format!("payload:{idempotency_key}"),
                    value,
                ))
                .await?;
            debug!(shard, size, artifact_id = %artifact_id.short(), "Payload stored as artifact");
            PayloadRef::Artifact(artifact_id)
        } else {
            PayloadRef::Inline(value)
        };

        let task = Task::new(
            run.run_id,
            key,
            shard,
            payload,
            idempotency_key,
            run.policy.max_attempts,
        );
        self.backends.tasks.insert_task(&task).await?;
        Ok(task)
    }

    /// Put a task reference on the queue, failing the task if the queue stays down
    async fn enqueue_task(&self, task: &Task) {
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::task(task.run_id, task.task_id, AuditEventType::TaskEnqueued).with_detail(
                json!({"stage": task.stage.to_string(), "shard": task.shard}),
            ),
        )
        .await;

        let enqueued = enqueue_with_retry(
            self.backends.queue.as_ref(),
            task.task_ref(),
            None,
            &self.settings.backoff,
            self.settings.queue_retry_attempts,
        )
        .await;

        match enqueued {
            Ok(()) => {
                metrics().task_enqueued();
                debug!(task_id = %task.task_id, shard = task.shard, "Task enqueued");
            }
            Err(e) => {
                let reason = format!("enqueue failed: {e}");
                error!(task_id = %task.task_id, error = %e, "Could not enqueue task");
                match self
                    .backends
                    .tasks
                    .transition(task.task_id, TaskTransition::Fail { reason })
                    .await
                {
                    Ok(failed) => {
                        audit::record(
                            self.backends.audit.as_ref(),
                            AuditEntry::task(
                                failed.run_id,
                                failed.task_id,
                                AuditEventType::TaskPermanentlyFailed,
                            )
                            .with_detail(json!({
                                "stage": failed.stage.to_string(),
                                "shard": failed.shard,
                                "reason": failed.last_error,
                            })),
                        )
                        .await;
                        metrics().execution_finished(
                            failed.stage.kind.as_str(),
                            Duration::ZERO,
                            ExecutionOutcome::PermanentlyFailed,
                        );
                        let report = TaskReport::for_task(&failed);
                        let _ = self.events.send(EngineEvent::TaskTerminal(report));
                    }
                    Err(e) => error!(error = %e, "Could not fail unenqueueable task"),
                }
            }
        }
    }

    async fn complete(&self, run: &mut PipelineRun, tasks: &[Task]) -> OrchestratorResult<()> {
        let gaps = planner::gaps(run, tasks);
        run.final_artifact = tasks
            .iter()
            .filter(|t| t.stage.kind == StageKind::Finalize && t.status == TaskStatus::Succeeded)
            .find_map(|t| t.output_artifact.clone());
        let with_warnings = !gaps.is_empty() || !run.warnings.is_empty();
        let status = if with_warnings {
            RunStatus::CompletedWithWarnings
        } else {
            RunStatus::Completed
        };
        run.finish(status);
        self.backends.tasks.save_run(run).await?;

        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::run(run.run_id, AuditEventType::RunCompleted).with_detail(json!({
                "status": status,
                "gaps": gaps,
                "warnings": run.warnings.len(),
                "final_artifact": run.final_artifact,
            })),
        )
        .await;
        metrics().run_completed(with_warnings);
        info!(
            run_id = %run.run_id,
            status = %status,
            gaps = gaps.len(),
            warnings = run.warnings.len(),
            "Run completed"
        );
        self.cancel_timer(run.run_id);
        self.finished.notify_waiters();
        Ok(())
    }

    /// Cancel every non-terminal task and mark the run aborted
    async fn abort(&self, run: &mut PipelineRun, reason: String) -> OrchestratorResult<()> {
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::run(run.run_id, AuditEventType::RunAborted)
                .with_detail(json!({"reason": reason, "stage": run.current_stage})),
        )
        .await;

        let tasks = self.backends.tasks.tasks_for_run(run.run_id).await?;
        let mut cancelled = 0usize;
        for task in tasks.iter().filter(|t| !t.is_terminal()) {
            let transition = TaskTransition::Fail {
                reason: reason.clone(),
            };
            match self.backends.tasks.transition(task.task_id, transition).await {
                Ok(failed) => {
                    cancelled += 1;
                    audit::record(
                        self.backends.audit.as_ref(),
                        AuditEntry::task(
                            failed.run_id,
                            failed.task_id,
                            AuditEventType::TaskPermanentlyFailed,
                        )
                        .with_detail(json!({
                            "stage": failed.stage.to_string(),
                            "shard": failed.shard,
                            "reason": reason,
                            "cancelled": true,
                        })),
                    )
                    .await;
                }
                Err(StoreError::Transition(e)) => debug!(error = %e, "Task settled before abort"),
                Err(e) => return Err(e.into()),
            }
        }

        run.abort_reason = Some(reason.clone());
        run.finish(RunStatus::Aborted);
        self.backends.tasks.save_run(run).await?;
        metrics().run_aborted();
        warn!(run_id = %run.run_id, reason = %reason, cancelled, "Run aborted");
        self.cancel_timer(run.run_id);
        self.finished.notify_waiters();
        Ok(())
    }

    async fn time_out(&self, run_id: Uuid) -> OrchestratorResult<()> {
        let mut run = self.backends.tasks.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(());
        }
        self.abort(&mut run, "run timeout".to_string()).await
    }

    fn arm_timer(&self, run: &PipelineRun) {
        let remaining = (run.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let run_id = run.run_id;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let _ = events.send(EngineEvent::RunTimedOut(run_id));
        });
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timers.insert(run_id, handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, run_id: Uuid) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timers.remove(&run_id) {
            handle.abort();
        }
    }

    /// Stop every run timer; used on shutdown
    pub fn cancel_timers(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Re-derive in-flight work for every non-terminal run
    pub async fn recover(&self) -> OrchestratorResult<RecoverySummary> {
        let _guard = self.lock.lock().await;
        let mut summary = RecoverySummary::default();

        for mut run in self.backends.tasks.list_runs().await? {
            if run.is_terminal() {
                continue;
            }
            let span = run_span!(run_id = %run.run_id);
            async {
                if run.deadline <= Utc::now() {
                    summary.runs_aborted += 1;
                    return self.abort(&mut run, "run timeout".to_string()).await;
                }
                summary.runs_resumed += 1;
                self.recover_run(&mut run, &mut summary).await
            }
            .instrument(span)
            .await?;
        }

        info!(
            runs_resumed = summary.runs_resumed,
            runs_aborted = summary.runs_aborted,
            tasks_requeued = summary.tasks_requeued,
            tasks_created = summary.tasks_created,
            "Recovery finished"
        );
        Ok(summary)
    }

    async fn recover_run(
        &self,
        run: &mut PipelineRun,
        summary: &mut RecoverySummary,
    ) -> OrchestratorResult<()> {
        let tasks = self.backends.tasks.tasks_for_run(run.run_id).await?;

        // Shards planned but never inserted before the crash
        let target = match run.current_stage {
            None => run.stages.first().map(|s| StageKey::first(s.kind)),
            Some(current) => {
                let inserted = tasks.iter().filter(|t| t.stage == current).count() as u32;
                run.progress(&current)
                    .filter(|p| inserted < p.expected)
                    .map(|_| current)
            }
        };
        let mut created = Vec::new();
        if let Some(key) = target {
            match self.enqueue_stage(run, key, &tasks).await {
                Ok(ids) => created = ids,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    let reason = format!("cannot plan {key}: {}", e.sanitized_message());
                    return self.abort(run, reason).await;
                }
            }
        }
        summary.tasks_created += created.len();

        let mut requeued = 0usize;
        for task in tasks.iter().filter(|t| !t.is_terminal()) {
            let task = match task.status {
                TaskStatus::Dispatched | TaskStatus::Running => {
                    match self
                        .backends
                        .tasks
                        .transition(task.task_id, TaskTransition::Recover)
                        .await
                    {
                        Ok(task) => task,
                        Err(StoreError::Transition(e)) => {
                            debug!(error = %e, "Task settled during recovery");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                _ => task.clone(),
            };
            self.enqueue_task(&task).await;
            requeued += 1;
        }
        summary.tasks_requeued += requeued;

        let audit_in_flight = self
            .backends
            .audit
            .non_terminal_tasks(run.run_id)
            .await
            .map(|ids| ids.len())
            .unwrap_or_default();
        audit::record(
            self.backends.audit.as_ref(),
            AuditEntry::run(run.run_id, AuditEventType::RunRecovered).with_detail(json!({
                "requeued": requeued,
                "created": created.len(),
                "audit_in_flight": audit_in_flight,
                "stage": run.current_stage,
            })),
        )
        .await;
        info!(requeued, created = created.len(), audit_in_flight, "Run recovered");

        // Joins that completed before the crash but never advanced
        let stages: Vec<StageKey> = run.fanout_counts.iter().map(|p| p.stage).collect();
        for key in stages {
            self.evaluate_stage(run.run_id, key).await?;
        }

        let latest = self.backends.tasks.get_run(run.run_id).await?;
        if !latest.is_terminal() {
            self.arm_timer(&latest);
        }
        Ok(())
    }

    /// Resolve once the run is terminal or `timeout` elapses
    pub async fn wait_until_terminal(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> OrchestratorResult<PipelineRun> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let run = self.backends.tasks.get_run(run_id).await.map_err(|e| match e {
                StoreError::NotFound { .. } => OrchestratorError::Run(RunError::NotFound(run_id)),
                other => other.into(),
            })?;
            if run.is_terminal() {
                return Ok(run);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RunError::WaitTimeout {
                    run_id,
                    waited: timeout,
                }
                .into());
            }
        }
    }
}
