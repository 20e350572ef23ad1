//! The public facade: submit runs, query them, start and stop the workers

use super::planner::{self, StagePlanner};
use super::state_machine::{MachineSettings, RecoverySummary};
use super::{Backends, EventReceiver, StateMachine};
use crate::agent::{AgentHarness, AgentRegistry, HarnessSettings};
use crate::analysis::{AnalysisService, HttpAnalysisService};
use crate::audit::JsonlAuditLog;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::error::{OrchestratorError, OrchestratorResult, RunError};
use crate::model::{
    normalize_stages, ArtifactRef, Fanout, NewArtifact, PipelineRun, RunInputs, RunSpec,
    RunStatusReport, RunSummary, StageError, StageKey, StageKind, TaskStatus,
};
use crate::queue::InMemoryTaskQueue;
use crate::routing::{Router, RouterSettings};
use crate::store::{FsArtifactStore, FsTaskStore, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runtime settings derived from configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub orchestrator_id: String,
    pub router_instances: usize,
    pub max_concurrency: usize,
    pub router: RouterSettings,
    pub harness: HarnessSettings,
    pub machine: MachineSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let backoff = config.backoff();
        let queue_retry_attempts = config.retry.queue_retry_attempts;
        Self {
            orchestrator_id: config.orchestrator.id.clone(),
            router_instances: config.orchestrator.router_instances,
            max_concurrency: config.orchestrator.max_concurrency,
            router: RouterSettings {
                dispatch_wait: config.dispatch_wait(),
                backoff,
                queue_retry_attempts,
            },
            harness: HarnessSettings {
                backoff,
                queue_retry_attempts,
                default_agent_timeout: Duration::from_secs(config.pipeline.agent_timeout_secs),
            },
            machine: MachineSettings {
                inline_payload_threshold: config.orchestrator.inline_payload_threshold,
                backoff,
                queue_retry_attempts,
            },
        }
    }
}

/// Builds an [`Orchestrator`], defaulting every dependency from configuration
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    service: Option<Arc<dyn AnalysisService>>,
    registry: Option<AgentRegistry>,
    backends: Option<Backends>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            service: None,
            registry: None,
            backends: None,
        }
    }

    pub fn analysis_service(mut self, service: Arc<dyn AnalysisService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn backends(mut self, backends: Backends) -> Self {
        self.backends = Some(backends);
        self
    }

    pub async fn build(self) -> OrchestratorResult<Orchestrator> {
        self.config.validate()?;
        let settings = OrchestratorSettings::from_config(&self.config);

        let backends = match (self.backends, &self.config.orchestrator.data_dir) {
            (Some(backends), _) => backends,
            (None, Some(dir)) => {
                info!(data_dir = %dir.display(), "Opening durable stores");
                Backends::new(
                    Arc::new(FsTaskStore::open(dir).await?),
                    Arc::new(FsArtifactStore::open(dir).await?),
                    Arc::new(JsonlAuditLog::open(dir).await?),
                    Arc::new(InMemoryTaskQueue::new()),
                )
            }
            (None, None) => Backends::in_memory(),
        };

        let service: Arc<dyn AnalysisService> = match self.service {
            Some(service) => service,
            None => Arc::new(HttpAnalysisService::new(self.config.http_analysis_config()?)?),
        };
        let registry = Arc::new(self.registry.unwrap_or_else(AgentRegistry::standard));

        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Arc::new(StateMachine::new(backends.clone(), settings.machine, tx.clone()));
        let harness = AgentHarness::new(
            backends.clone(),
            Arc::clone(&registry),
            Arc::clone(&service),
            settings.harness,
            tx,
        );

        Ok(Orchestrator {
            config: self.config,
            settings,
            backends,
            registry,
            service,
            machine,
            harness,
            events: std::sync::Mutex::new(Some(rx)),
            workers: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

/// Background tasks started by [`Orchestrator::start`]
struct Workers {
    stop_routers: watch::Sender<bool>,
    stop_engine: watch::Sender<bool>,
    routers: Vec<JoinHandle<()>>,
    engine: JoinHandle<()>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    settings: OrchestratorSettings,
    backends: Backends,
    registry: Arc<AgentRegistry>,
    service: Arc<dyn AnalysisService>,
    machine: Arc<StateMachine>,
    harness: AgentHarness,
    events: std::sync::Mutex<Option<EventReceiver>>,
    workers: Mutex<Option<Workers>>,
    closed: AtomicBool,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Validate and persist a run, then enqueue its first stage
    pub async fn submit_run(&self, spec: RunSpec, inputs: RunInputs) -> OrchestratorResult<Uuid> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunError::ShuttingDown.into());
        }

        let stages = normalize_stages(&spec.stages)?;
        let missing = self.registry.missing(&stages);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|k| k.to_string()).collect();
            return Err(StageError::InvalidStageList(format!(
                "no agent registered for {}",
                names.join(", ")
            ))
            .into());
        }
        if let Some(spec) = stages.iter().find(|s| s.fanout == Fanout::PerDocument) {
            if inputs.documents.is_empty() {
                return Err(RunError::NoDocuments {
                    stage: spec.kind.to_string(),
                }
                .into());
            }
        }
        let mut seen = HashSet::new();
        for document in &inputs.documents {
            if !seen.insert(document.id.as_str()) {
                return Err(RunError::DuplicateDocument(document.id.clone()).into());
            }
        }
        let policy = spec.policy;
        policy
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("run policy: {e}")))?;

        let run_id = Uuid::new_v4();
        let content = serde_json::to_value(&inputs)
            .map_err(|e| OrchestratorError::internal(format!("run inputs do not serialise: {e}")))?;
        let inputs_artifact = self
            .backends
            .artifacts
            .put(NewArtifact::json(
                run_id,
                StageKey::first(stages[0].kind),
                Uuid::nil(),
                0,
                format!("run-inputs:{run_id}"),
                content,
            ))
            .await?;

        let document_ids = inputs.documents.iter().map(|d| d.id.clone()).collect();
        let run = PipelineRun::new(RunSpec { stages, policy }, inputs_artifact, document_ids, run_id);
        self.machine.start_run(run).await?;
        Ok(run_id)
    }

    async fn run(&self, run_id: Uuid) -> OrchestratorResult<PipelineRun> {
        self.backends
            .tasks
            .get_run(run_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => RunError::NotFound(run_id).into(),
                other => other.into(),
            })
    }

    pub async fn get_run_status(&self, run_id: Uuid) -> OrchestratorResult<RunStatusReport> {
        let run = self.run(run_id).await?;
        let tasks = self.backends.tasks.tasks_for_run(run_id).await?;

        let (completed_count, expected_count) = match run.current_stage {
            Some(stage) => {
                let completed = tasks
                    .iter()
                    .filter(|t| t.stage == stage && t.is_terminal())
                    .count() as u32;
                let expected = run.progress(&stage).map(|p| p.expected).unwrap_or(0);
                (completed, expected)
            }
            None => (0, 0),
        };

        let latest_check = run
            .fanout_counts
            .iter()
            .rev()
            .map(|p| p.stage)
            .find(|s| s.kind == StageKind::FactCheck);
        let findings = match latest_check {
            Some(key) => {
                StagePlanner::new(self.backends.artifacts.as_ref())
                    .findings_of(&tasks, &key)
                    .await?
            }
            None => Vec::new(),
        };

        Ok(RunStatusReport {
            run_id,
            status: run.status,
            stage: run.current_stage,
            completed_count,
            expected_count,
            findings,
            gaps: planner::gaps(&run, &tasks),
            warnings: run.warnings,
            abort_reason: run.abort_reason,
        })
    }

    /// Artifacts of every succeeded task of the run
    pub async fn get_artifacts(&self, run_id: Uuid) -> OrchestratorResult<Vec<ArtifactRef>> {
        self.run(run_id).await?;
        let tasks = self.backends.tasks.tasks_for_run(run_id).await?;
        Ok(planner::artifact_refs(&tasks))
    }

    pub async fn summary(&self, run_id: Uuid) -> OrchestratorResult<RunSummary> {
        let run = self.run(run_id).await?;
        let tasks = self.backends.tasks.tasks_for_run(run_id).await?;
        Ok(RunSummary {
            run_id,
            status: run.status,
            artifacts: planner::artifact_refs(&tasks),
            final_artifact: run.final_artifact.clone(),
            gaps: planner::gaps(&run, &tasks),
            warnings: run.warnings,
            abort_reason: run.abort_reason,
            created_at: run.created_at,
            completed_at: run.completed_at,
        })
    }

    /// Start the engine and the router instances
    pub async fn start(&self) -> OrchestratorResult<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            warn!("Orchestrator already started");
            return Ok(());
        }
        let rx = self
            .events
            .lock()
            .map_err(|_| OrchestratorError::internal("event receiver lock poisoned"))?
            .take()
            .ok_or_else(|| OrchestratorError::internal("orchestrator cannot be restarted"))?;

        match self.service.health_check().await {
            Ok(()) => info!(service = self.service.name(), "Analysis service healthy"),
            Err(e) => warn!(
                service = self.service.name(),
                error = %e,
                "Analysis service health check failed; tasks will retry"
            ),
        }

        let (stop_engine, engine_rx) = watch::channel(false);
        let engine = tokio::spawn(Arc::clone(&self.machine).run_engine(rx, engine_rx));

        let (stop_routers, routers_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let routers = (0..self.settings.router_instances)
            .map(|id| {
                let router = Router::new(
                    id,
                    self.backends.clone(),
                    self.harness.clone(),
                    Arc::clone(&permits),
                    self.settings.router,
                );
                tokio::spawn(router.run(routers_rx.clone()))
            })
            .collect();

        *workers = Some(Workers {
            stop_routers,
            stop_engine,
            routers,
            engine,
        });
        info!(
            orchestrator_id = %self.settings.orchestrator_id,
            routers = self.settings.router_instances,
            max_concurrency = self.settings.max_concurrency,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop dispatching, wait for in-flight agents, then stop the engine
    ///
    /// Tasks waiting on a backoff timer stay `failed` in the task store and are
    /// picked up by [`Orchestrator::recover`] on the next start.
    pub async fn shutdown(&self) -> OrchestratorResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let Some(workers) = self.workers.lock().await.take() else {
            return Ok(());
        };
        info!("Shutting down orchestrator");

        let _ = workers.stop_routers.send(true);
        for handle in workers.routers {
            if let Err(e) = handle.await {
                error!(error = %e, "Router shutdown error");
            }
        }

        let _ = workers.stop_engine.send(true);
        if let Err(e) = workers.engine.await {
            error!(error = %e, "Engine shutdown error");
        }
        self.machine.cancel_timers();
        self.backends.queue.close().await;
        info!("Orchestrator shutdown complete");
        Ok(())
    }

    /// Re-derive in-flight state from the durable stores
    pub async fn recover(&self) -> OrchestratorResult<RecoverySummary> {
        self.machine.recover().await
    }

    /// Wait until the run is terminal and return its summary
    pub async fn wait_for_run(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> OrchestratorResult<RunSummary> {
        self.machine.wait_until_terminal(run_id, timeout).await?;
        self.summary(run_id).await
    }

    /// Runs that have not reached a terminal status
    pub async fn active_runs(&self) -> OrchestratorResult<Vec<Uuid>> {
        Ok(self
            .backends
            .tasks
            .list_runs()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.run_id)
            .collect())
    }

    /// Tasks of a run still waiting for an outcome
    pub async fn pending_tasks(&self, run_id: Uuid) -> OrchestratorResult<usize> {
        Ok(self
            .backends
            .tasks
            .tasks_for_run(run_id)
            .await?
            .iter()
            .filter(|t| !matches!(t.status, TaskStatus::Succeeded | TaskStatus::PermanentlyFailed))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Document, RunPolicy, StageSpec};
    use crate::testing::mocks::MockAnalysisService;
    use serde_json::json;

    async fn orchestrator(registry: AgentRegistry) -> Orchestrator {
        Orchestrator::builder(OrchestratorConfig::default())
            .analysis_service(Arc::new(MockAnalysisService::echo()))
            .registry(registry)
            .build()
            .await
            .unwrap()
    }

    fn spec(kinds: &[StageKind]) -> RunSpec {
        RunSpec {
            stages: kinds.iter().copied().map(StageSpec::new).collect(),
            policy: RunPolicy::default(),
        }
    }

    fn document(id: &str) -> Document {
        Document {
            id: id.to_string(),
            title: None,
            content: json!("text"),
        }
    }

    #[tokio::test]
    async fn test_per_document_stage_needs_documents() {
        let orch = orchestrator(AgentRegistry::standard()).await;
        let err = orch
            .submit_run(spec(&[StageKind::Analyse]), RunInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Run(RunError::NoDocuments { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_documents_are_rejected() {
        let orch = orchestrator(AgentRegistry::standard()).await;
        let inputs = RunInputs {
            documents: vec![document("a"), document("a")],
            parameters: json!({}),
        };
        let err = orch
            .submit_run(spec(&[StageKind::Analyse]), inputs)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Run(RunError::DuplicateDocument(id)) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_stage_without_agent_is_rejected() {
        let orch = orchestrator(AgentRegistry::empty()).await;
        let err = orch
            .submit_run(spec(&[StageKind::Synthesis]), RunInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Stage(_)));
        assert!(orch.active_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_policy_is_rejected_before_anything_is_stored() {
        let orch = orchestrator(AgentRegistry::standard()).await;
        let policies = [
            RunPolicy {
                run_timeout_secs: u64::MAX,
                ..Default::default()
            },
            RunPolicy {
                run_timeout_secs: 0,
                ..Default::default()
            },
            RunPolicy {
                agent_timeout_secs: 0,
                ..Default::default()
            },
            RunPolicy {
                max_attempts: 0,
                ..Default::default()
            },
        ];
        for policy in policies {
            let run = RunSpec {
                policy,
                ..spec(&[StageKind::Synthesis])
            };
            let err = orch
                .submit_run(run, RunInputs::default())
                .await
                .unwrap_err();
            assert!(
                matches!(err, OrchestratorError::Config(ConfigError::InvalidConfig(_))),
                "accepted {policy:?}"
            );
        }
        assert!(orch.active_runs().await.unwrap().is_empty());
        assert_eq!(orch.backends().artifacts.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let orch = orchestrator(AgentRegistry::standard()).await;
        let err = orch.get_run_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Run(RunError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let orch = orchestrator(AgentRegistry::standard()).await;
        orch.start().await.unwrap();
        orch.shutdown().await.unwrap();
        let err = orch
            .submit_run(spec(&[StageKind::Synthesis]), RunInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Run(RunError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_status_reports_current_stage() {
        let orch = orchestrator(AgentRegistry::standard()).await;
        let inputs = RunInputs {
            documents: vec![document("a"), document("b")],
            parameters: json!({}),
        };
        let run_id = orch
            .submit_run(spec(&[StageKind::Analyse]), inputs)
            .await
            .unwrap();

        let status = orch.get_run_status(run_id).await.unwrap();
        assert_eq!(status.stage, Some(StageKey::first(StageKind::Analyse)));
        assert_eq!(status.expected_count, 2);
        assert_eq!(status.completed_count, 0);
        assert_eq!(orch.pending_tasks(run_id).await.unwrap(), 2);
        orch.shutdown().await.unwrap();
    }
}
