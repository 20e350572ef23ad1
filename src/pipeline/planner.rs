//! Stage input planning
//!
//! Decides what each task of a stage occurrence receives. Inputs are derived
//! from durable records only (the run, its task records and their artifacts),
//! so planning the same occurrence twice yields identical payloads and
//! therefore identical idempotency keys.

use crate::agent::stages::findings_from_content;
use crate::error::ExecutionError;
use crate::model::{
    ArtifactId, ArtifactRef, Fanout, Finding, Gap, PayloadRef, PipelineRun, RunInputs,
    StageInput, StageKey, StageKind, Task, TaskStatus,
};
use crate::store::{ArtifactStore, StoreError};
use serde_json::Value;
use thiserror::Error;

/// Planning errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// A store could not be read; planning can be retried
    #[error("Stage inputs unavailable: {0}")]
    Unavailable(String),
    /// The run cannot continue with the records it has
    #[error("Cannot plan stage: {0}")]
    Invalid(String),
}

impl PlanError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlanError::Unavailable(_))
    }
}

impl From<StoreError> for PlanError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Invalid(err.to_string())
        }
    }
}

impl From<ExecutionError> for PlanError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Transient(m) => Self::Unavailable(m),
            ExecutionError::Permanent(m) => Self::Invalid(m),
        }
    }
}

/// Decode a task payload, fetching it first when it was stored as an artifact
pub async fn load_stage_input(
    artifacts: &dyn ArtifactStore,
    payload: &PayloadRef,
) -> Result<StageInput, ExecutionError> {
    let value = match payload {
        PayloadRef::Inline(value) => value.clone(),
        PayloadRef::Artifact(artifact_id) => artifacts.get(artifact_id).await?.content,
    };
    serde_json::from_value(value)
        .map_err(|e| ExecutionError::permanent(format!("malformed task payload: {e}")))
}

/// Permanently failed tasks of a run, as gaps
pub fn gaps(run: &PipelineRun, tasks: &[Task]) -> Vec<Gap> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::PermanentlyFailed)
        .map(|t| {
            let per_document = run
                .stages
                .iter()
                .any(|s| s.kind == t.stage.kind && s.fanout == Fanout::PerDocument);
            Gap {
                stage: t.stage,
                shard: t.shard,
                task_id: t.task_id,
                document_id: per_document
                    .then(|| run.document_ids.get(t.shard as usize).cloned())
                    .flatten(),
                reason: t
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            }
        })
        .collect()
}

/// References to every artifact produced by a succeeded task, in task order
pub fn artifact_refs(tasks: &[Task]) -> Vec<ArtifactRef> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Succeeded)
        .filter_map(|t| {
            t.output_artifact.as_ref().map(|artifact_id| ArtifactRef {
                artifact_id: artifact_id.clone(),
                stage: t.stage,
                task_id: t.task_id,
                shard: t.shard,
            })
        })
        .collect()
}

/// Succeeded outputs of one stage occurrence, ordered by shard
fn succeeded_outputs(tasks: &[Task], key: &StageKey) -> Vec<ArtifactId> {
    let mut outputs: Vec<(u32, ArtifactId)> = tasks
        .iter()
        .filter(|t| t.stage == *key && t.status == TaskStatus::Succeeded)
        .filter_map(|t| t.output_artifact.clone().map(|id| (t.shard, id)))
        .collect();
    outputs.sort();
    outputs.into_iter().map(|(_, id)| id).collect()
}

fn succeeded_task<'t>(tasks: &'t [Task], key: &StageKey) -> Option<&'t Task> {
    tasks
        .iter()
        .find(|t| t.stage == *key && t.status == TaskStatus::Succeeded)
}

/// Plans stage inputs from durable records
pub struct StagePlanner<'a> {
    artifacts: &'a dyn ArtifactStore,
}

impl<'a> StagePlanner<'a> {
    pub fn new(artifacts: &'a dyn ArtifactStore) -> Self {
        Self { artifacts }
    }

    async fn run_inputs(&self, run: &PipelineRun) -> Result<RunInputs, PlanError> {
        let artifact = self.artifacts.get(&run.inputs_artifact).await?;
        serde_json::from_value(artifact.content)
            .map_err(|e| PlanError::Invalid(format!("run inputs do not decode: {e}")))
    }

    async fn input_of(&self, task: &Task) -> Result<StageInput, PlanError> {
        Ok(load_stage_input(self.artifacts, &task.payload).await?)
    }

    /// Findings reported by a fact-check occurrence; empty when it produced nothing
    pub async fn findings_of(&self, tasks: &[Task], key: &StageKey) -> Result<Vec<Finding>, PlanError> {
        let Some(artifact_id) = succeeded_task(tasks, key).and_then(|t| t.output_artifact.as_ref())
        else {
            return Ok(Vec::new());
        };
        let artifact = self.artifacts.get(artifact_id).await?;
        Ok(findings_from_content(&artifact.content)?)
    }

    /// What a stage consumes from the occurrence before it
    async fn upstream_of(
        &self,
        previous: Option<StageKey>,
        tasks: &[Task],
    ) -> Result<Vec<ArtifactId>, PlanError> {
        match previous {
            None => Ok(Vec::new()),
            // After the loop, the checked draft is the result
            Some(key) if key.kind == StageKind::FactCheck => {
                let Some(task) = tasks.iter().find(|t| t.stage == key) else {
                    return Ok(Vec::new());
                };
                Ok(self.input_of(task).await?.draft().cloned().into_iter().collect())
            }
            Some(key) => Ok(succeeded_outputs(tasks, &key)),
        }
    }

    /// Inputs for every task of stage occurrence `key`, one per shard
    pub async fn plan(
        &self,
        run: &PipelineRun,
        key: StageKey,
        fanout: Fanout,
        tasks: &[Task],
    ) -> Result<Vec<StageInput>, PlanError> {
        let previous = run
            .fanout_counts
            .iter()
            .rev()
            .map(|p| p.stage)
            .find(|stage| *stage != key);

        match key.kind {
            StageKind::Finalize => Ok(vec![StageInput::Finalize {
                artifacts: artifact_refs(tasks),
                gaps: gaps(run, tasks),
                unresolved_findings: run.warnings.clone(),
            }]),
            StageKind::FactCheck => Ok(vec![self.plan_fact_check(key, previous, tasks).await?]),
            StageKind::Revision => Ok(vec![self.plan_revision(key, tasks).await?]),
            _ => {
                let inputs = self.run_inputs(run).await?;
                let upstream = self.upstream_of(previous, tasks).await?;
                let planned = match fanout {
                    Fanout::PerDocument => inputs
                        .documents
                        .into_iter()
                        .map(|document| StageInput::Document {
                            document,
                            parameters: inputs.parameters.clone(),
                            upstream: upstream.clone(),
                        })
                        .collect(),
                    Fanout::Single if key.kind == StageKind::PreTest || previous.is_none() => {
                        vec![StageInput::Inputs {
                            inputs: run.inputs_artifact.clone(),
                            parameters: inputs.parameters,
                            upstream,
                        }]
                    }
                    Fanout::Single => vec![StageInput::Upstream {
                        upstream,
                        parameters: inputs.parameters,
                    }],
                };
                if planned.is_empty() {
                    return Err(PlanError::Invalid(format!("stage {key} has no documents")));
                }
                Ok(planned)
            }
        }
    }

    async fn plan_fact_check(
        &self,
        key: StageKey,
        previous: Option<StageKey>,
        tasks: &[Task],
    ) -> Result<StageInput, PlanError> {
        if key.iteration > 1 {
            let checked = StageKey::new(StageKind::FactCheck, key.iteration - 1);
            let revised = StageKey::new(StageKind::Revision, key.iteration - 1);
            let Some(last_check) = tasks.iter().find(|t| t.stage == checked) else {
                return Err(PlanError::Invalid(format!("{key} has no preceding {checked}")));
            };
            let last_input = self.input_of(last_check).await?;
            // A failed revision leaves the previous draft under review
            let draft = match succeeded_outputs(tasks, &revised).into_iter().next() {
                Some(draft) => draft,
                None => last_input
                    .draft()
                    .cloned()
                    .ok_or_else(|| PlanError::Invalid(format!("{checked} had no draft")))?,
            };
            return Ok(StageInput::FactCheck {
                draft,
                sources: last_input.sources().to_vec(),
                iteration: key.iteration,
            });
        }

        let upstream = self.upstream_of(previous, tasks).await?;
        let Some(draft) = upstream.first().cloned() else {
            return Err(PlanError::Invalid(format!(
                "nothing to fact-check: {} produced no output",
                previous.map(|p| p.to_string()).unwrap_or_default()
            )));
        };
        let mut sources = Vec::new();
        for task in tasks.iter().filter(|t| !t.stage.kind.is_loop_stage()) {
            if let (TaskStatus::Succeeded, Some(id)) = (task.status, &task.output_artifact) {
                if *id != draft && !sources.contains(id) {
                    sources.push(id.clone());
                }
            }
        }
        Ok(StageInput::FactCheck {
            draft,
            sources,
            iteration: key.iteration,
        })
    }

    async fn plan_revision(&self, key: StageKey, tasks: &[Task]) -> Result<StageInput, PlanError> {
        let checked = StageKey::new(StageKind::FactCheck, key.iteration);
        let Some(check) = tasks.iter().find(|t| t.stage == checked) else {
            return Err(PlanError::Invalid(format!("{key} has no {checked} to revise from")));
        };
        let check_input = self.input_of(check).await?;
        let draft = check_input
            .draft()
            .cloned()
            .ok_or_else(|| PlanError::Invalid(format!("{checked} had no draft")))?;
        Ok(StageInput::Revision {
            draft,
            findings: self.findings_of(tasks, &checked).await?,
            sources: check_input.sources().to_vec(),
            iteration: key.iteration,
        })
    }
}

/// Serialised payload, spilled to an artifact above `threshold` bytes
pub fn payload_size(input: &StageInput) -> Result<(Value, usize), PlanError> {
    let value = serde_json::to_value(input)
        .map_err(|e| PlanError::Invalid(format!("stage input does not serialise: {e}")))?;
    let size = crate::store::hashing::to_canonical_json(&value).len();
    Ok((value, size))
}
