//! Stage agents and the harness that runs them
//!
//! An agent only turns a [`TaskContext`] into output content. Everything
//! around that (idempotent replay, timeouts, artifact writes, retries, audit
//! events and the terminal report) lives in [`harness::AgentHarness`], so no
//! agent can skip it.

pub mod harness;
pub mod registry;
pub mod stages;

use crate::analysis::{AnalysisRequest, AnalysisService};
use crate::error::ExecutionError;
use crate::model::{Artifact, ArtifactId, StageInput, StageKey, StageKind, Task, TaskStatus};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use harness::{AgentHarness, HarnessSettings};
pub use registry::AgentRegistry;
pub use stages::{AnalysisStageAgent, FactCheckAgent, FinalizeAgent, RevisionAgent};

/// Everything an agent may read: the task, its typed input and the artifacts it references
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub input: StageInput,
    pub artifacts: BTreeMap<ArtifactId, Artifact>,
}

impl TaskContext {
    pub fn stage(&self) -> StageKey {
        self.task.stage
    }

    pub fn artifact(&self, id: &ArtifactId) -> Result<&Artifact, ExecutionError> {
        self.artifacts.get(id).ok_or_else(|| {
            ExecutionError::permanent(format!("artifact {} missing from task context", id.short()))
        })
    }

    /// Input plus resolved artifact content, as sent to the analysis service
    pub fn analysis_context(&self) -> Value {
        let artifacts: Map<String, Value> = self
            .artifacts
            .values()
            .map(|artifact| {
                (
                    artifact.artifact_id.to_string(),
                    json!({
                        "stage": artifact.producing_stage.to_string(),
                        "shard": artifact.metadata.shard,
                        "content": artifact.content,
                    }),
                )
            })
            .collect();
        json!({
            "stage": self.task.stage.to_string(),
            "shard": self.task.shard,
            "input": self.input,
            "artifacts": artifacts,
        })
    }

    pub fn request(&self, instruction: &str, output_schema: Option<Value>) -> AnalysisRequest {
        AnalysisRequest {
            run_id: self.task.run_id,
            task_id: self.task.task_id,
            stage: self.task.stage,
            instruction: instruction.to_string(),
            context: self.analysis_context(),
            output_schema,
        }
    }
}

/// One worker type, selected by stage kind
#[async_trait]
pub trait StageAgent: Send + Sync {
    fn stage(&self) -> StageKind;

    /// Produce the content of this task's output artifact
    async fn execute(
        &self,
        ctx: &TaskContext,
        service: &dyn AnalysisService,
    ) -> Result<Value, ExecutionError>;
}

/// Terminal outcome of a task, sent to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskReport {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub stage: StageKey,
    pub status: TaskStatus,
}

impl TaskReport {
    pub fn for_task(task: &Task) -> Self {
        Self {
            run_id: task.run_id,
            task_id: task.task_id,
            stage: task.stage,
            status: task.status,
        }
    }
}
