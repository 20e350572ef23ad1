//! In-memory store backends
//!
//! Used by tests and by `data_dir`-less deployments. State lives behind
//! tokio `RwLock`s; every mutation holds the write lock for its full
//! read-modify-write so transitions are atomic.

use super::{index_key, materialize, sort_tasks, ArtifactStore, StoreError, TaskStore};
use crate::model::{
    Artifact, ArtifactId, NewArtifact, PipelineRun, StageKey, Task, TaskTransition,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct ArtifactState {
    artifacts: HashMap<ArtifactId, Artifact>,
    by_key: HashMap<String, ArtifactId>,
}

/// Content-addressed artifact store held in memory
#[derive(Default)]
pub struct InMemoryArtifactStore {
    state: RwLock<ArtifactState>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, new: NewArtifact) -> Result<ArtifactId, StoreError> {
        let artifact = materialize(new);
        let id = artifact.artifact_id.clone();
        let key = index_key(&artifact.producing_stage, &artifact.metadata.idempotency_key);

        let mut state = self.state.write().await;
        if let Some(existing) = state.by_key.get(&key) {
            if *existing != id {
                return Err(StoreError::IdempotencyConflict {
                    stage: artifact.producing_stage,
                    key: artifact.metadata.idempotency_key,
                    existing: existing.clone(),
                    attempted: id,
                });
            }
            return Ok(id);
        }

        state.by_key.insert(key, id.clone());
        if !state.artifacts.contains_key(&id) {
            debug!(
                artifact_id = %id.short(),
                stage = %artifact.producing_stage,
                size_bytes = artifact.metadata.size_bytes,
                "Stored artifact"
            );
            state.artifacts.insert(id.clone(), artifact);
        }
        Ok(id)
    }

    async fn get(&self, artifact_id: &ArtifactId) -> Result<Artifact, StoreError> {
        self.state
            .read()
            .await
            .artifacts
            .get(artifact_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("artifact", artifact_id))
    }

    async fn exists(&self, artifact_id: &ArtifactId) -> Result<bool, StoreError> {
        Ok(self.state.read().await.artifacts.contains_key(artifact_id))
    }

    async fn find_by_key(
        &self,
        stage: &StageKey,
        idempotency_key: &str,
    ) -> Result<Option<ArtifactId>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .by_key
            .get(&index_key(stage, idempotency_key))
            .cloned())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.artifacts.len())
    }
}

#[derive(Default)]
struct TaskState {
    runs: HashMap<Uuid, PipelineRun>,
    tasks: HashMap<Uuid, Task>,
}

/// Run and task records held in memory
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: RwLock<TaskState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.runs.contains_key(&run.run_id) {
            return Err(StoreError::AlreadyExists {
                kind: "run",
                id: run.run_id.to_string(),
            });
        }
        state.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.runs.get_mut(&run.run_id) {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("run", run.run_id)),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        self.state
            .read()
            .await
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("run", run_id))
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let mut runs: Vec<PipelineRun> = self.state.read().await.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.runs.contains_key(&task.run_id) {
            return Err(StoreError::not_found("run", task.run_id));
        }
        if state.tasks.contains_key(&task.task_id) {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                id: task.task_id.to_string(),
            });
        }
        state.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.state
            .read()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    async fn transition(
        &self,
        task_id: Uuid,
        transition: TaskTransition,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        // Apply on a copy so a rejected transition leaves the record untouched
        let mut updated = task.clone();
        updated.apply(transition)?;
        *task = updated.clone();
        Ok(updated)
    }

    async fn tasks_for_run(&self, run_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect();
        sort_tasks(&mut tasks);
        Ok(tasks)
    }
}
