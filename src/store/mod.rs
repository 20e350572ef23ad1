//! Durable state: the artifact store and the task/run store
//!
//! Both stores are shared by every router and agent and must tolerate
//! concurrent access. The artifact store is content-addressed and exposes no
//! update or delete. The task store only mutates tasks through validated
//! [`TaskTransition`]s applied atomically.

pub mod fs;
pub mod hashing;
pub mod memory;

use crate::model::{
    Artifact, ArtifactId, NewArtifact, PipelineRun, StageKey, Task, TaskTransition,
    TransitionError,
};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use fs::{FsArtifactStore, FsTaskStore};
pub use memory::{InMemoryArtifactStore, InMemoryTaskStore};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
    #[error(
        "Idempotency key {key} for {stage} already maps to artifact {existing}, refusing {attempted}"
    )]
    IdempotencyConflict {
        stage: StageKey,
        key: String,
        existing: ArtifactId,
        attempted: ArtifactId,
    },
    #[error("Invalid task transition: {0}")]
    Transition(#[from] TransitionError),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Content-addressed, immutable artifact storage
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store content; a repeated put of identical content is a no-op returning the same id
    async fn put(&self, artifact: NewArtifact) -> Result<ArtifactId, StoreError>;

    async fn get(&self, artifact_id: &ArtifactId) -> Result<Artifact, StoreError>;

    async fn exists(&self, artifact_id: &ArtifactId) -> Result<bool, StoreError>;

    /// Artifact previously written for `(stage, idempotency_key)`, if any
    async fn find_by_key(
        &self,
        stage: &StageKey,
        idempotency_key: &str,
    ) -> Result<Option<ArtifactId>, StoreError>;

    /// Number of distinct artifacts held
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Keyed store for run records and task records
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn save_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError>;

    async fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError>;

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// Atomically apply a lifecycle transition and return the updated task
    async fn transition(
        &self,
        task_id: Uuid,
        transition: TaskTransition,
    ) -> Result<Task, StoreError>;

    /// All tasks of a run, ordered by stage, then shard
    async fn tasks_for_run(&self, run_id: Uuid) -> Result<Vec<Task>, StoreError>;
}

/// Build the stored form of a new artifact
pub(crate) fn materialize(new: NewArtifact) -> Artifact {
    let artifact_id = hashing::content_id(&new.content);
    let size_bytes = hashing::to_canonical_json(&new.content).len() as u64;
    Artifact {
        artifact_id,
        run_id: new.run_id,
        producing_stage: new.producing_stage,
        producing_task_id: new.producing_task_id,
        metadata: crate::model::ArtifactMetadata {
            idempotency_key: new.idempotency_key,
            stage: new.producing_stage,
            shard: new.shard,
            content_type: new.content_type,
            size_bytes,
            created_at: chrono::Utc::now(),
        },
        content: new.content,
    }
}

/// Index key for the idempotency lookup
pub(crate) fn index_key(stage: &StageKey, idempotency_key: &str) -> String {
    format!("{stage}/{idempotency_key}")
}

pub(crate) fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.stage
            .cmp(&b.stage)
            .then(a.shard.cmp(&b.shard))
            .then(a.created_at.cmp(&b.created_at))
    });
}
