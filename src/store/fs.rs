//! Filesystem store backends
//!
//! Layout under the data directory:
//!
//! ```text
//! artifacts/<artifact_id>.json
//! artifacts/index.json                 (stage/idempotency_key -> artifact_id)
//! runs/<run_id>/run.json
//! runs/<run_id>/tasks/<task_id>.json
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! crash never leaves a half-written record behind.

use super::{index_key, materialize, sort_tasks, ArtifactStore, StoreError, TaskStore};
use crate::model::{
    Artifact, ArtifactId, NewArtifact, PipelineRun, StageKey, Task, TaskTransition,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INDEX_FILE: &str = "index.json";

/// Write `value` as pretty JSON via temp file + rename
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))
}

fn is_not_found(err: &StoreError) -> bool {
    matches!(err, StoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
}

/// Artifact store persisted as one JSON file per artifact
pub struct FsArtifactStore {
    dir: PathBuf,
    /// Idempotency index mirrored to `index.json`; the lock also serialises writers
    index: Mutex<BTreeMap<String, ArtifactId>>,
}

impl FsArtifactStore {
    /// Open (or create) the store under `<data_dir>/artifacts`
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref().join("artifacts");
        tokio::fs::create_dir_all(&dir).await?;

        let index_path = dir.join(INDEX_FILE);
        let index = match read_json::<BTreeMap<String, ArtifactId>>(&index_path).await {
            Ok(index) => index,
            Err(e) if is_not_found(&e) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        info!(
            path = %dir.display(),
            indexed = index.len(),
            "Opened filesystem artifact store"
        );

        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    fn artifact_path(&self, artifact_id: &ArtifactId) -> PathBuf {
        self.dir.join(format!("{}.json", artifact_id.as_str()))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, new: NewArtifact) -> Result<ArtifactId, StoreError> {
        let artifact = materialize(new);
        let id = artifact.artifact_id.clone();
        let key = index_key(&artifact.producing_stage, &artifact.metadata.idempotency_key);

        let mut index = self.index.lock().await;
        if let Some(existing) = index.get(&key) {
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

        // Content first, then the index entry pointing at it
        let path = self.artifact_path(&id);
        if !tokio::fs::try_exists(&path).await? {
            write_json_atomic(&path, &artifact).await?;
            debug!(
                artifact_id = %id.short(),
                stage = %artifact.producing_stage,
                size_bytes = artifact.metadata.size_bytes,
                "Wrote artifact"
            );
        }
        index.insert(key.clone(), id.clone());
        if let Err(e) = write_json_atomic(&self.dir.join(INDEX_FILE), &*index).await {
            index.remove(&key);
            return Err(e);
        }
        Ok(id)
    }

    async fn get(&self, artifact_id: &ArtifactId) -> Result<Artifact, StoreError> {
        match read_json(&self.artifact_path(artifact_id)).await {
            Err(e) if is_not_found(&e) => Err(StoreError::not_found("artifact", artifact_id)),
            other => other,
        }
    }

    async fn exists(&self, artifact_id: &ArtifactId) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.artifact_path(artifact_id)).await?)
    }

    async fn find_by_key(
        &self,
        stage: &StageKey,
        idempotency_key: &str,
    ) -> Result<Option<ArtifactId>, StoreError> {
        Ok(self
            .index
            .lock()
            .await
            .get(&index_key(stage, idempotency_key))
            .cloned())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".json") && name != INDEX_FILE {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Run and task records persisted as JSON files
pub struct FsTaskStore {
    dir: PathBuf,
    /// task_id -> run_id, rebuilt on open; the lock also serialises writers
    owners: Mutex<HashMap<Uuid, Uuid>>,
}

impl FsTaskStore {
    /// Open (or create) the store under `<data_dir>/runs`, indexing existing tasks
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref().join("runs");
        tokio::fs::create_dir_all(&dir).await?;

        let mut owners = HashMap::new();
        let mut runs = tokio::fs::read_dir(&dir).await?;
        while let Some(run_entry) = runs.next_entry().await? {
            let Ok(run_id) = Uuid::parse_str(&run_entry.file_name().to_string_lossy()) else {
                continue;
            };
            let tasks_dir = run_entry.path().join("tasks");
            let mut tasks = match tokio::fs::read_dir(&tasks_dir).await {
                Ok(tasks) => tasks,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(task_entry) = tasks.next_entry().await? {
                let name = task_entry.file_name();
                let Some(stem) = name.to_string_lossy().strip_suffix(".json").map(String::from)
                else {
                    continue;
                };
                match Uuid::parse_str(&stem) {
                    Ok(task_id) => {
                        owners.insert(task_id, run_id);
                    }
                    Err(_) => warn!(file = %stem, "Ignoring unexpected file in task directory"),
                }
            }
        }
        info!(
            path = %dir.display(),
            tasks = owners.len(),
            "Opened filesystem task store"
        );

        Ok(Self {
            dir,
            owners: Mutex::new(owners),
        })
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(run_id.to_string())
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn task_path(&self, run_id: Uuid, task_id: Uuid) -> PathBuf {
        self.run_dir(run_id)
            .join("tasks")
            .join(format!("{task_id}.json"))
    }

    async fn owner_of(&self, task_id: Uuid) -> Result<Uuid, StoreError> {
        self.owners
            .lock()
            .await
            .get(&task_id)
            .copied()
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }
}

#[async_trait]
impl TaskStore for FsTaskStore {
    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let _guard = self.owners.lock().await;
        let path = self.run_path(run.run_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists {
                kind: "run",
                id: run.run_id.to_string(),
            });
        }
        write_json_atomic(&path, run).await
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let _guard = self.owners.lock().await;
        let path = self.run_path(run.run_id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::not_found("run", run.run_id));
        }
        write_json_atomic(&path, run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        match read_json(&self.run_path(run_id)).await {
            Err(e) if is_not_found(&e) => Err(StoreError::not_found("run", run_id)),
            other => other,
        }
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join("run.json");
            match read_json::<PipelineRun>(&path).await {
                Ok(run) => runs.push(run),
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut owners = self.owners.lock().await;
        if owners.contains_key(&task.task_id) {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                id: task.task_id.to_string(),
            });
        }
        if !tokio::fs::try_exists(self.run_path(task.run_id)).await? {
            return Err(StoreError::not_found("run", task.run_id));
        }
        write_json_atomic(&self.task_path(task.run_id, task.task_id), task).await?;
        owners.insert(task.task_id, task.run_id);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let run_id = self.owner_of(task_id).await?;
        read_json(&self.task_path(run_id, task_id)).await
    }

    async fn transition(
        &self,
        task_id: Uuid,
        transition: TaskTransition,
    ) -> Result<Task, StoreError> {
        let owners = self.owners.lock().await;
        let run_id = owners
            .get(&task_id)
            .copied()
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        let path = self.task_path(run_id, task_id);
        let mut task: Task = read_json(&path).await?;
        task.apply(transition)?;
        write_json_atomic(&path, &task).await?;
        drop(owners);
        Ok(task)
    }

    async fn tasks_for_run(&self, run_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let tasks_dir = self.run_dir(run_id).join("tasks");
        let mut tasks = Vec::new();
        let mut entries = match tokio::fs::read_dir(&tasks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tasks),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            tasks.push(read_json::<Task>(&path).await?);
        }
        sort_tasks(&mut tasks);
        Ok(tasks)
    }
}
