//! Task records and their lifecycle
//!
//! A [`Task`] is one unit of agent work for one stage occurrence of one run.
//! All status changes go through [`Task::apply`], which enforces the lifecycle
//! and the retry bound.

use crate::model::artifact::ArtifactId;
use crate::model::stage::StageKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    /// Transient failure recorded, retry pending
    Failed,
    PermanentlyFailed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::PermanentlyFailed)
    }

    /// Statuses a dequeued reference may be dispatched from
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task's input lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PayloadRef {
    Inline(Value),
    Artifact(ArtifactId),
}

/// What the queue carries: a reference, never the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: Uuid,
}

impl TaskRef {
    pub fn new(task_id: Uuid) -> Self {
        Self { task_id }
    }

    /// Parse a serialised reference; anything other than a UUID is corrupt
    pub fn parse(raw: &str) -> Result<Self, TransitionError> {
        Uuid::parse_str(raw.trim())
            .map(Self::new)
            .map_err(|_| TransitionError::CorruptReference(raw.to_string()))
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.task_id)
    }
}

/// A task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub stage: StageKey,
    /// Position within a fan-out stage (document index), 0 for single stages
    pub shard: u32,
    pub payload: PayloadRef,
    pub idempotency_key: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub output_artifact: Option<ArtifactId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Requested status change
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Dispatch,
    Start,
    Succeed { artifact_id: ArtifactId },
    /// Charge one attempt; becomes permanently failed at the bound
    RetryLater { error: String },
    Fail { reason: String },
    /// Return in-flight work to the queue after a crash without charging an attempt
    Recover,
}

impl TaskTransition {
    pub fn name(&self) -> &'static str {
        match self {
            TaskTransition::Dispatch => "dispatch",
            TaskTransition::Start => "start",
            TaskTransition::Succeed { .. } => "succeed",
            TaskTransition::RetryLater { .. } => "retry_later",
            TaskTransition::Fail { .. } => "fail",
            TaskTransition::Recover => "recover",
        }
    }
}

/// Lifecycle violations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransitionError {
    #[error("Task {task_id} is already terminal ({status})")]
    AlreadyTerminal { task_id: Uuid, status: TaskStatus },
    #[error("Invalid transition '{transition}' for task {task_id} in status {status}")]
    InvalidTransition {
        task_id: Uuid,
        status: TaskStatus,
        transition: &'static str,
    },
    #[error("Corrupt task reference: {0}")]
    CorruptReference(String),
}

impl Task {
    /// Create a queued task
    pub fn new(
        run_id: Uuid,
        stage: StageKey,
        shard: u32,
        payload: PayloadRef,
        idempotency_key: String,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            run_id,
            stage,
            shard,
            payload,
            idempotency_key,
            status: TaskStatus::Queued,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            output_artifact: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.task_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a transition, returning the resulting status
    pub fn apply(&mut self, transition: TaskTransition) -> Result<TaskStatus, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                task_id: self.task_id,
                status: self.status,
            });
        }

        let invalid = |status: TaskStatus, transition: &TaskTransition| {
            TransitionError::InvalidTransition {
                task_id: self.task_id,
                status,
                transition: transition.name(),
            }
        };

        let next = match (&self.status, &transition) {
            (s, TaskTransition::Dispatch) if s.is_dispatchable() => TaskStatus::Dispatched,
            (TaskStatus::Dispatched, TaskTransition::Start) => TaskStatus::Running,
            (TaskStatus::Running, TaskTransition::Succeed { artifact_id }) => {
                self.output_artifact = Some(artifact_id.clone());
                TaskStatus::Succeeded
            }
            (TaskStatus::Dispatched | TaskStatus::Running, TaskTransition::RetryLater { error }) => {
                self.attempt_count += 1;
                self.last_error = Some(error.clone());
                if self.attempt_count >= self.max_attempts {
                    TaskStatus::PermanentlyFailed
                } else {
                    TaskStatus::Failed
                }
            }
            (_, TaskTransition::Fail { reason }) => {
                self.last_error = Some(reason.clone());
                TaskStatus::PermanentlyFailed
            }
            (TaskStatus::Dispatched | TaskStatus::Running, TaskTransition::Recover) => {
                TaskStatus::Queued
            }
            (status, transition) => return Err(invalid(*status, transition)),
        };

        self.status = next;
        self.updated_at = Utc::now();
        Ok(next)
    }
}
