//! Append-only audit and provenance log
//!
//! Every task lifecycle event and every run-level decision is appended here
//! before the corresponding retry or abort takes effect. Events are never
//! mutated or deleted; the log assigns a global sequence number on append.

pub mod jsonl;
pub mod memory;

use crate::observability::metrics::metrics;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

pub use jsonl::JsonlAuditLog;
pub use memory::InMemoryAuditLog;

/// Kinds of audited events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RunSubmitted,
    StageStarted,
    StageCompleted,
    TaskEnqueued,
    TaskDispatched,
    TaskStarted,
    TaskSucceeded,
    ReplaySkipped,
    TransientFailure,
    TaskRequeued,
    TaskPermanentlyFailed,
    SpawnFailed,
    CorruptReference,
    DuplicateDelivery,
    FindingsRaised,
    RevisionScheduled,
    IterationCapReached,
    RunCompleted,
    RunAborted,
    RunRecovered,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::RunSubmitted => "run_submitted",
            AuditEventType::StageStarted => "stage_started",
            AuditEventType::StageCompleted => "stage_completed",
            AuditEventType::TaskEnqueued => "task_enqueued",
            AuditEventType::TaskDispatched => "task_dispatched",
            AuditEventType::TaskStarted => "task_started",
            AuditEventType::TaskSucceeded => "task_succeeded",
            AuditEventType::ReplaySkipped => "replay_skipped",
            AuditEventType::TransientFailure => "transient_failure",
            AuditEventType::TaskRequeued => "task_requeued",
            AuditEventType::TaskPermanentlyFailed => "task_permanently_failed",
            AuditEventType::SpawnFailed => "spawn_failed",
            AuditEventType::CorruptReference => "corrupt_reference",
            AuditEventType::DuplicateDelivery => "duplicate_delivery",
            AuditEventType::FindingsRaised => "findings_raised",
            AuditEventType::RevisionScheduled => "revision_scheduled",
            AuditEventType::IterationCapReached => "iteration_cap_reached",
            AuditEventType::RunCompleted => "run_completed",
            AuditEventType::RunAborted => "run_aborted",
            AuditEventType::RunRecovered => "run_recovered",
        }
    }

    /// Events after which a task is never executed again
    pub fn is_terminal_for_task(&self) -> bool {
        matches!(
            self,
            AuditEventType::TaskSucceeded
                | AuditEventType::ReplaySkipped
                | AuditEventType::TaskPermanentlyFailed
        )
    }

    /// Events that describe a task's lifecycle rather than an observation about it
    fn is_lifecycle(&self) -> bool {
        !matches!(
            self,
            AuditEventType::CorruptReference | AuditEventType::DuplicateDelivery
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub sequence: u64,
    pub run_id: Uuid,
    pub task_id: Option<Uuid>,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: Value,
}

/// An event about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub run_id: Uuid,
    pub task_id: Option<Uuid>,
    pub event_type: AuditEventType,
    pub detail: Value,
}

impl AuditEntry {
    pub fn run(run_id: Uuid, event_type: AuditEventType) -> Self {
        Self {
            run_id,
            task_id: None,
            event_type,
            detail: Value::Null,
        }
    }

    pub fn task(run_id: Uuid, task_id: Uuid, event_type: AuditEventType) -> Self {
        Self {
            run_id,
            task_id: Some(task_id),
            event_type,
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub(crate) fn into_event(self, sequence: u64) -> AuditEvent {
        AuditEvent {
            event_id: Uuid::new_v4(),
            sequence,
            run_id: self.run_id,
            task_id: self.task_id,
            event_type: self.event_type,
            timestamp: Utc::now(),
            detail: self.detail,
        }
    }
}

/// Append-only event sink with per-run queries
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<AuditEvent, StoreError>;

    /// All events of a run ordered by sequence
    async fn events_for_run(&self, run_id: Uuid) -> Result<Vec<AuditEvent>, StoreError>;

    /// Tasks whose latest lifecycle event is not terminal
    async fn non_terminal_tasks(&self, run_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let events = self.events_for_run(run_id).await?;
        Ok(non_terminal_from_events(&events))
    }
}

/// Fold a run's ordered events into the set of tasks still in flight
pub fn non_terminal_from_events(events: &[AuditEvent]) -> Vec<Uuid> {
    let mut latest: HashMap<Uuid, (u64, AuditEventType)> = HashMap::new();
    for event in events {
        let Some(task_id) = event.task_id else {
            continue;
        };
        if !event.event_type.is_lifecycle() {
            continue;
        }
        latest
            .entry(task_id)
            .and_modify(|slot| {
                if event.sequence >= slot.0 {
                    *slot = (event.sequence, event.event_type);
                }
            })
            .or_insert((event.sequence, event.event_type));
    }

    let mut open: Vec<(u64, Uuid)> = latest
        .into_iter()
        .filter(|(_, (_, kind))| !kind.is_terminal_for_task())
        .map(|(task_id, (sequence, _))| (sequence, task_id))
        .collect();
    open.sort();
    open.into_iter().map(|(_, task_id)| task_id).collect()
}

/// Append, logging and counting a dropped event instead of failing when the
/// sink is unavailable
///
/// Used on paths where the lifecycle transition has already been persisted
/// and must not be undone because the audit write failed.
pub async fn record(log: &dyn AuditLog, entry: AuditEntry) {
    let event_type = entry.event_type;
    let run_id = entry.run_id;
    if let Err(e) = log.append(entry).await {
        metrics().audit_event_dropped();
        warn!(
            run_id = %run_id,
            event_type = %event_type,
            error = %e,
            "Failed to append audit event"
        );
    }
}
