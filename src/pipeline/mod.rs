//! Run sequencing: the state machine, the stage planner and the public facade
//!
//! The state machine is driven by [`EngineEvent`]s. Agents and routers send
//! a [`TaskReport`] whenever a task reaches a terminal status, run timers send
//! a timeout. A single engine task consumes the channel, so transitions of one
//! run never interleave.

pub mod orchestrator;
pub mod planner;
pub mod state_machine;

use crate::agent::TaskReport;
use crate::audit::AuditLog;
use crate::queue::TaskQueue;
use crate::store::{ArtifactStore, TaskStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorSettings};
pub use planner::{load_stage_input, StagePlanner};
pub use state_machine::{MachineSettings, RecoverySummary, StateMachine};

/// Input of the engine loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TaskTerminal(TaskReport),
    RunTimedOut(Uuid),
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// The shared resources every component works against
#[derive(Clone)]
pub struct Backends {
    pub tasks: Arc<dyn TaskStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub audit: Arc<dyn AuditLog>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Backends {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        artifacts: Arc<dyn ArtifactStore>,
        audit: Arc<dyn AuditLog>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            tasks,
            artifacts,
            audit,
            queue,
        }
    }

    /// Fresh in-memory stores, log and queue
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(crate::store::InMemoryTaskStore::new()),
            Arc::new(crate::store::InMemoryArtifactStore::new()),
            Arc::new(crate::audit::InMemoryAuditLog::new()),
            Arc::new(crate::queue::InMemoryTaskQueue::new()),
        )
    }
}
