//! Analysis Orchestrator
//!
//! A multi-stage analysis pipeline orchestrator. A run takes a set of
//! documents through an ordered list of stages (pre-test, per-document
//! analysis, synthesis, a bounded fact-check/revision loop and finalisation),
//! executing every unit of work as an isolated task with durable state,
//! content-addressed artifacts and an append-only audit trail.
//!
//! # Overview
//!
//! - [`store`]: content-addressed artifact store and durable task/run records
//! - [`queue`]: FIFO task queue with delayed redelivery and retry backoff
//! - [`agent`]: stage agents and the harness that executes one task at a time
//! - [`routing`]: routers that pull tasks off the queue under a concurrency budget
//! - [`pipeline`]: the run state machine, fan-out/join and the public facade
//! - [`audit`]: append-only event log with per-run ordering
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use analysis_orchestrator::testing::MockAnalysisService;
//! use analysis_orchestrator::{Document, Orchestrator, OrchestratorConfig, RunInputs};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> analysis_orchestrator::OrchestratorResult<()> {
//! let config = OrchestratorConfig::default();
//! let orchestrator = Orchestrator::builder(config.clone())
//!     .analysis_service(Arc::new(MockAnalysisService::echo()))
//!     .build()
//!     .await?;
//! orchestrator.start().await?;
//!
//! let inputs = RunInputs {
//!     documents: vec![Document {
//!         id: "doc-1".to_string(),
//!         title: None,
//!         content: json!("Quarterly revenue grew 4%."),
//!     }],
//!     parameters: json!({}),
//! };
//! let run_id = orchestrator.submit_run(config.run_spec()?, inputs).await?;
//! let summary = orchestrator.wait_for_run(run_id, Duration::from_secs(60)).await?;
//! println!("{run_id}: {}", summary.status);
//!
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod analysis;
pub mod audit;
pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod routing;
pub mod store;
pub mod testing;

pub use analysis::{AnalysisService, HttpAnalysisService};
pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{OrchestratorError, OrchestratorResult, RunError};
pub use model::{
    ArtifactId, ArtifactRef, Document, Finding, PipelineRun, RunInputs, RunPolicy, RunSpec,
    RunStatus, RunStatusReport, RunSummary, StageKey, StageKind, StageSpec, Task, TaskStatus,
};
pub use pipeline::{Backends, Orchestrator, OrchestratorBuilder, RecoverySummary};
pub use queue::TaskQueue;
pub use store::{ArtifactStore, TaskStore};
