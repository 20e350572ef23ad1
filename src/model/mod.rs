//! Data model shared by every component
//!
//! Tasks, runs, stages, artifacts and findings. These types carry no I/O;
//! the stores persist them and the state machine drives them.

pub mod artifact;
pub mod finding;
pub mod input;
pub mod run;
pub mod stage;
pub mod task;

pub use artifact::{Artifact, ArtifactId, ArtifactMetadata, ArtifactRef, NewArtifact};
pub use finding::{FactCheckOutput, Finding, FindingKind, ReportedFinding};
pub use input::StageInput;
pub use run::{
    Document, Gap, PipelineRun, RunInputs, RunPolicy, RunSpec, RunStatus, RunStatusReport,
    RunSummary, StageProgress,
};
pub use stage::{normalize_stages, Fanout, StageError, StageKey, StageKind, StageSpec};
pub use task::{PayloadRef, Task, TaskRef, TaskStatus, TaskTransition, TransitionError};
