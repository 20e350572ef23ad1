//! Stage identifiers and per-run stage lists
//!
//! A run is an ordered list of [`StageSpec`]s. Each concrete occurrence of a
//! stage within a run is named by a [`StageKey`]; the fact-check/revision loop
//! produces several occurrences of the same kind, distinguished by iteration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Named phases of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    PreTest,
    Analyse,
    Synthesis,
    FactCheck,
    Revision,
    Finalize,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::PreTest,
        StageKind::Analyse,
        StageKind::Synthesis,
        StageKind::FactCheck,
        StageKind::Revision,
        StageKind::Finalize,
    ];

    /// Stable snake_case name used in keys, logs and config files
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::PreTest => "pre_test",
            StageKind::Analyse => "analyse",
            StageKind::Synthesis => "synthesis",
            StageKind::FactCheck => "fact_check",
            StageKind::Revision => "revision",
            StageKind::Finalize => "finalize",
        }
    }

    /// Stages that take part in the bounded fact-check/revision loop
    pub fn is_loop_stage(&self) -> bool {
        matches!(self, StageKind::FactCheck | StageKind::Revision)
    }

    /// Default fan-out for a stage listed without an explicit one
    pub fn default_fanout(&self) -> Fanout {
        match self {
            StageKind::Analyse => Fanout::PerDocument,
            _ => Fanout::Single,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pre_test" | "pretest" => Ok(StageKind::PreTest),
            "analyse" | "analyze" => Ok(StageKind::Analyse),
            "synthesis" => Ok(StageKind::Synthesis),
            "fact_check" | "factcheck" => Ok(StageKind::FactCheck),
            "revision" => Ok(StageKind::Revision),
            "finalize" | "finalise" => Ok(StageKind::Finalize),
            other => Err(StageError::UnknownStage(other.to_string())),
        }
    }
}

/// How many tasks a stage splits into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fanout {
    /// One task for the whole run
    Single,
    /// One task per input document
    PerDocument,
}

impl Fanout {
    /// Expected task count for this fan-out given the run's document count
    pub fn expected_count(&self, documents: usize) -> u32 {
        match self {
            Fanout::Single => 1,
            Fanout::PerDocument => documents as u32,
        }
    }
}

/// One entry of a run's ordered stage list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub kind: StageKind,
    pub fanout: Fanout,
}

impl StageSpec {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            fanout: kind.default_fanout(),
        }
    }

    pub fn with_fanout(kind: StageKind, fanout: Fanout) -> Self {
        Self { kind, fanout }
    }
}

/// Identifies a single stage occurrence within a run
///
/// Iteration is 0 for stages outside the fact-check loop and starts at 1 for
/// `fact_check`/`revision` occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageKey {
    pub kind: StageKind,
    pub iteration: u32,
}

impl StageKey {
    pub fn new(kind: StageKind, iteration: u32) -> Self {
        Self { kind, iteration }
    }

    /// Key for the first occurrence of a listed stage
    pub fn first(kind: StageKind) -> Self {
        let iteration = if kind.is_loop_stage() { 1 } else { 0 };
        Self { kind, iteration }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_loop_stage() {
            write!(f, "{}#{}", self.kind, self.iteration)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl FromStr for StageKey {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('#') {
            Some((kind, iteration)) => {
                let kind: StageKind = kind.parse()?;
                let iteration = iteration
                    .parse::<u32>()
                    .map_err(|_| StageError::InvalidKey(s.to_string()))?;
                Ok(Self { kind, iteration })
            }
            None => Ok(Self::first(s.parse()?)),
        }
    }
}

/// Stage parsing and validation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("Unknown stage: {0}")]
    UnknownStage(String),
    #[error("Invalid stage key: {0}")]
    InvalidKey(String),
    #[error("Invalid stage list: {0}")]
    InvalidStageList(String),
}

/// Validate and normalise a run's stage list
///
/// Rejects empty lists, duplicates, an explicit `revision` entry and a
/// leading `fact_check`. `finalize` must be last; it is appended when missing.
pub fn normalize_stages(stages: &[StageSpec]) -> Result<Vec<StageSpec>, StageError> {
    if stages.is_empty() {
        return Err(StageError::InvalidStageList(
            "stage list must not be empty".to_string(),
        ));
    }

    let mut seen = Vec::with_capacity(stages.len());
    for (index, spec) in stages.iter().enumerate() {
        if seen.contains(&spec.kind) {
            return Err(StageError::InvalidStageList(format!(
                "stage '{}' listed more than once",
                spec.kind
            )));
        }
        if spec.kind == StageKind::Revision {
            return Err(StageError::InvalidStageList(
                "revision is driven by fact_check and cannot be listed".to_string(),
            ));
        }
        if spec.kind == StageKind::FactCheck && index == 0 {
            return Err(StageError::InvalidStageList(
                "fact_check needs an upstream stage to check".to_string(),
            ));
        }
        if spec.kind == StageKind::Finalize && index + 1 != stages.len() {
            return Err(StageError::InvalidStageList(
                "finalize must be the last stage".to_string(),
            ));
        }
        if spec.kind.is_loop_stage() && spec.fanout != Fanout::Single {
            return Err(StageError::InvalidStageList(format!(
                "stage '{}' cannot fan out",
                spec.kind
            )));
        }
        seen.push(spec.kind);
    }

    let mut normalized = stages.to_vec();
    if !seen.contains(&StageKind::Finalize) {
        normalized.push(StageSpec::new(StageKind::Finalize));
    }
    Ok(normalized)
}
