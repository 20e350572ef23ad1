//! Typed task payloads
//!
//! Every task carries one [`StageInput`] as its JSON payload. Upstream work is
//! referenced by artifact id, never copied, so payloads stay small and the
//! idempotency key of a task changes whenever an upstream artifact does.

use super::{ArtifactId, ArtifactRef, Document, Finding, Gap};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum StageInput {
    /// A stage working on the submitted inputs as a whole
    Inputs {
        inputs: ArtifactId,
        #[serde(default)]
        parameters: Value,
        #[serde(default)]
        upstream: Vec<ArtifactId>,
    },
    /// One shard of a per-document stage
    Document {
        document: Document,
        #[serde(default)]
        parameters: Value,
        #[serde(default)]
        upstream: Vec<ArtifactId>,
    },
    /// A single stage consuming the previous stage's results
    Upstream {
        upstream: Vec<ArtifactId>,
        #[serde(default)]
        parameters: Value,
    },
    FactCheck {
        draft: ArtifactId,
        sources: Vec<ArtifactId>,
        iteration: u32,
    },
    Revision {
        draft: ArtifactId,
        findings: Vec<Finding>,
        sources: Vec<ArtifactId>,
        iteration: u32,
    },
    Finalize {
        artifacts: Vec<ArtifactRef>,
        gaps: Vec<Gap>,
        unresolved_findings: Vec<Finding>,
    },
}

impl StageInput {
    pub fn name(&self) -> &'static str {
        match self {
            StageInput::Inputs { .. } => "inputs",
            StageInput::Document { .. } => "document",
            StageInput::Upstream { .. } => "upstream",
            StageInput::FactCheck { .. } => "fact_check",
            StageInput::Revision { .. } => "revision",
            StageInput::Finalize { .. } => "finalize",
        }
    }

    /// Artifacts this input references, in a stable order without duplicates
    pub fn referenced_artifacts(&self) -> Vec<ArtifactId> {
        let mut ids: Vec<ArtifactId> = match self {
            StageInput::Inputs {
                inputs, upstream, ..
            } => std::iter::once(inputs).chain(upstream).cloned().collect(),
            StageInput::Document { upstream, .. } | StageInput::Upstream { upstream, .. } => {
                upstream.clone()
            }
            StageInput::FactCheck { draft, sources, .. }
            | StageInput::Revision { draft, sources, .. } => {
                std::iter::once(draft).chain(sources).cloned().collect()
            }
            // Finalize assembles references; it never reads content
            StageInput::Finalize { .. } => Vec::new(),
        };
        let mut seen = std::collections::HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids
    }

    /// Draft under review for loop stages
    pub fn draft(&self) -> Option<&ArtifactId> {
        match self {
            StageInput::FactCheck { draft, .. } | StageInput::Revision { draft, .. } => {
                Some(draft)
            }
            _ => None,
        }
    }

    pub fn sources(&self) -> &[ArtifactId] {
        match self {
            StageInput::FactCheck { sources, .. } | StageInput::Revision { sources, .. } => {
                sources
            }
            _ => &[],
        }
    }
}
