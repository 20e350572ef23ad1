//! Fact-check findings
//!
//! Findings are expected output of the fact-check stage, not errors. They are
//! routed into the revision loop and, if still open when the loop stops,
//! reported as run warnings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Category of issue raised by fact-checking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    EvidenceMismatch,
    DimensionHallucination,
    StatisticMismatch,
    GrandioseClaim,
    CitationViolation,
    FabricatedReference,
}

/// A structured fact-check issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub kind: FindingKind,
    pub location: String,
    pub detail: String,
    pub iteration: u32,
}

impl Finding {
    /// Build a finding whose id is derived from its content
    ///
    /// Identical findings in the same iteration always get the same id, so a
    /// fact-check artifact hashes identically across replays.
    pub fn new(
        kind: FindingKind,
        location: impl Into<String>,
        detail: impl Into<String>,
        iteration: u32,
    ) -> Self {
        let location = location.into();
        let detail = detail.into();
        let finding_id = finding_id(kind, &location, &detail, iteration);
        Self {
            finding_id,
            kind,
            location,
            detail,
            iteration,
        }
    }
}

fn finding_id(kind: FindingKind, location: &str, detail: &str, iteration: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind:?}").as_bytes());
    hasher.update([0u8]);
    hasher.update(location.as_bytes());
    hasher.update([0u8]);
    hasher.update(detail.as_bytes());
    hasher.update(iteration.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// A single finding as the analysis service reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReportedFinding {
    pub kind: FindingKind,
    pub location: String,
    pub detail: String,
}

/// Structured output expected from the fact-check stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FactCheckOutput {
    pub findings: Vec<ReportedFinding>,
}

impl FactCheckOutput {
    /// JSON schema used to validate fact-check responses
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(FactCheckOutput);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }

    /// Attach ids and the iteration number
    pub fn into_findings(self, iteration: u32) -> Vec<Finding> {
        self.findings
            .into_iter()
            .map(|f| Finding::new(f.kind, f.location, f.detail, iteration))
            .collect()
    }
}
