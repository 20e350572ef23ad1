//! Immutable, content-addressed task outputs

use crate::model::stage::StageKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Hex-encoded SHA-256 of an artifact's canonical content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Wrap an already computed hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }

    /// Whether this looks like a SHA-256 hex digest
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provenance recorded alongside artifact content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub idempotency_key: String,
    pub stage: StageKey,
    pub shard: u32,
    pub content_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// A stored artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub run_id: Uuid,
    pub producing_stage: StageKey,
    pub producing_task_id: Uuid,
    pub content: Value,
    pub metadata: ArtifactMetadata,
}

/// Content plus provenance for an artifact about to be written
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: Uuid,
    pub producing_stage: StageKey,
    pub producing_task_id: Uuid,
    pub shard: u32,
    pub idempotency_key: String,
    pub content_type: String,
    pub content: Value,
}

impl NewArtifact {
    pub fn json(
        run_id: Uuid,
        producing_stage: StageKey,
        producing_task_id: Uuid,
        shard: u32,
        idempotency_key: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            run_id,
            producing_stage,
            producing_task_id,
            shard,
            idempotency_key: idempotency_key.into(),
            content_type: "application/json".to_string(),
            content,
        }
    }
}

/// Reference to a run's artifact, as returned by `get_artifacts`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub artifact_id: ArtifactId,
    pub stage: StageKey,
    pub task_id: Uuid,
    pub shard: u32,
}
