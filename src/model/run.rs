//! Pipeline runs, their inputs and the reports derived from them

use crate::model::artifact::{ArtifactId, ArtifactRef};
use crate::model::finding::Finding;
use crate::model::stage::{StageKey, StageSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Finalizing,
    Completed,
    CompletedWithWarnings,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithWarnings | RunStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Finalizing => "finalizing",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithWarnings => "completed_with_warnings",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry, loop and failure policy applied to one run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    pub max_attempts: u32,
    pub max_iterations: u32,
    /// Fraction of a stage's tasks allowed to fail permanently
    pub failure_tolerance: f64,
    pub agent_timeout_secs: u64,
    pub run_timeout_secs: u64,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_iterations: 4,
            failure_tolerance: 0.5,
            agent_timeout_secs: 300,
            run_timeout_secs: 3600,
        }
    }
}

/// Longest accepted agent or run timeout (thirty days)
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

impl RunPolicy {
    /// Check the bounds every run policy must satisfy
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.failure_tolerance) {
            return Err("failure_tolerance must be between 0.0 and 1.0".to_string());
        }
        for (name, secs) in [
            ("agent_timeout_secs", self.agent_timeout_secs),
            ("run_timeout_secs", self.run_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(format!(
                    "{name} must be between 1 and {MAX_TIMEOUT_SECS}, got {secs}"
                ));
            }
        }
        Ok(())
    }

    /// Whether `failed` permanent failures out of `expected` tasks stay within tolerance
    pub fn tolerates(&self, failed: u32, expected: u32) -> bool {
        if failed == 0 {
            return true;
        }
        if expected == 0 {
            return false;
        }
        (failed as f64 / expected as f64) <= self.failure_tolerance
    }
}

/// What a caller submits: stage list plus policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub stages: Vec<StageSpec>,
    pub policy: RunPolicy,
}

/// `start + secs`, saturating at the latest representable instant
fn deadline_after(start: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|timeout| start.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One document to analyse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: Value,
}

/// Inputs of one run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunInputs {
    #[serde(default)]
    pub documents: Vec<Document>,
    /// Free-form run parameters passed through to every stage
    #[serde(default)]
    pub parameters: Value,
}

/// Expected and completed task counts of one stage occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: StageKey,
    pub expected: u32,
    pub completed: u32,
}

/// A permanently failed task recorded against a run that carried on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub stage: StageKey,
    pub shard: u32,
    pub task_id: Uuid,
    pub document_id: Option<String>,
    pub reason: String,
}

/// Durable run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub stages: Vec<StageSpec>,
    pub policy: RunPolicy,
    pub inputs_artifact: ArtifactId,
    pub document_ids: Vec<String>,
    pub current_stage: Option<StageKey>,
    pub fanout_counts: Vec<StageProgress>,
    pub status: RunStatus,
    /// Findings still open when the fact-check loop stopped
    #[serde(default)]
    pub warnings: Vec<Finding>,
    pub abort_reason: Option<String>,
    pub final_artifact: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(
        spec: RunSpec,
        inputs_artifact: ArtifactId,
        document_ids: Vec<String>,
        run_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        let deadline = deadline_after(now, spec.policy.run_timeout_secs);
        Self {
            run_id,
            stages: spec.stages,
            policy: spec.policy,
            inputs_artifact,
            document_ids,
            current_stage: None,
            fanout_counts: Vec::new(),
            status: RunStatus::Created,
            warnings: Vec::new(),
            abort_reason: None,
            final_artifact: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            deadline,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Index of a listed stage kind in the stage list
    pub fn stage_index(&self, key: &StageKey) -> Option<usize> {
        self.stages.iter().position(|s| s.kind == key.kind)
    }

    /// Stage listed after the one `key` belongs to
    pub fn next_listed_stage(&self, key: &StageKey) -> Option<StageSpec> {
        self.stage_index(key)
            .and_then(|index| self.stages.get(index + 1))
            .copied()
    }

    pub fn progress(&self, key: &StageKey) -> Option<&StageProgress> {
        self.fanout_counts.iter().find(|p| p.stage == *key)
    }

    /// Record the expected count of a stage occurrence when its tasks are enqueued
    pub fn record_expected(&mut self, key: StageKey, expected: u32) {
        match self.fanout_counts.iter_mut().find(|p| p.stage == key) {
            Some(progress) => progress.expected = expected,
            None => self.fanout_counts.push(StageProgress {
                stage: key,
                expected,
                completed: 0,
            }),
        }
        self.current_stage = Some(key);
        self.touch();
    }

    /// Cache a recomputed completed count
    pub fn record_completed(&mut self, key: &StageKey, completed: u32) {
        if let Some(progress) = self.fanout_counts.iter_mut().find(|p| p.stage == *key) {
            progress.completed = completed;
            self.touch();
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// Answer to `get_run_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stage: Option<StageKey>,
    pub completed_count: u32,
    pub expected_count: u32,
    /// Findings of the most recent fact-check
    pub findings: Vec<Finding>,
    pub gaps: Vec<Gap>,
    pub warnings: Vec<Finding>,
    pub abort_reason: Option<String>,
}

/// Final account of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub artifacts: Vec<ArtifactRef>,
    pub final_artifact: Option<ArtifactId>,
    pub gaps: Vec<Gap>,
    pub warnings: Vec<Finding>,
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stage::StageKind;

    fn run() -> PipelineRun {
        PipelineRun::new(
            RunSpec {
                stages: vec![
                    StageSpec::new(StageKind::PreTest),
                    StageSpec::new(StageKind::Analyse),
                    StageSpec::new(StageKind::FactCheck),
                    StageSpec::new(StageKind::Finalize),
                ],
                policy: RunPolicy::default(),
            },
            ArtifactId::from_hex("00"),
            vec!["doc-1".to_string()],
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_policy_bounds() {
        assert!(RunPolicy::default().validate().is_ok());
        let rejected = [
            RunPolicy { max_attempts: 0, ..Default::default() },
            RunPolicy { max_iterations: 0, ..Default::default() },
            RunPolicy { failure_tolerance: -0.1, ..Default::default() },
            RunPolicy { agent_timeout_secs: 0, ..Default::default() },
            RunPolicy { run_timeout_secs: 0, ..Default::default() },
            RunPolicy { run_timeout_secs: MAX_TIMEOUT_SECS + 1, ..Default::default() },
            RunPolicy { agent_timeout_secs: u64::MAX, ..Default::default() },
        ];
        for policy in rejected {
            assert!(policy.validate().is_err(), "accepted {policy:?}");
        }
        let longest = RunPolicy {
            run_timeout_secs: MAX_TIMEOUT_SECS,
            agent_timeout_secs: MAX_TIMEOUT_SECS,
            ..Default::default()
        };
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_huge_timeout_saturates_deadline() {
        let now = Utc::now();
        assert_eq!(deadline_after(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            deadline_after(now, 10_000_000_000_000_000),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(deadline_after(now, 60), now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_tolerance() {
        let policy = RunPolicy {
            failure_tolerance: 0.5,
            ..Default::default()
        };
        assert!(policy.tolerates(0, 1));
        assert!(policy.tolerates(1, 3));
        assert!(policy.tolerates(2, 4));
        assert!(!policy.tolerates(3, 5));
        assert!(!policy.tolerates(1, 1));

        let strict = RunPolicy {
            failure_tolerance: 0.0,
            ..Default::default()
        };
        assert!(!strict.tolerates(1, 10));
    }

    #[test]
    fn test_next_listed_stage_from_loop_iteration() {
        let run = run();
        let next = run
            .next_listed_stage(&StageKey::new(StageKind::FactCheck, 3))
            .unwrap();
        assert_eq!(next.kind, StageKind::Finalize);
        assert!(run
            .next_listed_stage(&StageKey::first(StageKind::Finalize))
            .is_none());
    }

    #[test]
    fn test_record_expected_and_completed() {
        let mut run = run();
        let key = StageKey::first(StageKind::Analyse);
        run.record_expected(key, 3);
        run.record_completed(&key, 2);
        let progress = run.progress(&key).unwrap();
        assert_eq!(progress.expected, 3);
        assert_eq!(progress.completed, 2);
        assert_eq!(run.current_stage, Some(key));
    }

    #[test]
    fn test_finish_sets_completion_time() {
        let mut run = run();
        assert!(!run.is_terminal());
        run.finish(RunStatus::CompletedWithWarnings);
        assert!(run.is_terminal());
        assert!(run.completed_at.is_some());
        assert_eq!(run.status.to_string(), "completed_with_warnings");
    }

    #[test]
    fn test_deadline_follows_policy() {
        let run = run();
        let window = run.deadline - run.created_at;
        assert_eq!(window.num_seconds(), 3600);
    }
}
