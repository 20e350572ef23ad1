//! Crate-wide error types
//!
//! Each component owns its error enum; [`OrchestratorError`] wraps them for the
//! public API. [`ExecutionError`] is the harness-level classification that
//! decides between retry and permanent failure.

use crate::analysis::AnalysisError;
use crate::config::ConfigError;
use crate::model::{StageError, TransitionError};
use crate::pipeline::planner::PlanError;
use crate::queue::QueueError;
use crate::store::StoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Analysis service error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Task lifecycle error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl OrchestratorError {
    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Store(e) => e.is_transient(),
            OrchestratorError::Queue(e) => e.is_transient(),
            OrchestratorError::Analysis(e) => e.is_transient(),
            OrchestratorError::Execution(e) => e.is_transient(),
            OrchestratorError::Plan(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Message safe to write into audit details and logs
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Outcome classification of one task execution
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Retry with backoff while attempts remain
    #[error("transient: {0}")]
    Transient(String),
    /// Never retried
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ExecutionError::Transient(m) | ExecutionError::Permanent(m) => m,
        }
    }

    /// Execution exceeded the per-agent timeout
    pub fn timed_out(after: Duration) -> Self {
        Self::Transient(format!("agent execution timed out after {}s", after.as_secs()))
    }
}

impl From<AnalysisError> for ExecutionError {
    fn from(err: AnalysisError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// Run-level errors surfaced through the public API
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RunError {
    #[error("Run not found: {0}")]
    NotFound(Uuid),

    #[error("Stage '{stage}' fans out per document but the run has no documents")]
    NoDocuments { stage: String },

    #[error("Duplicate document id: {0}")]
    DuplicateDocument(String),

    #[error("Run {run_id} did not finish within {waited:?}")]
    WaitTimeout { run_id: Uuid, waited: Duration },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SECRET_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact secrets and secret-bearing paths, then cap the length at 500 bytes
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SECRET_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_secrets() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_sanitize_with_colons() {
        let sanitized = sanitize_error_message("api_key: sk-123 Secret: hidden");
        assert!(!sanitized.contains("sk-123"));
        assert!(!sanitized.contains("hidden"));
    }

    #[test]
    fn test_path_redaction() {
        let sanitized =
            sanitize_error_message("Failed to read /home/user/.aws/credentials while loading");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains(".aws/credentials"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = sanitize_error_message(&"x".repeat(500));
        assert_eq!(exact.len(), 500);
        assert!(!exact.contains("truncated"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_execution_error_from_analysis() {
        let transient: ExecutionError = AnalysisError::Timeout { after_ms: 10 }.into();
        assert!(transient.is_transient());

        let permanent: ExecutionError = AnalysisError::invalid_response("not json").into();
        assert!(!permanent.is_transient());
        assert!(permanent.message().contains("not json"));
    }

    #[test]
    fn test_execution_error_from_store() {
        let transient: ExecutionError = StoreError::Unavailable("disk full".to_string()).into();
        assert!(transient.is_transient());

        let permanent: ExecutionError = StoreError::not_found("artifact", "abc").into();
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_orchestrator_error_wraps_components() {
        let err: OrchestratorError = RunError::NotFound(Uuid::nil()).into();
        assert!(err.to_string().starts_with("Run error: Run not found"));

        let err = OrchestratorError::internal("token=abc leaked");
        assert!(!err.sanitized_message().contains("abc"));
    }
}
