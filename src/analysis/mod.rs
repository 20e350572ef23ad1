//! The opaque analysis service the stage agents call
//!
//! This is the only source of non-determinism, cost and latency in a run. The
//! core never interprets prompts; it only classifies failures as transient or
//! permanent so the harness can decide between retry and giving up.

pub mod http;

use crate::model::StageKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use http::{HttpAnalysisConfig, HttpAnalysisService};

/// One call to the analysis service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub stage: StageKey,
    /// Short task description chosen by the stage agent
    pub instruction: String,
    /// Stage inputs with artifact references resolved
    pub context: Value,
    /// JSON schema the response content must satisfy, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Token accounting reported by the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Structured output of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub content: Value,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl AnalysisOutput {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            model: None,
            usage: None,
        }
    }
}

/// Analysis service errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("Analysis call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("Analysis service unavailable: {0}")]
    Unavailable(String),
    #[error("Rate limited by analysis service: {0}")]
    RateLimited(String),
    #[error("Invalid analysis request: {0}")]
    InvalidRequest(String),
    #[error("Invalid analysis response: {0}")]
    InvalidResponse(String),
    #[error("Analysis request rejected: {0}")]
    Rejected(String),
}

impl AnalysisError {
    /// Timeouts, unavailability and rate limiting are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AnalysisError::Timeout { .. }
                | AnalysisError::Unavailable(_)
                | AnalysisError::RateLimited(_)
        )
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn invalid_response<S: Into<String>>(message: S) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self::Rejected(message.into())
    }
}

/// Analysis service abstraction for dependency injection and testing
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn invoke(&self, request: AnalysisRequest) -> Result<AnalysisOutput, AnalysisError>;

    /// Check the backend is configured and reachable
    async fn health_check(&self) -> Result<(), AnalysisError> {
        Ok(())
    }
}

/// Validate `value` against a JSON schema, collecting every violation
pub fn validate_against_schema(schema: &Value, value: &Value) -> Result<(), AnalysisError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| AnalysisError::InvalidRequest(format!("Schema compilation error: {e}")))?;

    validator.validate(value).map_err(|errors| {
        let messages: Vec<String> = errors
            .map(|e| format!("At '{}': {}", e.instance_path, e))
            .collect();
        AnalysisError::invalid_response(format!(
            "output does not match schema: {}",
            messages.join("; ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FactCheckOutput;
    use serde_json::json;

    #[test]
    fn test_error_classification() {
        assert!(AnalysisError::Timeout { after_ms: 100 }.is_transient());
        assert!(AnalysisError::unavailable("502").is_transient());
        assert!(AnalysisError::RateLimited("slow down".into()).is_transient());
        assert!(!AnalysisError::InvalidRequest("bad".into()).is_transient());
        assert!(!AnalysisError::invalid_response("garbage").is_transient());
        assert!(!AnalysisError::rejected("policy").is_transient());
    }

    #[test]
    fn test_fact_check_schema_validation() {
        let schema = FactCheckOutput::json_schema();
        let ok = json!({"findings": [
            {"kind": "grandiose_claim", "location": "abstract", "detail": "overstated"}
        ]});
        assert!(validate_against_schema(&schema, &ok).is_ok());

        let wrong_kind = json!({"findings": [
            {"kind": "vibes", "location": "abstract", "detail": "?"}
        ]});
        let err = validate_against_schema(&schema, &wrong_kind).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidResponse(_)));

        let missing = json!({"summary": "no findings key"});
        assert!(validate_against_schema(&schema, &missing).is_err());
    }

    #[test]
    fn test_request_omits_absent_schema() {
        let request = AnalysisRequest {
            run_id: Uuid::nil(),
            task_id: Uuid::nil(),
            stage: StageKey::first(crate::model::StageKind::Synthesis),
            instruction: "synthesise".to_string(),
            context: json!({}),
            output_schema: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("output_schema").is_none());
        assert_eq!(value["stage"]["kind"], "synthesis");
    }
}
