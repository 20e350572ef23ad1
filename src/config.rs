//! TOML configuration for the orchestrator
//!
//! Only `[orchestrator]` is required; every other section falls back to
//! defaults. Secrets are never stored in the file: `api_key_env` names an
//! environment variable that is read at runtime.

use crate::analysis::HttpAnalysisConfig;
use crate::model::{normalize_stages, Fanout, RunPolicy, RunSpec, StageKind, StageSpec};
use crate::queue::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSection {
    /// Instance identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Directory for durable stores; in-memory stores when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_router_instances")]
    pub router_instances: usize,
    /// Agents allowed to execute at once across all routers
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long a router waits for a concurrency permit before the spawn counts as failed
    #[serde(default = "default_dispatch_wait_ms")]
    pub dispatch_wait_ms: u64,
    /// Payloads larger than this many bytes are stored as artifacts
    #[serde(default = "default_inline_payload_threshold")]
    pub inline_payload_threshold: usize,
}

/// Task retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Total executions allowed per task
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Attempts at enqueueing while the queue reports itself unavailable
    #[serde(default = "default_queue_retry_attempts")]
    pub queue_retry_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            queue_retry_attempts: default_queue_retry_attempts(),
        }
    }
}

/// Stage list and run policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Fraction of a stage's tasks allowed to fail permanently
    #[serde(default = "default_failure_tolerance")]
    pub failure_tolerance: f64,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_stages")]
    pub stages: Vec<StageEntry>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            failure_tolerance: default_failure_tolerance(),
            agent_timeout_secs: default_agent_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            stages: default_stages(),
        }
    }
}

/// Stage list entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StageEntry {
    /// Simple form: "analyse"
    Simple(String),
    /// Table form: { kind = "analyse", fanout = "single" }
    Detailed {
        kind: String,
        #[serde(default)]
        fanout: Option<Fanout>,
    },
}

impl StageEntry {
    fn to_spec(&self) -> Result<StageSpec, ConfigError> {
        let (name, fanout) = match self {
            StageEntry::Simple(name) => (name, None),
            StageEntry::Detailed { kind, fanout } => (kind, *fanout),
        };
        let kind: StageKind = name
            .parse()
            .map_err(|e| ConfigError::InvalidConfig(format!("pipeline.stages: {e}")))?;
        Ok(match fanout {
            Some(fanout) => StageSpec::with_fanout(kind, fanout),
            None => StageSpec::new(kind),
        })
    }
}

/// Analysis service connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable containing the bearer key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_analysis_timeout_ms")]
    pub timeout_ms: u64,
    /// In-call retries for 5xx and connection errors
    #[serde(default)]
    pub retry_attempts: usize,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: None,
            timeout_ms: default_analysis_timeout_ms(),
            retry_attempts: 0,
        }
    }
}

fn default_router_instances() -> usize {
    1
}

fn default_max_concurrency() -> usize {
    16
}

fn default_dispatch_wait_ms() -> u64 {
    30_000
}

fn default_inline_payload_threshold() -> usize {
    4096
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_queue_retry_attempts() -> u32 {
    5
}

fn default_max_iterations() -> u32 {
    4
}

fn default_failure_tolerance() -> f64 {
    0.5
}

fn default_agent_timeout_secs() -> u64 {
    300
}

fn default_run_timeout_secs() -> u64 {
    3600
}

fn default_stages() -> Vec<StageEntry> {
    ["pre_test", "analyse", "synthesis", "fact_check", "finalize"]
        .into_iter()
        .map(|s| StageEntry::Simple(s.to_string()))
        .collect()
}

fn default_endpoint() -> String {
    "http://localhost:8000/invoke".to_string()
}

fn default_model() -> String {
    "analysis-default".to_string()
}

fn default_analysis_timeout_ms() -> u64 {
    120_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid orchestrator ID format: {0}")]
    InvalidId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorSection {
                id: "orchestrator".to_string(),
                data_dir: None,
                router_instances: default_router_instances(),
                max_concurrency: default_max_concurrency(),
                dispatch_wait_ms: default_dispatch_wait_ms(),
                inline_payload_threshold: default_inline_payload_threshold(),
            },
            retry: RetrySection::default(),
            pipeline: PipelineSection::default(),
            analysis: AnalysisSection::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every constraint the runtime relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id(&self.orchestrator.id)?;

        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));
        if self.orchestrator.router_instances == 0 {
            return invalid("orchestrator.router_instances must be at least 1");
        }
        if self.orchestrator.max_concurrency == 0 {
            return invalid("orchestrator.max_concurrency must be at least 1");
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return invalid("retry.backoff_base_ms must not exceed retry.backoff_max_ms");
        }
        self.run_policy()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("run policy: {e}")))?;

        let endpoint = url::Url::parse(&self.analysis.endpoint).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "analysis.endpoint '{}' is not a URL: {e}",
                self.analysis.endpoint
            ))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return invalid("analysis.endpoint must use http or https");
        }

        self.stage_specs()?;
        Ok(())
    }

    /// Parsed and normalised stage list
    pub fn stage_specs(&self) -> Result<Vec<StageSpec>, ConfigError> {
        let specs = self
            .pipeline
            .stages
            .iter()
            .map(StageEntry::to_spec)
            .collect::<Result<Vec<_>, _>>()?;
        normalize_stages(&specs)
            .map_err(|e| ConfigError::InvalidConfig(format!("pipeline.stages: {e}")))
    }

    pub fn run_policy(&self) -> RunPolicy {
        RunPolicy {
            max_attempts: self.retry.max_attempts,
            max_iterations: self.pipeline.max_iterations,
            failure_tolerance: self.pipeline.failure_tolerance,
            agent_timeout_secs: self.pipeline.agent_timeout_secs,
            run_timeout_secs: self.pipeline.run_timeout_secs,
        }
    }

    /// Run spec built from the configured stage list and policy
    pub fn run_spec(&self) -> Result<RunSpec, ConfigError> {
        Ok(RunSpec {
            stages: self.stage_specs()?,
            policy: self.run_policy(),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.retry.backoff_base_ms),
            Duration::from_millis(self.retry.backoff_max_ms),
        )
    }

    pub fn dispatch_wait(&self) -> Duration {
        Duration::from_millis(self.orchestrator.dispatch_wait_ms)
    }

    /// Analysis API key from the configured environment variable, if any
    pub fn get_analysis_api_key(&self) -> Result<Option<String>, ConfigError> {
        match &self.analysis.api_key_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// HTTP client settings with the API key resolved from the environment
    pub fn http_analysis_config(&self) -> Result<HttpAnalysisConfig, ConfigError> {
        Ok(HttpAnalysisConfig {
            endpoint: self.analysis.endpoint.clone(),
            model: self.analysis.model.clone(),
            api_key: self.get_analysis_api_key()?,
            timeout: Duration::from_millis(self.analysis.timeout_ms),
            retry_attempts: self.analysis.retry_attempts,
        })
    }
}

/// Validate the orchestrator id charset
fn validate_id(id: &str) -> Result<(), ConfigError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidId(format!(
            "Orchestrator ID '{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
