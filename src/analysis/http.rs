//! HTTP analysis backend
//!
//! POSTs each [`AnalysisRequest`] as JSON to a configured endpoint and expects
//! `{"content": ..., "model"?: ..., "usage"?: ...}` back. Status codes map onto
//! the transient/permanent split:
//!
//! - 429, 5xx, timeouts and connection errors are transient
//! - 400/422 are invalid requests, other 4xx are rejections
//! - a 2xx body that does not decode is an invalid response

use super::{AnalysisError, AnalysisOutput, AnalysisRequest, AnalysisService};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Connection settings for [`HttpAnalysisService`]
#[derive(Debug, Clone)]
pub struct HttpAnalysisConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// In-call retries for 5xx and connection errors, on top of task-level retries
    pub retry_attempts: usize,
}

impl Default for HttpAnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/invoke".to_string(),
            model: "analysis-default".to_string(),
            api_key: None,
            timeout: Duration::from_millis(120_000),
            retry_attempts: 0,
        }
    }
}

impl HttpAnalysisConfig {
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: usize) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    run_id: Uuid,
    task_id: Uuid,
    stage: String,
    instruction: &'a str,
    context: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_schema: Option<&'a Value>,
}

/// Analysis service reached over HTTP
pub struct HttpAnalysisService {
    config: HttpAnalysisConfig,
    client: Client,
    endpoint: Url,
}

impl HttpAnalysisService {
    pub fn new(config: HttpAnalysisConfig) -> Result<Self, AnalysisError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            AnalysisError::InvalidRequest(format!("invalid endpoint '{}': {e}", config.endpoint))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AnalysisError::InvalidRequest(format!(
                "endpoint must be http(s): {}",
                config.endpoint
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AnalysisError::unavailable(format!("failed to build client: {e}")))?;

        info!(endpoint = %endpoint, model = %config.model, "HTTP analysis service configured");
        Ok(Self {
            config,
            client,
            endpoint,
        })
    }

    /// Map a non-success status to an error
    fn classify_status(status: StatusCode, body: &str) -> AnalysisError {
        let snippet: String = body.chars().take(200).collect();
        match status {
            StatusCode::TOO_MANY_REQUESTS => AnalysisError::RateLimited(snippet),
            s if s.is_server_error() => AnalysisError::unavailable(format!("{s}: {snippet}")),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                AnalysisError::InvalidRequest(format!("{status}: {snippet}"))
            }
            s => AnalysisError::rejected(format!("{s}: {snippet}")),
        }
    }

    fn classify_transport(&self, err: &reqwest::Error) -> AnalysisError {
        if err.is_timeout() {
            AnalysisError::Timeout {
                after_ms: self.config.timeout.as_millis() as u64,
            }
        } else {
            AnalysisError::unavailable(format!("network error: {err}"))
        }
    }

    async fn send_once(&self, body: &WireRequest<'_>) -> Result<AnalysisOutput, AnalysisError> {
        let mut request = self.client.post(self.endpoint.clone()).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.classify_transport(&e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.classify_transport(&e))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        serde_json::from_str::<AnalysisOutput>(&text)
            .map_err(|e| AnalysisError::invalid_response(format!("undecodable body: {e}")))
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    fn name(&self) -> &str {
        "http"
    }

    #[tracing::instrument(skip(self, request), fields(stage = %request.stage, task_id = %request.task_id))]
    async fn invoke(&self, request: AnalysisRequest) -> Result<AnalysisOutput, AnalysisError> {
        let body = WireRequest {
            model: &self.config.model,
            run_id: request.run_id,
            task_id: request.task_id,
            stage: request.stage.to_string(),
            instruction: &request.instruction,
            context: &request.context,
            output_schema: request.output_schema.as_ref(),
        };

        let retry_attempts = self.config.retry_attempts;
        let mut attempt = 0;
        loop {
            debug!(
                attempt = attempt + 1,
                max_attempts = retry_attempts + 1,
                url = %self.endpoint,
                "Calling analysis service"
            );
            match self.send_once(&body).await {
                Ok(output) => return Ok(output),
                // Timeouts are left to the task-level retry so one call never exceeds its budget
                Err(e @ AnalysisError::Unavailable(_)) if attempt < retry_attempts => {
                    warn!(error = %e, attempt = attempt + 1, "Analysis service error, retrying");
                    let backoff_ms = 100 * 2_u64.pow(attempt as u32);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn health_check(&self) -> Result<(), AnalysisError> {
        if self.endpoint.host_str().is_none() {
            return Err(AnalysisError::InvalidRequest(
                "endpoint has no host".to_string(),
            ));
        }
        Ok(())
    }
}
