//! Health check HTTP server
//!
//! Exposes `/health`, `/metrics`, `/ready`, `/live` and an index at `/` so
//! container platforms and operators can watch a running orchestrator.

use crate::observability::metrics::{current_timestamp, metrics};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use warp::http::StatusCode;
use warp::Filter;

/// Seconds without a finished task before in-flight work counts as stale
const TASK_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    orchestrator_id: String,
    port: u16,
    ready: AtomicBool,
    last_task_processed: AtomicU64,
    additional_checks: RwLock<HashMap<String, HealthCheck>>,
}

impl HealthServer {
    pub fn new(orchestrator_id: impl Into<String>, port: u16) -> Self {
        Self {
            orchestrator_id: orchestrator_id.into(),
            port,
            ready: AtomicBool::new(false),
            last_task_processed: AtomicU64::new(0),
            additional_checks: RwLock::new(HashMap::new()),
        }
    }

    /// Routers are running and accepting work
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_last_task_processed(&self, timestamp: u64) {
        self.last_task_processed.store(timestamp, Ordering::Relaxed);
    }

    pub async fn add_health_check(&self, name: impl Into<String>, check: HealthCheck) {
        self.additional_checks
            .write()
            .await
            .insert(name.into(), check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// Serve until `shutdown` flips to true
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let health_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);

        // GET /health - aggregated checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = Arc::clone(&health_server);
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - counters and per-stage statistics
        let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
            let snapshot = metrics().get_metrics();
            warp::reply::json(&snapshot)
        });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready").and(warp::get()).map(move || {
            let ready = ready_server.is_ready();
            let response = ReadinessResponse {
                ready,
                timestamp: current_timestamp(),
            };
            let code = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Run, task and per-stage metrics"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        let routes = health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route);

        tracing::info!(port = self.port, "Starting health server");
        let (_, server) =
            warp::serve(routes).bind_with_graceful_shutdown(([0, 0, 0, 0], self.port), async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            });
        server.await;
        tracing::info!("Health server stopped");
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("routers".to_string(), self.check_router_health());
        checks.insert(
            "task_processing".to_string(),
            self.check_task_processing_health(),
        );
        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            orchestrator_id: self.orchestrator_id.clone(),
            uptime_seconds: metrics().uptime_seconds(),
            checks,
        }
    }

    fn check_router_health(&self) -> HealthCheck {
        if self.is_ready() {
            HealthCheck::new("healthy", "Routers running")
        } else {
            HealthCheck::new("unhealthy", "Routers not started or shutting down")
        }
    }

    fn check_task_processing_health(&self) -> HealthCheck {
        let now = current_timestamp();
        let last_task = self
            .last_task_processed
            .load(Ordering::Relaxed)
            .max(metrics().last_task_finished());
        let in_flight = metrics().get_metrics().tasks.in_flight;

        if last_task == 0 {
            HealthCheck::new("healthy", "No tasks processed yet")
        } else if in_flight > 0 && now.saturating_sub(last_task) > TASK_STALENESS_THRESHOLD_SECONDS {
            // Idle orchestrators are fine; work in flight with no progress is not
            HealthCheck::new(
                "stale",
                format!(
                    "{in_flight} tasks in flight, none finished for {} seconds",
                    now.saturating_sub(last_task)
                ),
            )
        } else {
            HealthCheck::new("healthy", "Recent task activity")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    orchestrator_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}
