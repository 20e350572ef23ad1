//! Structured logging, metrics collection and health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, ExecutionOutcome, MetricsCollector, MetricsSnapshot};

pub use logging::{dispatch_span, run_span, stage_span, task_span};
