//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format parsing and configuration from environment variables.

use analysis_orchestrator::observability::logging::{
    build_filter, init_logging, parse_level, LogFormat,
};
use analysis_orchestrator::{run_span, stage_span, task_span};
use tracing::Level;
use uuid::Uuid;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert!(matches!(LogFormat::parse("JSON"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("Pretty"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("COMPACT"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Invalid formats should default to JSON for production safety
    assert!(matches!(LogFormat::parse("xml"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("  pretty  "), LogFormat::Json));
}

#[test]
fn test_unknown_level_falls_back_to_info() {
    assert_eq!(parse_level("warn"), Level::WARN);
    assert_eq!(parse_level("loud"), Level::INFO);
}

#[test]
fn test_filter_keeps_requested_level_for_own_crate() {
    let rendered = build_filter(Level::TRACE).to_string();
    assert!(rendered.to_lowercase().contains("trace"), "{rendered}");
    assert!(rendered.contains("reqwest=warn"), "{rendered}");
}

#[test]
fn test_spans_can_be_entered_after_init() {
    init_logging(Level::DEBUG, LogFormat::Json, true);

    let run_id = Uuid::new_v4();
    let run = run_span!(run_id = %run_id);
    let _run = run.enter();
    let stage = stage_span!(stage = "analyse");
    let _stage = stage.enter();
    let task = task_span!(task_id = %Uuid::new_v4(), shard = 2u32);
    let _task = task.enter();
    tracing::info!("inside nested pipeline spans");
}
