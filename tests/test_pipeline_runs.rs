//! End-to-end pipeline runs against a scripted analysis service
//!
//! Every test drives real routers, harnesses and the state machine over
//! in-memory backends and checks observable outcomes: run status, gaps,
//! warnings, service call counts and the audit trail.


use analysis_orchestrator::analysis::AnalysisError;
use analysis_orchestrator::audit::AuditEventType;
use analysis_orchestrator::model::NewArtifact;
use analysis_orchestrator::testing::MockAnalysisService;
use analysis_orchestrator::{Orchestrator, RunPolicy, RunStatus, StageKind};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

const WAIT: Duration = Duration::from_secs(20);

#[tokio::test]
async fn test_full_run_with_failed_document_and_one_revision() {
    let service = Arc::new(MockAnalysisService::new(|request| {
        match request.stage.kind {
            StageKind::Analyse if document_of(request) == Some("doc-2") => {
                Err(AnalysisError::unavailable("analysis backend keeps dropping doc-2"))
            }
            StageKind::FactCheck if request.stage.iteration == 1 => Ok(one_finding()),
            StageKind::FactCheck => Ok(output(json!({"findings": []}))),
            _ => Ok(output(json!({"stage": request.stage.to_string()}))),
        }
    }));
    let orchestrator = started(fast_config(), service.clone()).await;

    let run_id = orchestrator
        .submit_run(full_pipeline(RunPolicy::default()), documents(3))
        .await
        .unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(summary.status, RunStatus::CompletedWithWarnings);
    assert_eq!(summary.gaps.len(), 1);
    assert_eq!(summary.gaps[0].document_id.as_deref(), Some("doc-2"));
    assert_eq!(summary.gaps[0].stage.kind, StageKind::Analyse);
    assert!(summary.warnings.is_empty());
    assert!(summary.final_artifact.is_some());

    assert_eq!(service.calls_for(StageKind::PreTest), 1);
    // doc-2 is tried max_attempts times
    assert_eq!(service.calls_for(StageKind::Analyse), 5);
    assert_eq!(service.calls_for(StageKind::Synthesis), 1);
    assert_eq!(service.calls_for(StageKind::FactCheck), 2);
    assert_eq!(service.calls_for(StageKind::Revision), 1);

    let events = orchestrator
        .backends()
        .audit
        .events_for_run(run_id)
        .await
        .unwrap();
    assert_eq!(events.first().map(|e| e.event_type), Some(AuditEventType::RunSubmitted));
    assert_eq!(events.last().map(|e| e.event_type), Some(AuditEventType::RunCompleted));
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(count(&types, AuditEventType::FindingsRaised), 1);
    assert_eq!(count(&types, AuditEventType::RevisionScheduled), 1);
    assert_eq!(count(&types, AuditEventType::TransientFailure), 3);
    assert_eq!(count(&types, AuditEventType::TaskPermanentlyFailed), 1);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_waits_for_every_shard_and_fires_once() {
    let service = Arc::new(MockAnalysisService::new(|request| {
        match (request.stage.kind, document_of(request)) {
            (StageKind::Analyse, Some("doc-2" | "doc-4")) => {
                Err(AnalysisError::rejected("unsupported language"))
            }
            _ => Ok(output(json!({"ok": true}))),
        }
    }));
    let orchestrator = started(fast_config(), service.clone()).await;

    let run_id = orchestrator
        .submit_run(
            spec(&[StageKind::Analyse, StageKind::Synthesis], RunPolicy::default()),
            documents(5),
        )
        .await
        .unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(summary.status, RunStatus::CompletedWithWarnings);
    assert_eq!(summary.gaps.len(), 2);
    assert_eq!(service.calls_for(StageKind::Analyse), 5);
    assert_eq!(service.calls_for(StageKind::Synthesis), 1);

    let synthesis = service
        .calls()
        .into_iter()
        .find(|r| r.stage.kind == StageKind::Synthesis)
        .unwrap();
    let upstream = synthesis.context["input"]["upstream"].as_array().unwrap();
    assert_eq!(upstream.len(), 3);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_is_retried_until_the_attempt_limit() {
    let service = Arc::new(MockAnalysisService::new(|request| match request.stage.kind {
        StageKind::Synthesis => Err(AnalysisError::unavailable("upstream model overloaded")),
        _ => Ok(output(json!({"ok": true}))),
    }));
    let orchestrator = started(fast_config(), service.clone()).await;

    let policy = RunPolicy {
        max_attempts: 3,
        ..RunPolicy::default()
    };
    let run_id = orchestrator
        .submit_run(spec(&[StageKind::Synthesis], policy), documents(1))
        .await
        .unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(service.calls_for(StageKind::Synthesis), 3);
    assert_eq!(summary.status, RunStatus::Aborted);
    assert!(summary
        .abort_reason
        .unwrap_or_default()
        .contains("failure tolerance"));

    let types = event_types(&orchestrator, run_id).await;
    assert_eq!(count(&types, AuditEventType::TransientFailure), 3);
    assert_eq!(count(&types, AuditEventType::TaskPermanentlyFailed), 1);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let failures = Arc::new(AtomicU32::new(1));
    let remaining = failures.clone();
    let service = Arc::new(MockAnalysisService::new(move |request| {
        let flaky = request.stage.kind == StageKind::Analyse
            && document_of(request) == Some("doc-1")
            && remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if flaky {
            Err(AnalysisError::Timeout { after_ms: 10 })
        } else {
            Ok(output(json!({"ok": true})))
        }
    }));
    let orchestrator = started(fast_config(), service.clone()).await;

    let run_id = orchestrator
        .submit_run(spec(&[StageKind::Analyse], RunPolicy::default()), documents(2))
        .await
        .unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.gaps.is_empty());
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(service.calls_for(StageKind::Analyse), 3);

    let types = event_types(&orchestrator, run_id).await;
    assert_eq!(count(&types, AuditEventType::TransientFailure), 1);
    assert_eq!(count(&types, AuditEventType::TaskRequeued), 1);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fact_check_loop_is_capped_by_max_iterations() {
    let service = Arc::new(MockAnalysisService::new(|request| match request.stage.kind {
        StageKind::FactCheck => Ok(one_finding()),
        _ => Ok(output(json!({"draft": request.stage.to_string()}))),
    }));
    let orchestrator = started(fast_config(), service.clone()).await;

    let policy = RunPolicy {
        max_iterations: 4,
        ..RunPolicy::default()
    };
    let run_id = orchestrator
        .submit_run(
            spec(&[StageKind::Synthesis, StageKind::FactCheck], policy),
            documents(1),
        )
        .await
        .unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(summary.status, RunStatus::CompletedWithWarnings);
    assert_eq!(service.calls_for(StageKind::FactCheck), 4);
    assert_eq!(service.calls_for(StageKind::Revision), 3);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].iteration, 4);

    let types = event_types(&orchestrator, run_id).await;
    assert_eq!(count(&types, AuditEventType::IterationCapReached), 1);
    assert_eq!(count(&types, AuditEventType::RevisionScheduled), 3);

    let status = orchestrator.get_run_status(run_id).await.unwrap();
    assert_eq!(status.findings.len(), 1);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tolerance_breach_aborts_before_next_stage() {
    let service = Arc::new(MockAnalysisService::new(|request| {
        match (request.stage.kind, document_of(request)) {
            (StageKind::Analyse, Some("doc-1" | "doc-3")) => {
                Err(AnalysisError::rejected("corrupt document"))
            }
            _ => Ok(output(json!({"ok": true}))),
        }
    }));
    let orchestrator = started(fast_config(), service.clone()).await;

    let run_id = orchestrator
        .submit_run(
            spec(&[StageKind::Analyse, StageKind::Synthesis], RunPolicy::default()),
            documents(3),
        )
        .await
        .unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(summary.status, RunStatus::Aborted);
    assert_eq!(service.calls_for(StageKind::Synthesis), 0);
    assert!(summary.final_artifact.is_none());

    let types = event_types(&orchestrator, run_id).await;
    assert_eq!(types.last(), Some(&AuditEventType::RunAborted));

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_run_timeout_aborts_and_cancels_pending_tasks() {
    let service = Arc::new(MockAnalysisService::echo().with_delay(Duration::from_secs(3)));
    let orchestrator = started(fast_config(), service.clone()).await;

    let policy = RunPolicy {
        run_timeout_secs: 1,
        ..RunPolicy::default()
    };
    let run_id = orchestrator
        .submit_run(spec(&[StageKind::Analyse], policy), documents(2))
        .await
        .unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(summary.status, RunStatus::Aborted);
    assert_eq!(summary.abort_reason.as_deref(), Some("run timeout"));
    assert_eq!(orchestrator.pending_tasks(run_id).await.unwrap(), 0);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_existing_artifact_is_replayed_without_calling_the_service() {
    let service = Arc::new(MockAnalysisService::echo());
    let orchestrator = build(fast_config(), service.clone()).await;

    let run_id = orchestrator
        .submit_run(spec(&[StageKind::Synthesis], RunPolicy::default()), documents(1))
        .await
        .unwrap();

    // Output of an execution that crashed before its task was marked succeeded
    let tasks = orchestrator.backends().tasks.tasks_for_run(run_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    let earlier = orchestrator
        .backends()
        .artifacts
        .put(NewArtifact::json(
            run_id,
            task.stage,
            task.task_id,
            task.shard,
            task.idempotency_key.clone(),
            json!({"draft": "written before the crash"}),
        ))
        .await
        .unwrap();

    orchestrator.start().await.unwrap();
    let summary = orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(service.calls_for(StageKind::Synthesis), 0);
    assert!(summary.artifacts.iter().any(|a| a.artifact_id == earlier));

    let types = event_types(&orchestrator, run_id).await;
    assert_eq!(count(&types, AuditEventType::ReplaySkipped), 1);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_serves_runs_in_submission_order() {
    let (backends, audit) = backends_with_log();
    let mut config = fast_config();
    config.orchestrator.router_instances = 1;
    config.orchestrator.max_concurrency = 1;
    let service = Arc::new(MockAnalysisService::echo());
    let orchestrator = Orchestrator::builder(config)
        .analysis_service(service)
        .backends(backends)
        .build()
        .await
        .unwrap();

    let first = orchestrator
        .submit_run(spec(&[StageKind::Analyse], RunPolicy::default()), documents(3))
        .await
        .unwrap();
    let second = orchestrator
        .submit_run(spec(&[StageKind::Analyse], RunPolicy::default()), documents(3))
        .await
        .unwrap();
    orchestrator.start().await.unwrap();

    orchestrator.wait_for_run(first, WAIT).await.unwrap();
    orchestrator.wait_for_run(second, WAIT).await.unwrap();

    let dispatched: Vec<_> = audit
        .all_events()
        .await
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::TaskDispatched)
        .map(|e| e.run_id)
        .collect();
    // All three shards of the first run are dispatched before any of the second
    assert_eq!(&dispatched[..3], &[first, first, first]);
    assert_eq!(&dispatched[3..6], &[second, second, second]);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_and_artifacts_of_a_finished_run() {
    let service = Arc::new(MockAnalysisService::echo());
    let orchestrator = started(fast_config(), service).await;

    let run_id = orchestrator
        .submit_run(
            spec(&[StageKind::PreTest, StageKind::Analyse], RunPolicy::default()),
            documents(2),
        )
        .await
        .unwrap();
    orchestrator.wait_for_run(run_id, WAIT).await.unwrap();

    let status = orchestrator.get_run_status(run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Completed);
    assert!(status.gaps.is_empty());
    assert!(status.abort_reason.is_none());

    let artifacts = orchestrator.get_artifacts(run_id).await.unwrap();
    // pre_test, two analyse shards and finalize
    assert_eq!(artifacts.len(), 4);
    let shards: Vec<u32> = artifacts
        .iter()
        .filter(|a| a.stage.kind == StageKind::Analyse)
        .map(|a| a.shard)
        .collect();
    assert_eq!(shards.len(), 2);
    assert!(orchestrator.active_runs().await.unwrap().is_empty());

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_submissions_are_independent_runs() {
    let service = Arc::new(MockAnalysisService::echo());
    let orchestrator = Arc::new(started(fast_config(), service.clone()).await);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let run_id = orchestrator
                    .submit_run(
                        spec(&[StageKind::Analyse, StageKind::Synthesis], RunPolicy::default()),
                        documents(2),
                    )
                    .await?;
                orchestrator.wait_for_run(run_id, WAIT).await
            })
        })
        .collect();
    let summaries: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(summaries.iter().all(|s| s.status == RunStatus::Completed));
    let mut ids: Vec<_> = summaries.iter().map(|s| s.run_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(service.calls_for(StageKind::Analyse), 8);
    assert_eq!(service.calls_for(StageKind::Synthesis), 4);

    orchestrator.shutdown().await.unwrap();
}
