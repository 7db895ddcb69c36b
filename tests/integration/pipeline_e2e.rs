//! End-to-end pipeline execution tests.
//!
//! These tests run multi-stage pipelines and verify ordering, context
//! flow, retry recovery, fail-fast propagation and bounded concurrency.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use flowcore::core::{ExecutionStatus, WorkflowContext};
use flowcore::events::{EventBus, OrchestrationEvent};
use flowcore::pipeline::{Pipeline, PipelineConfig, Stage};

use crate::fixtures::{echo_stage, failing_stage, fast_retry, flaky_stage, ConcurrencyGauge, RunLog};

fn config() -> PipelineConfig {
    PipelineConfig {
        retry: fast_retry(),
        ..Default::default()
    }
}

// ========== Ordering & Context ==========

/// Test: ETL pipeline passes data downstream
/// Given extract -> transform -> load
/// When the pipeline runs
/// Then each stage sees its predecessor's output and the context holds all three
#[tokio::test]
async fn test_etl_pipeline_flows_context() {
    let pipeline = Pipeline::new("etl")
        .with_config(config())
        .stage(Stage::function("extract", |ctx: WorkflowContext| async move {
            let rows = ctx.param("rows").and_then(|v| v.as_u64()).unwrap_or(0);
            Ok(json!((1..=rows).collect::<Vec<_>>()))
        }))
        .stage(
            Stage::function("transform", |ctx: WorkflowContext| async move {
                let rows = ctx.get("extract").cloned().ok_or("no extract output")?;
                let doubled: Vec<u64> = serde_json::from_value::<Vec<u64>>(rows)
                    .map_err(|e| e.to_string())?
                    .into_iter()
                    .map(|r| r * 2)
                    .collect();
                Ok::<_, String>(json!(doubled))
            })
            .depends_on(&["extract"]),
        )
        .stage(
            Stage::function("load", |ctx: WorkflowContext| async move {
                let rows = ctx.get("transform").and_then(|v| v.as_array().cloned());
                Ok(json!({ "loaded": rows.map(|r| r.len()).unwrap_or(0) }))
            })
            .depends_on(&["transform"]),
        );

    let result = pipeline
        .run(WorkflowContext::with_params(json!({ "rows": 3 })))
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.context.get("extract"), Some(&json!([1, 2, 3])));
    assert_eq!(result.context.get("transform"), Some(&json!([2, 4, 6])));
    assert_eq!(result.context.get("load"), Some(&json!({ "loaded": 3 })));
    let order: Vec<_> = result.stages.iter().map(|s| s.id.to_string()).collect();
    assert_eq!(order, vec!["extract", "transform", "load"]);
}

/// Test: Declaration order does not matter
/// Given stages declared in reverse dependency order
/// When the pipeline runs
/// Then every stage still runs after its dependencies
#[tokio::test]
async fn test_reverse_declaration_runs_in_dependency_order() {
    let log = RunLog::default();
    let stage = |id: &'static str, deps: &[&str]| {
        let log = log.clone();
        Stage::function(id, move |_| {
            log.record(id);
            async { Ok(json!(null)) }
        })
        .depends_on(deps)
    };

    let pipeline = Pipeline::new("reverse")
        .with_config(config())
        .stage(stage("publish", &["test", "docs"]))
        .stage(stage("docs", &["build"]))
        .stage(stage("test", &["build"]))
        .stage(stage("build", &[]));

    let result = pipeline.run(WorkflowContext::new()).await;
    assert!(result.is_success());
    assert_eq!(log.position("build"), Some(0));
    assert_eq!(log.position("publish"), Some(3));
}

// ========== Retries & Failure ==========

/// Test: Transient failures are retried
/// Given a stage that fails twice and has a retry budget of 2
/// When the pipeline runs
/// Then the stage succeeds on its third attempt
#[tokio::test]
async fn test_transient_failure_recovers() {
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::new("retry")
        .with_config(config())
        .stage(flaky_stage("fetch", 2, Arc::clone(&calls)).with_retries(2))
        .stage(echo_stage("parse").depends_on(&["fetch"]));

    let result = pipeline.run(WorkflowContext::new()).await;

    assert!(result.is_success());
    let fetch = result.stage("fetch").unwrap();
    assert_eq!(fetch.attempts, 3);
    assert_eq!(fetch.retries(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// Test: Fail-fast cancels the rest
/// Given build (fails) -> package, and an independent lint declared later
/// When the pipeline runs with fail_fast
/// Then package and lint are cancelled and never invoked
#[tokio::test]
async fn test_fail_fast_cancels_remaining_stages() {
    let log = RunLog::default();
    let tracked = |id: &'static str| {
        let log = log.clone();
        Stage::function(id, move |_| {
            log.record(id);
            async { Ok(json!(null)) }
        })
    };

    let pipeline = Pipeline::new("ff")
        .with_config(config())
        .stage(failing_stage("build"))
        .stage(tracked("package").depends_on(&["build"]))
        .stage(tracked("lint"));

    let result = pipeline.run(WorkflowContext::new()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.stage("build").unwrap().status, ExecutionStatus::Failed);
    assert_eq!(
        result.stage("package").unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert_eq!(result.stage("lint").unwrap().status, ExecutionStatus::Cancelled);
    assert!(result.error.as_deref().unwrap().contains("build exploded"));
    assert!(log.entries().is_empty());
}

/// Test: Without fail-fast, independent branches finish
/// Given a failing branch and an independent healthy branch
/// When the pipeline runs with fail_fast = false
/// Then only the failing branch's dependents are cancelled
#[tokio::test]
async fn test_independent_branch_survives_without_fail_fast() {
    let pipeline = Pipeline::new("branches")
        .with_config(PipelineConfig {
            fail_fast: false,
            ..config()
        })
        .stage(failing_stage("left"))
        .stage(echo_stage("left-child").depends_on(&["left"]))
        .stage(echo_stage("right"))
        .stage(echo_stage("right-child").depends_on(&["right"]));

    let result = pipeline.run(WorkflowContext::new()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.count(ExecutionStatus::Success), 2);
    assert_eq!(
        result.stage("left-child").unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert_eq!(
        result.context.get("right-child"),
        Some(&json!("right-child-done"))
    );
}

/// Test: Timed-out attempts count against the budget
/// Given a stage that sleeps past its timeout with one retry
/// When the pipeline runs
/// Then the stage fails after two attempts with a timeout error
#[tokio::test]
async fn test_timeout_exhausts_budget() {
    let pipeline = Pipeline::new("slow").with_config(config()).stage(
        Stage::function("nap", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!(null))
        })
        .with_timeout(Duration::from_millis(20))
        .with_retries(1),
    );

    let result = pipeline.run(WorkflowContext::new()).await;
    let nap = result.stage("nap").unwrap();
    assert_eq!(nap.status, ExecutionStatus::Failed);
    assert_eq!(nap.attempts, 2);
    assert!(nap.error.as_deref().unwrap().contains("timed out"));
}

// ========== Concurrency ==========

/// Test: Parallel stage respects its concurrency bound
/// Given a parallel stage of 6 children limited to 2 at a time
/// When it runs
/// Then at most 2 children are ever active together
#[tokio::test]
async fn test_parallel_stage_bounded() {
    let gauge = ConcurrencyGauge::new();
    let children = (0..6)
        .map(|i| gauge.stage(&format!("child-{}", i), Duration::from_millis(20)))
        .collect();
    let pipeline = Pipeline::new("fan-out")
        .with_config(config())
        .stage(Stage::parallel("fan", children).with_max_concurrency(2));

    let result = pipeline.run(WorkflowContext::new()).await;

    assert!(result.is_success());
    assert_eq!(result.stage("fan").unwrap().children.len(), 6);
    assert!(gauge.peak() <= 2, "peak {}", gauge.peak());
    assert!(gauge.peak() >= 1);
}

/// Test: Level-parallel runs each level concurrently
/// Given a root with 4 independent dependents and max_parallel 4
/// When the pipeline runs level-parallel
/// Then the dependents overlap and never exceed the bound
#[tokio::test]
async fn test_level_parallel_overlaps_within_level() {
    let gauge = ConcurrencyGauge::new();
    let mut pipeline = Pipeline::new("levels").with_config(PipelineConfig {
        level_parallel: true,
        max_parallel: 4,
        ..config()
    });
    pipeline.add_stage(echo_stage("root"));
    for i in 0..4 {
        pipeline.add_stage(
            gauge
                .stage(&format!("leaf-{}", i), Duration::from_millis(50))
                .depends_on(&["root"]),
        );
    }

    let result = pipeline.run(WorkflowContext::new()).await;

    assert!(result.is_success());
    assert!(gauge.peak() > 1, "leaves never overlapped");
    assert!(gauge.peak() <= 4);
}

// ========== Events ==========

/// Test: Stage events bracket every stage
/// Given a two-stage pipeline publishing to an event bus
/// When it runs
/// Then each stage's start precedes its completion on the stream
#[tokio::test]
async fn test_stage_events_in_order() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let pipeline = Pipeline::new("events")
        .with_config(config())
        .with_events(bus)
        .stage(echo_stage("first"))
        .stage(echo_stage("second").depends_on(&["first"]));

    pipeline.run(WorkflowContext::new()).await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let labels: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            OrchestrationEvent::StageStarted { stage_id } => Some(format!("start:{}", stage_id)),
            OrchestrationEvent::StageCompleted { stage_id, status, .. } => {
                Some(format!("{}:{}", status, stage_id))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        labels,
        vec!["start:first", "success:first", "start:second", "success:second"]
    );
}
