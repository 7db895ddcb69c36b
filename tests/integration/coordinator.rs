//! Coordinator end-to-end tests.
//!
//! These tests drive whole workflows through every execution mode and
//! check that results, sessions, events, health and metrics agree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use flowcore::core::ExecutionStatus;
use flowcore::events::{EventType, OrchestrationEvent};
use flowcore::orchestration::{
    InMemoryWorkflowRepository, SessionState, WorkflowRepository, WorkflowSummary,
};
use flowcore::resource::ResourceType;
use flowcore::scheduler::Priority;
use flowcore::{Coordinator, Error, ExecutionMode, WorkUnit, WorkflowDefinition};

use crate::fixtures::{echo_unit, fast_config, summing_unit, ConcurrencyGauge};

const MODES: [ExecutionMode; 4] = [
    ExecutionMode::Sequential,
    ExecutionMode::Parallel,
    ExecutionMode::Priority,
    ExecutionMode::ResourceAware,
];

/// seed -> (left, right) -> total; every unit adds one to what it receives.
fn summing_diamond() -> WorkflowDefinition {
    WorkflowDefinition::new("sum")
        .with_description("adds upstream outputs")
        .unit(summing_unit("seed", &[]))
        .unit(summing_unit("left", &["seed"]))
        .unit(summing_unit("right", &["seed"]))
        .unit(summing_unit("total", &["left", "right"]))
}

// ========== Execution Modes ==========

/// Test: Every mode computes the same answer
/// Given a summing diamond and params {seed: 10}
/// When it runs in each of the four modes
/// Then every run succeeds with the same total
#[tokio::test]
async fn test_modes_agree_on_result() {
    let coordinator = Coordinator::new(fast_config());
    coordinator.register_workflow(summing_diamond()).unwrap();

    for mode in MODES {
        let session = coordinator.create_session(mode);
        let result = coordinator
            .execute_workflow("sum", json!({ "seed": 10 }), &session)
            .await
            .unwrap();

        assert!(result.is_success(), "{}: {:?}", mode, result.error);
        assert_eq!(result.mode, mode);
        // seed = 11, left = right = 22, total = 10 + 44 + 1.
        assert_eq!(result.context.get("seed"), Some(&json!(11)), "{}", mode);
        assert_eq!(result.context.get("total"), Some(&json!(55)), "{}", mode);
        assert_eq!(result.count(ExecutionStatus::Success), 4);
    }
    coordinator.shutdown().await.unwrap();
}

/// Test: Parallel mode overlaps independent units
/// Given four independent slow units
/// When run in Parallel mode
/// Then more than one runs at a time
#[tokio::test]
async fn test_parallel_mode_overlaps_units() {
    let coordinator = Coordinator::new(fast_config());
    let gauge = ConcurrencyGauge::new();
    let definition = (0..4).fold(WorkflowDefinition::new("wide"), |def, i| {
        let gauge = gauge.clone();
        def.unit(WorkUnit::new(&format!("w{}", i), move |_| {
            let gauge = gauge.clone();
            async move {
                gauge.occupy(Duration::from_millis(40)).await;
                Ok(json!(i))
            }
        }))
    });
    coordinator.register_workflow(definition).unwrap();

    let session = coordinator.create_session(ExecutionMode::Parallel);
    let result = coordinator
        .execute_workflow("wide", json!(null), &session)
        .await
        .unwrap();

    assert!(result.is_success());
    assert!(gauge.peak() > 1);
}

/// Test: Resource-aware mode honors capacity across sessions
/// Given a license pool of 1 and two concurrent sessions of a workflow
///   whose units each need the license
/// When both sessions run at once
/// Then the license is never held twice and both sessions succeed
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_share_allocator() {
    let coordinator = Arc::new(Coordinator::new(fast_config()));
    coordinator
        .allocator()
        .register_resource("license", ResourceType::ApiQuota, 1)
        .unwrap();
    let gauge = ConcurrencyGauge::new();
    let licensed = |id: &str| {
        let gauge = gauge.clone();
        WorkUnit::new(id, move |_| {
            let gauge = gauge.clone();
            async move {
                gauge.occupy(Duration::from_millis(10)).await;
                Ok(json!(null))
            }
        })
        .with_resource("license", 1)
    };
    coordinator
        .register_workflow(
            WorkflowDefinition::new("licensed")
                .unit(licensed("a").with_priority(Priority::High))
                .unit(licensed("b").depends_on(&["a"]))
                .unit(licensed("c")),
        )
        .unwrap();

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let session = coordinator.create_session(ExecutionMode::ResourceAware);
                coordinator
                    .execute_workflow("licensed", json!(null), &session)
                    .await
            })
        })
        .collect();
    for run in runs {
        let result = run.await.unwrap().unwrap();
        assert!(result.is_success(), "{:?}", result.error);
    }

    assert_eq!(gauge.peak(), 1);
    let usage = coordinator.allocator().get_usage("license").unwrap();
    assert_eq!(usage.allocated, 0);
    assert_eq!(coordinator.metrics().workflows_succeeded, 2);
    coordinator.shutdown().await.unwrap();
}

// ========== Failures ==========

/// Test: A failing unit fails the workflow without an Err
/// Given a unit that exhausts its retries
/// When the workflow runs
/// Then the result is Failed, the session is Failed and WorkflowFailed fires
#[tokio::test]
async fn test_unit_failure_is_data() {
    let coordinator = Coordinator::new(fast_config());
    coordinator
        .register_workflow(
            WorkflowDefinition::new("flaky")
                .unit(echo_unit("prepare"))
                .unit(
                    WorkUnit::new("deploy", |_| async { Err("target unreachable".to_string()) })
                        .with_retries(2)
                        .depends_on(&["prepare"]),
                ),
        )
        .unwrap();
    let failed: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&failed);
    coordinator.register_event_handler(EventType::WorkflowFailed, move |event| {
        if let OrchestrationEvent::WorkflowFailed { workflow, .. } = event {
            sink.lock().unwrap().push(workflow.clone());
        }
    });

    for mode in [ExecutionMode::Sequential, ExecutionMode::Priority] {
        let session = coordinator.create_session(mode);
        let result = coordinator
            .execute_workflow("flaky", json!(null), &session)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        let deploy = result.unit("deploy").unwrap();
        assert_eq!(deploy.attempts, 3);
        assert_eq!(deploy.error.as_deref(), Some("target unreachable"));
        assert_eq!(
            coordinator.session_state(session.id),
            Some(SessionState::Failed)
        );
    }
    assert_eq!(failed.lock().unwrap().len(), 2);
    coordinator.shutdown().await.unwrap();
}

/// Test: Invalid graphs never run
/// Given a workflow depending on an undeclared unit
/// When it runs in each mode
/// Then no unit executes and every unit is Cancelled
#[tokio::test]
async fn test_invalid_workflow_runs_nothing() {
    let coordinator = Coordinator::new(fast_config());
    coordinator
        .register_workflow(
            WorkflowDefinition::new("dangling")
                .unit(echo_unit("a"))
                .unit(echo_unit("b").depends_on(&["ghost"])),
        )
        .unwrap();

    for mode in MODES {
        let session = coordinator.create_session(mode);
        let result = coordinator
            .execute_workflow("dangling", json!(null), &session)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.count(ExecutionStatus::Cancelled), 2, "{}", mode);
        assert!(result.error.as_deref().unwrap().contains("ghost"));
    }
    assert_eq!(coordinator.scheduler().stats().dispatched, 0);
}

// ========== Repository ==========

/// Repository wrapper counting lookups.
#[derive(Default)]
struct CountingRepository {
    inner: InMemoryWorkflowRepository,
    lookups: Mutex<HashMap<String, usize>>,
}

impl WorkflowRepository for CountingRepository {
    fn get(&self, name: &str) -> flowcore::Result<Option<WorkflowDefinition>> {
        *self
            .lookups
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
        self.inner.get(name)
    }

    fn list(&self) -> flowcore::Result<Vec<WorkflowSummary>> {
        self.inner.list()
    }

    fn create(&self, definition: WorkflowDefinition) -> flowcore::Result<()> {
        self.inner.create(definition)
    }

    fn update(&self, definition: WorkflowDefinition) -> flowcore::Result<()> {
        self.inner.update(definition)
    }

    fn delete(&self, name: &str) -> flowcore::Result<bool> {
        self.inner.delete(name)
    }
}

/// Test: The coordinator reads workflows through its repository
/// Given a custom repository
/// When workflows are registered, run and updated
/// Then every lookup goes through it and updates take effect
#[tokio::test]
async fn test_custom_repository() {
    let repository = Arc::new(CountingRepository::default());
    let coordinator = Coordinator::with_repository(fast_config(), repository.clone());
    coordinator
        .register_workflow(WorkflowDefinition::new("greet").unit(echo_unit("hello")))
        .unwrap();
    assert!(matches!(
        coordinator.register_workflow(WorkflowDefinition::new("greet")),
        Err(Error::WorkflowExists(_))
    ));

    let session = coordinator.create_session(ExecutionMode::Sequential);
    let first = coordinator
        .execute_workflow("greet", json!(null), &session)
        .await
        .unwrap();
    assert_eq!(first.units.len(), 1);

    coordinator
        .repository()
        .update(
            WorkflowDefinition::new("greet")
                .unit(echo_unit("hello"))
                .unit(echo_unit("goodbye").depends_on(&["hello"])),
        )
        .unwrap();
    let session = coordinator.create_session(ExecutionMode::Sequential);
    let second = coordinator
        .execute_workflow("greet", json!(null), &session)
        .await
        .unwrap();
    assert_eq!(second.units.len(), 2);
    assert_eq!(second.context.get("goodbye"), Some(&json!("goodbye-done")));

    let summaries = coordinator.repository().list().unwrap();
    assert_eq!(summaries[0].version, 2);
    assert_eq!(repository.lookups.lock().unwrap()["greet"], 2);
}

// ========== Health & Metrics ==========

/// Test: Health and metrics reflect finished work
/// Given two successful runs and one failed run
/// When health and metrics are read
/// Then counts, failure rate and session activity match
#[tokio::test]
async fn test_health_and_metrics_after_runs() {
    let coordinator = Coordinator::new(fast_config());
    coordinator.register_workflow(summing_diamond()).unwrap();
    coordinator
        .register_workflow(
            WorkflowDefinition::new("broken")
                .unit(WorkUnit::new("x", |_| async { Err("nope".to_string()) })),
        )
        .unwrap();

    for name in ["sum", "sum", "broken"] {
        let session = coordinator.create_session(ExecutionMode::Priority);
        coordinator
            .execute_workflow(name, json!({ "seed": 1 }), &session)
            .await
            .unwrap();
    }

    let metrics = coordinator.metrics();
    assert_eq!(metrics.workflows_started, 3);
    assert_eq!(metrics.workflows_succeeded, 2);
    assert_eq!(metrics.workflows_failed, 1);
    assert_eq!(metrics.workflows_in_flight(), 0);

    let health = coordinator.get_health_status();
    assert!((health.recent_failure_rate - 1.0 / 3.0).abs() < 1e-9);
    assert!(health.healthy);
    assert_eq!(health.active_sessions, 0);
    assert_eq!(health.running_tasks, 0);
    assert!(health.queue_depths.values().all(|d| *d == 0));

    coordinator.shutdown().await.unwrap();
    assert!(!coordinator.scheduler().is_running());
}
