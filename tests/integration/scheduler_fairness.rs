//! Scheduler priority, fairness and admission tests.
//!
//! Most tests step the dispatch loop by hand with `dispatch_cycle()` so the
//! order of dispatch is deterministic; the rest run the background loop.

use std::time::Duration;

use serde_json::json;

use flowcore::core::{ExecutionStatus, TaskId};
use flowcore::events::OrchestrationEvent;
use flowcore::resource::ResourceType;
use flowcore::scheduler::{Priority, ScheduledTask, TaskContext, TaskScheduler};

use crate::fixtures::{ConcurrencyGauge, RunLog, SchedulerHarness, WAIT};

fn logged_task(id: &str, priority: Priority, log: &RunLog) -> ScheduledTask {
    let log = log.clone();
    let name = id.to_string();
    ScheduledTask::new(id, move |_| {
        log.record(&name);
        async { Ok(json!(null)) }
    })
    .with_priority(priority)
}

/// Wait until no task is running.
async fn settle(scheduler: &TaskScheduler) {
    tokio::time::timeout(WAIT, async {
        while scheduler.running_count() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("running tasks did not settle");
}

// ========== Priority ==========

/// Test: One worker drains tiers in priority order
/// Given one task per tier submitted lowest first
/// When cycles run one at a time on a single worker
/// Then tasks run Critical, High, Normal, Low, Background
#[tokio::test]
async fn test_single_worker_runs_by_priority() {
    let harness = SchedulerHarness::new(1);
    let log = RunLog::default();
    for priority in Priority::ALL.iter().rev() {
        harness
            .scheduler
            .submit_task(logged_task(&priority.to_string(), *priority, &log))
            .unwrap();
    }

    for _ in 0..5 {
        assert_eq!(harness.scheduler.dispatch_cycle(), 1);
        settle(&harness.scheduler).await;
    }

    assert_eq!(
        log.entries(),
        vec!["critical", "high", "normal", "low", "background"]
    );
}

/// Test: FIFO within a tier
/// Given five Normal tasks
/// When they run on one worker
/// Then they run in submission order
#[tokio::test]
async fn test_fifo_within_tier() {
    let harness = SchedulerHarness::new(1);
    let log = RunLog::default();
    let ids: Vec<TaskId> = (0..5)
        .map(|i| {
            harness
                .scheduler
                .submit_task(logged_task(&format!("n{}", i), Priority::Normal, &log))
                .unwrap()
        })
        .collect();

    harness.scheduler.start();
    harness.scheduler.wait_for_completion(&ids, WAIT).await.unwrap();
    harness.scheduler.stop().await.unwrap();

    assert_eq!(log.entries(), vec!["n0", "n1", "n2", "n3", "n4"]);
}

// ========== Fairness ==========

/// Test: Background is not starved by a Critical flood
/// Given one Background task behind twenty Critical tasks on one worker
/// When cycles run one at a time
/// Then the Background task is dispatched by the fourth dispatching cycle
#[tokio::test]
async fn test_background_progresses_under_critical_flood() {
    let harness = SchedulerHarness::new(1);
    let threshold = harness.scheduler.config().starvation_threshold as usize;
    let log = RunLog::default();
    harness
        .scheduler
        .submit_task(logged_task("bg", Priority::Background, &log))
        .unwrap();
    for i in 0..20 {
        harness
            .scheduler
            .submit_task(logged_task(&format!("crit{}", i), Priority::Critical, &log))
            .unwrap();
    }

    for _ in 0..=threshold {
        assert_eq!(harness.scheduler.dispatch_cycle(), 1);
        settle(&harness.scheduler).await;
    }

    let position = log.position("bg").expect("background never ran");
    assert!(position <= threshold, "background ran at {}", position);
    assert!(harness.scheduler.queued_count() > 0, "critical work remains");
}

/// Test: Quotas share one cycle across tiers
/// Given six High and three Low tasks and plenty of workers
/// When one cycle runs
/// Then four High and one Low are dispatched
#[tokio::test]
async fn test_quotas_split_single_cycle() {
    let harness = SchedulerHarness::new(16);
    let log = RunLog::default();
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            harness
                .scheduler
                .submit_task(logged_task(&format!("h{}", i), Priority::High, &log))
                .unwrap(),
        );
    }
    for i in 0..3 {
        ids.push(
            harness
                .scheduler
                .submit_task(logged_task(&format!("l{}", i), Priority::Low, &log))
                .unwrap(),
        );
    }

    assert_eq!(harness.scheduler.dispatch_cycle(), 5);
    let depths: Vec<_> = harness.scheduler.queue_depths();
    assert!(depths.contains(&(Priority::High, 2)));
    assert!(depths.contains(&(Priority::Low, 2)));

    harness.scheduler.start();
    let results = harness.scheduler.wait_for_completion(&ids, WAIT).await.unwrap();
    assert!(results.iter().all(|r| r.is_success()));
    harness.scheduler.stop().await.unwrap();
}

// ========== Admission ==========

/// Test: Resource capacity bounds concurrency
/// Given a GPU pool of 2 and six tasks needing one GPU each
/// When the loop runs with eight workers
/// Then no more than two tasks hold a GPU at once and all capacity returns
#[tokio::test]
async fn test_resource_capacity_bounds_concurrency() {
    let harness = SchedulerHarness::new(8);
    harness
        .allocator
        .register_resource("gpu", ResourceType::Compute, 2)
        .unwrap();
    let gauge = ConcurrencyGauge::new();

    let ids: Vec<TaskId> = (0..6)
        .map(|i| {
            let gauge = gauge.clone();
            harness
                .scheduler
                .submit_task(
                    ScheduledTask::new(&format!("train{}", i), move |_| {
                        let gauge = gauge.clone();
                        async move {
                            gauge.occupy(Duration::from_millis(15)).await;
                            Ok(json!(null))
                        }
                    })
                    .with_resource("gpu", 1),
                )
                .unwrap()
        })
        .collect();

    harness.scheduler.start();
    let results = harness.scheduler.wait_for_completion(&ids, WAIT).await.unwrap();
    harness.scheduler.stop().await.unwrap();

    assert!(results.iter().all(|r| r.is_success()));
    assert!(gauge.peak() <= 2, "peak {}", gauge.peak());
    let usage = harness.allocator.get_usage("gpu").unwrap();
    assert_eq!(usage.allocated, 0);
    assert_eq!(usage.peak, 2);
    assert_eq!(usage.active_allocations, 0);
}

/// Test: Dependencies feed outputs forward
/// Given fetch -> parse submitted at different priorities
/// When the loop runs
/// Then parse runs after fetch and receives its output
#[tokio::test]
async fn test_dependency_output_reaches_dependent() {
    let harness = SchedulerHarness::new(4);
    let fetch = harness
        .scheduler
        .submit_task(
            ScheduledTask::new("fetch", |_| async { Ok(json!({"bytes": 512})) })
                .with_priority(Priority::Low),
        )
        .unwrap();
    let parse = harness
        .scheduler
        .submit_task(
            ScheduledTask::new("parse", |ctx: TaskContext| async move {
                let bytes = ctx.inputs.get("fetch").and_then(|v| v["bytes"].as_u64());
                bytes.map(|b| json!(b / 2)).ok_or_else(|| "missing fetch".to_string())
            })
            .with_priority(Priority::Critical)
            .depends_on(&["fetch"]),
        )
        .unwrap();

    harness.scheduler.start();
    let results = harness
        .scheduler
        .wait_for_completion(&[fetch, parse], WAIT)
        .await
        .unwrap();
    harness.scheduler.stop().await.unwrap();

    assert_eq!(results[1].status, ExecutionStatus::Success);
    assert_eq!(results[1].output, json!(256));
}

// ========== Waiting ==========

/// Test: Waiting resolves only when the task settles
/// Given a running task parked on its cancellation token
/// When a waiter is polled before and after the task finishes
/// Then it is pending first, woken by completion, then ready
#[tokio::test]
async fn test_wait_pending_until_task_settles() {
    let harness = SchedulerHarness::new(1);
    let id = harness
        .scheduler
        .submit_task(ScheduledTask::new("gate", |ctx: TaskContext| async move {
            ctx.cancellation.cancelled().await;
            Ok(json!("released"))
        }))
        .unwrap();
    assert_eq!(harness.scheduler.dispatch_cycle(), 1);

    let ids = [id];
    let mut wait = tokio_test::task::spawn(harness.scheduler.wait_for_completion(&ids, WAIT));
    tokio_test::assert_pending!(wait.poll());

    harness.scheduler.cancel_task("gate").unwrap();
    settle(&harness.scheduler).await;

    assert!(wait.is_woken());
    let results = tokio_test::assert_ready_ok!(wait.poll());
    assert_eq!(results[0].status, ExecutionStatus::Success);
    assert_eq!(results[0].output, json!("released"));
}

// ========== Cancellation ==========

/// Test: Cancelling a running task cascades to its dependents
/// Given a long task honoring its cancellation token and a dependent
/// When the long task is cancelled
/// Then it ends Cancelled and the dependent never runs
#[tokio::test]
async fn test_cancellation_cascades() {
    let mut harness = SchedulerHarness::new(2);
    let log = RunLog::default();
    let long = harness
        .scheduler
        .submit_task(ScheduledTask::new("long", |ctx: TaskContext| async move {
            ctx.cancellation.cancelled().await;
            Err("stopped on request".to_string())
        }))
        .unwrap();
    let after = harness
        .scheduler
        .submit_task(logged_task("after", Priority::Normal, &log).depends_on(&["long"]))
        .unwrap();

    harness.scheduler.start();
    tokio::time::timeout(WAIT, async {
        while harness.scheduler.get_task_status("long") != Some(ExecutionStatus::Running) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert!(harness.scheduler.cancel_task("long").unwrap());

    let results = harness
        .scheduler
        .wait_for_completion(&[long, after], WAIT)
        .await
        .unwrap();
    harness.scheduler.stop().await.unwrap();

    assert_eq!(results[0].status, ExecutionStatus::Cancelled);
    assert_eq!(results[1].status, ExecutionStatus::Cancelled);
    assert!(log.entries().is_empty());

    let completions = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, OrchestrationEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completions, 2);
}
