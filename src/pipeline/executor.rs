//! Dependency-ordered stage execution.
//!
//! A [`Pipeline`] runs its stages in topological order. Each stage gets up
//! to `1 + retry_count` attempts with exponential backoff between them.
//! A stage whose dependency failed or was cancelled is recorded cancelled
//! without running; under `fail_fast` the first failure cancels every stage
//! that has not started yet.
//!
//! With `level_parallel` set, each execution level of the DAG runs
//! concurrently on a pool of `max_parallel` workers. Every stage still
//! starts only after all of its dependencies have been recorded.

use super::stage::{Stage, StageFn, StageKind};
use crate::core::{
    catch_panic, run_with_retry, ExecutionStatus, RetryPolicy, StageResult, TaskDag, TaskId,
    WorkflowContext,
};
use crate::error::Result;
use crate::events::{EventBus, OrchestrationEvent};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on concurrently running stages.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Execution settings for a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Cancel every unstarted stage after the first failure.
    pub fail_fast: bool,
    pub retry: RetryPolicy,
    /// Worker pool size for parallel stages and level-parallel runs.
    pub max_parallel: usize,
    /// Run each execution level concurrently instead of one stage at a time.
    pub level_parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            retry: RetryPolicy::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            level_parallel: false,
        }
    }
}

/// Everything a spawned stage needs from its pipeline.
#[derive(Clone)]
struct StageRuntime {
    fail_fast: bool,
    retry: RetryPolicy,
    max_parallel: usize,
    events: Option<EventBus>,
}

impl StageRuntime {
    fn emit(&self, event: OrchestrationEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub name: String,
    /// `Success` when every stage succeeded or was skipped.
    pub status: ExecutionStatus,
    /// One result per stage, in execution order.
    pub stages: Vec<StageResult>,
    /// Initial values plus the output of every successful stage.
    pub context: WorkflowContext,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Validation failure, or the first stage failure.
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn stage(&self, id: &str) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.id.as_str() == id)
    }

    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.stages.iter().filter(|r| r.status == status).count()
    }

    pub fn failed_stages(&self) -> Vec<&StageResult> {
        self.stages
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failed)
            .collect()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// A set of stages executed in dependency order.
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    config: PipelineConfig,
    events: Option<EventBus>,
}

impl Pipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: Vec::new(),
            config: PipelineConfig::default(),
            events: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish stage lifecycle events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Builder-style [`Pipeline::add_stage`].
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Check the stage graph without running anything.
    pub fn validate(&self) -> Result<()> {
        TaskDag::build(&self.stages).validate()
    }

    /// Order in which a sequential run would execute the stages.
    pub fn execution_order(&self) -> Result<Vec<TaskId>> {
        let dag = TaskDag::build(&self.stages);
        dag.validate()?;
        dag.topological_sort()
    }

    /// Execute every stage and report the outcome.
    ///
    /// Never fails: an invalid graph yields a `Failed` result in which no
    /// stage ran, and stage failures are recorded per stage.
    pub async fn run(&self, initial: WorkflowContext) -> PipelineResult {
        let started_at = Utc::now();
        let dag = TaskDag::build(&self.stages);

        let batches = match self.plan(&dag) {
            Ok(batches) => batches,
            Err(e) => {
                let message = e.to_string();
                warn!(pipeline = %self.name, error = %message, "pipeline rejected");
                return PipelineResult {
                    name: self.name.clone(),
                    status: ExecutionStatus::Failed,
                    stages: self
                        .stages
                        .iter()
                        .map(|s| StageResult::cancelled(s.id.clone(), &s.name, &message))
                        .collect(),
                    context: initial,
                    started_at,
                    finished_at: Utc::now(),
                    error: Some(message),
                };
            }
        };

        info!(
            pipeline = %self.name,
            stages = self.stages.len(),
            level_parallel = self.config.level_parallel,
            "pipeline started"
        );

        let by_id: HashMap<&TaskId, &Stage> = self.stages.iter().map(|s| (&s.id, s)).collect();
        let mut statuses: HashMap<TaskId, ExecutionStatus> = HashMap::new();
        let mut results = Vec::with_capacity(self.stages.len());
        let mut context = initial;
        let mut aborted: Option<String> = None;

        for batch in batches {
            let mut runnable = Vec::with_capacity(batch.len());
            for id in &batch {
                let Some(stage) = by_id.get(id).copied() else {
                    continue;
                };
                let reason = aborted.clone().or_else(|| blocked_by(stage, &statuses));
                if let Some(reason) = reason {
                    debug!(stage_id = %stage.id, reason = %reason, "stage cancelled");
                    statuses.insert(stage.id.clone(), ExecutionStatus::Cancelled);
                    results.push(StageResult::cancelled(stage.id.clone(), &stage.name, &reason));
                } else {
                    runnable.push(stage);
                }
            }

            let finished = self.execute_batch(&runnable, &context).await;
            for (stage, result) in runnable.iter().zip(finished) {
                if result.status == ExecutionStatus::Success {
                    context.insert(stage.id.as_str(), result.output.clone());
                }
                stage.run_hooks(&result, &context);
                statuses.insert(stage.id.clone(), result.status);
                if result.status == ExecutionStatus::Failed && self.config.fail_fast && aborted.is_none() {
                    warn!(pipeline = %self.name, stage_id = %stage.id, "stage failed, aborting pipeline");
                    aborted = Some(format!("pipeline aborted after stage '{}' failed", stage.id));
                }
                results.push(result);
            }
        }

        let status = if results.iter().all(|r| r.status.satisfies_dependency()) {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        let error = results
            .iter()
            .find(|r| r.status == ExecutionStatus::Failed)
            .map(|r| {
                format!(
                    "stage '{}' failed: {}",
                    r.id,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            });

        let result = PipelineResult {
            name: self.name.clone(),
            status,
            stages: results,
            context,
            started_at,
            finished_at: Utc::now(),
            error,
        };
        info!(
            pipeline = %self.name,
            status = %result.status,
            duration_ms = result.duration().as_millis() as u64,
            "pipeline finished"
        );
        result
    }

    /// Batches of stages to execute, in order.
    fn plan(&self, dag: &TaskDag) -> Result<Vec<Vec<TaskId>>> {
        dag.validate()?;
        if self.config.level_parallel {
            dag.execution_levels()
        } else {
            Ok(dag
                .topological_sort()?
                .into_iter()
                .map(|id| vec![id])
                .collect())
        }
    }

    fn runtime(&self) -> StageRuntime {
        StageRuntime {
            fail_fast: self.config.fail_fast,
            retry: self.config.retry,
            max_parallel: self.config.max_parallel.max(1),
            events: self.events.clone(),
        }
    }

    async fn execute_batch(&self, stages: &[&Stage], context: &WorkflowContext) -> Vec<StageResult> {
        match stages {
            [] => Vec::new(),
            [single] => vec![execute_stage((*single).clone(), context.clone(), self.runtime()).await],
            many => {
                let stages: Vec<Stage> = many.iter().map(|s| (*s).clone()).collect();
                run_bounded(
                    &stages,
                    self.config.max_parallel,
                    context,
                    &self.runtime(),
                    "pipeline aborted after a sibling stage failed",
                )
                .await
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("config", &self.config)
            .finish()
    }
}

/// First dependency that prevents `stage` from running, as a reason.
fn blocked_by(stage: &Stage, statuses: &HashMap<TaskId, ExecutionStatus>) -> Option<String> {
    stage
        .depends_on
        .iter()
        .find_map(|dep| match statuses.get(dep) {
            Some(status) if status.blocks_dependents() => {
                Some(format!("dependency '{}' {}", dep, status))
            }
            _ => None,
        })
}

/// Spawn `stages` on a pool of `limit` workers and collect their results in
/// declaration order.
///
/// Under fail-fast, a failed stage stops every stage still waiting for a
/// permit; those are recorded cancelled with `halt_reason`. Stages already
/// running finish normally.
async fn run_bounded(
    stages: &[Stage],
    limit: usize,
    ctx: &WorkflowContext,
    runtime: &StageRuntime,
    halt_reason: &'static str,
) -> Vec<StageResult> {
    let limit = Arc::new(Semaphore::new(limit.max(1)));
    let halted = CancellationToken::new();

    let handles = stages
        .iter()
        .cloned()
        .map(|stage| {
            let limit = Arc::clone(&limit);
            let halted = halted.clone();
            let ctx = ctx.clone();
            let runtime = runtime.clone();
            tokio::spawn(async move {
                let _permit = limit.acquire_owned().await;
                if halted.is_cancelled() {
                    debug!(stage_id = %stage.id, reason = halt_reason, "stage cancelled");
                    return StageResult::cancelled(stage.id.clone(), &stage.name, halt_reason);
                }
                let fail_fast = runtime.fail_fast;
                let result = execute_stage(stage, ctx, runtime).await;
                if fail_fast && result.status == ExecutionStatus::Failed {
                    halted.cancel();
                }
                result
            })
        })
        .collect();
    join_in_order(stages.iter(), handles).await
}

/// Await spawned stages, keeping declaration order. A stage whose task
/// panicked is recorded as failed.
async fn join_in_order<'a>(
    stages: impl Iterator<Item = &'a Stage>,
    handles: Vec<JoinHandle<StageResult>>,
) -> Vec<StageResult> {
    let mut results = Vec::with_capacity(handles.len());
    for (stage, handle) in stages.zip(handles) {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(stage_id = %stage.id, error = %e, "stage task aborted");
                let mut result = StageResult::new(stage.id.clone(), &stage.name, ExecutionStatus::Failed);
                result.error = Some(format!("stage task aborted: {e}"));
                result.finished_at = Some(Utc::now());
                results.push(result);
            }
        }
    }
    results
}

/// Run one stage of any kind to a terminal result.
///
/// Boxed because parallel stages recurse into their children.
fn execute_stage(
    stage: Stage,
    ctx: WorkflowContext,
    runtime: StageRuntime,
) -> BoxFuture<'static, StageResult> {
    async move {
        let started_at = Utc::now();
        runtime.emit(OrchestrationEvent::StageStarted {
            stage_id: stage.id.clone(),
        });
        debug!(stage_id = %stage.id, kind = stage.kind.name(), "stage started");

        let mut result = match &stage.kind {
            StageKind::Function(action) => run_action(&stage, action, ctx, &runtime).await,
            StageKind::Conditional { predicate, action } => {
                if predicate(&ctx) {
                    run_action(&stage, action, ctx, &runtime).await
                } else {
                    debug!(stage_id = %stage.id, "condition not met, skipping");
                    StageResult::skipped(stage.id.clone(), &stage.name)
                }
            }
            StageKind::Parallel {
                children,
                max_concurrency,
            } => run_children(&stage, children, *max_concurrency, ctx, &runtime).await,
        };
        result.started_at.get_or_insert(started_at);
        result.finished_at.get_or_insert_with(Utc::now);

        debug!(
            stage_id = %stage.id,
            status = %result.status,
            attempts = result.attempts,
            "stage finished"
        );
        runtime.emit(OrchestrationEvent::StageCompleted {
            stage_id: stage.id.clone(),
            status: result.status,
            attempts: result.attempts,
        });
        result
    }
    .boxed()
}

async fn run_action(
    stage: &Stage,
    action: &StageFn,
    ctx: WorkflowContext,
    runtime: &StageRuntime,
) -> StageResult {
    let outcome = run_with_retry(
        stage.id.as_str(),
        stage.retry_count,
        stage.timeout,
        &runtime.retry,
        None,
        |_| catch_panic("stage", || action(ctx.clone())),
    )
    .await;
    StageResult::from_outcome(stage.id.clone(), &stage.name, outcome)
}

/// Fan out over a parallel stage's children.
///
/// Children wait for a pool permit before starting. Under fail-fast, a
/// child that fails stops every sibling that has not started yet; siblings
/// already running finish normally.
async fn run_children(
    stage: &Stage,
    children: &[Stage],
    max_concurrency: Option<usize>,
    ctx: WorkflowContext,
    runtime: &StageRuntime,
) -> StageResult {
    let child_results = run_bounded(
        children,
        max_concurrency.unwrap_or(runtime.max_parallel),
        &ctx,
        runtime,
        "sibling stage failed",
    )
    .await;

    for (child, result) in children.iter().zip(&child_results) {
        child.run_hooks(result, &ctx);
    }

    let unsuccessful: Vec<&str> = child_results
        .iter()
        .filter(|r| !r.status.satisfies_dependency())
        .map(|r| r.id.as_str())
        .collect();

    let mut result = if unsuccessful.is_empty() {
        let outputs: Map<String, Value> = child_results
            .iter()
            .map(|r| (r.id.to_string(), r.output.clone()))
            .collect();
        let mut r = StageResult::new(stage.id.clone(), &stage.name, ExecutionStatus::Success);
        r.output = Value::Object(outputs);
        r
    } else {
        let mut r = StageResult::new(stage.id.clone(), &stage.name, ExecutionStatus::Failed);
        r.error = Some(format!("child stages did not succeed: {}", unsuccessful.join(", ")));
        r
    };
    result.attempts = 1;
    result.children = child_results;
    result
}
