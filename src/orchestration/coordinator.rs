//! The orchestration coordinator.
//!
//! [`Coordinator`] is the top-level entry point: it owns the resource
//! allocator, the task scheduler and the event bus, keeps track of sessions,
//! and routes each workflow run to the pipeline executor or the scheduler
//! according to the session's [`ExecutionMode`].

use super::health::{
    ComponentHealth, ComponentStatus, FailureWindow, HealthConfig, HealthStatus,
};
use super::metrics::OrchestrationMetrics;
use super::repository::{InMemoryWorkflowRepository, WorkflowRepository};
use super::session::{
    ExecutionMode, Session, SessionId, SessionRegistry, SessionState, FINISHED_SESSION_HISTORY,
};
use super::workflow::WorkflowDefinition;
use crate::config::Config;
use crate::core::{ExecutionResult, ExecutionStatus, TaskId, WorkflowContext};
use crate::events::{EventBus, EventType, OrchestrationEvent};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::resource::ResourceAllocator;
use crate::scheduler::TaskScheduler;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow: String,
    pub session_id: SessionId,
    pub mode: ExecutionMode,
    /// `Success` when every unit succeeded or was skipped, else `Failed`.
    pub status: ExecutionStatus,
    /// One result per unit. Pipeline modes list them in execution order,
    /// scheduler modes in topological order.
    pub units: Vec<ExecutionResult>,
    /// The params under `"params"` plus each successful unit's output.
    pub context: WorkflowContext,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn unit(&self, id: &str) -> Option<&ExecutionResult> {
        self.units.iter().find(|r| r.id.as_str() == id)
    }

    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.units.iter().filter(|r| r.status == status).count()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// What a pipeline or scheduler run hands back to `execute_workflow`.
struct RunOutcome {
    status: ExecutionStatus,
    units: Vec<ExecutionResult>,
    context: WorkflowContext,
    error: Option<String>,
}

impl RunOutcome {
    /// Nothing ran because the graph is invalid.
    fn rejected(definition: &WorkflowDefinition, context: WorkflowContext, reason: String) -> Self {
        let units = definition
            .units
            .iter()
            .map(|u| ExecutionResult::cancelled(u.id.clone(), &u.name, &reason))
            .collect();
        Self {
            status: ExecutionStatus::Failed,
            units,
            context,
            error: Some(reason),
        }
    }
}

/// Top-level orchestration facade.
///
/// Constructed explicitly and shared as `Arc<Coordinator>`; there is no
/// global instance.
///
/// # Example
///
/// ```no_run
/// use flowcore::config::Config;
/// use flowcore::orchestration::{Coordinator, ExecutionMode, WorkUnit, WorkflowDefinition};
/// use serde_json::json;
///
/// # async fn example() -> flowcore::Result<()> {
/// let coordinator = Coordinator::new(Config::default());
/// coordinator.register_workflow(
///     WorkflowDefinition::new("greet")
///         .unit(WorkUnit::new("hello", |ctx| async move {
///             Ok(json!(format!("hello {}", ctx.param("who").cloned().unwrap_or_default())))
///         })),
/// )?;
///
/// let session = coordinator.create_session(ExecutionMode::Sequential);
/// let result = coordinator
///     .execute_workflow("greet", json!({"who": "world"}), &session)
///     .await?;
/// assert!(result.is_success());
/// coordinator.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Coordinator {
    config: Config,
    health: HealthConfig,
    repository: Arc<dyn WorkflowRepository>,
    allocator: Arc<ResourceAllocator>,
    scheduler: TaskScheduler,
    events: EventBus,
    sessions: Mutex<SessionRegistry>,
    outcomes: Mutex<FailureWindow>,
    metrics: Mutex<OrchestrationMetrics>,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self::with_repository(config, Arc::new(InMemoryWorkflowRepository::new()))
    }

    pub fn with_repository(config: Config, repository: Arc<dyn WorkflowRepository>) -> Self {
        let allocator = Arc::new(ResourceAllocator::new());
        let events = EventBus::default();
        let scheduler = TaskScheduler::with_events(
            config.scheduler_config(),
            Arc::clone(&allocator),
            events.clone(),
        );
        let health = config.health_config();
        Self {
            outcomes: Mutex::new(FailureWindow::new(health.failure_window)),
            health,
            config,
            repository,
            allocator,
            scheduler,
            events,
            sessions: Mutex::new(SessionRegistry::new(FINISHED_SESSION_HISTORY)),
            metrics: Mutex::new(OrchestrationMetrics::default()),
        }
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register resources here to have resource-aware runs enforce them.
    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn repository(&self) -> &Arc<dyn WorkflowRepository> {
        &self.repository
    }

    pub fn metrics(&self) -> OrchestrationMetrics {
        *lock(&self.metrics)
    }

    // ========== Registration ==========

    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.repository.create(definition)
    }

    /// Call `handler` for every event of `event_type`.
    pub fn register_event_handler<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&OrchestrationEvent) + Send + Sync + 'static,
    {
        self.events.register(event_type, handler);
    }

    // ========== Sessions ==========

    pub fn create_session(&self, mode: ExecutionMode) -> Session {
        let session = Session::new(mode);
        lock(&self.sessions).insert(session.id);
        info!(session_id = %session.id.short(), mode = %mode, "session created");
        session
    }

    /// State of a live session or of one of the most recently finished.
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        lock(&self.sessions).get(id)
    }

    /// Sessions created or running.
    pub fn live_sessions(&self) -> usize {
        lock(&self.sessions).live_count()
    }

    fn transition(&self, id: SessionId, target: SessionState) -> Result<()> {
        lock(&self.sessions)
            .transition(id, target)
            .map_err(|found| Error::InvalidSessionState {
                expected: match target {
                    SessionState::Running => SessionState::Created.to_string(),
                    _ => SessionState::Running.to_string(),
                },
                found: found.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
            })
    }

    // ========== Execution ==========

    /// Run a registered workflow in `session`.
    ///
    /// `params` are placed in the initial context under `"params"`. Unit
    /// failures, timeouts and invalid graphs are reported inside the
    /// returned [`WorkflowResult`].
    ///
    /// # Errors
    /// `Error::WorkflowNotFound` for an unknown name and
    /// `Error::InvalidSessionState` unless the session is freshly created.
    pub async fn execute_workflow(
        &self,
        name: &str,
        params: Value,
        session: &Session,
    ) -> Result<WorkflowResult> {
        let definition = self
            .repository
            .get(name)?
            .ok_or_else(|| Error::WorkflowNotFound(name.to_string()))?;
        self.transition(session.id, SessionState::Running)?;
        lock(&self.metrics).record_start();

        let session_label = session.id.short();
        info!(
            workflow = %name,
            session_id = %session_label,
            mode = %session.mode,
            units = definition.units.len(),
            "workflow started"
        );
        self.events.emit(OrchestrationEvent::WorkflowStarted {
            workflow: name.to_string(),
            session_id: session.id.to_string(),
            mode: session.mode.to_string(),
        });

        let started_at = Utc::now();
        let context = WorkflowContext::with_params(params);
        let outcome = match session.mode {
            ExecutionMode::Sequential | ExecutionMode::Parallel => {
                self.run_pipeline(&definition, session.mode, context).await
            }
            ExecutionMode::Priority | ExecutionMode::ResourceAware => {
                self.run_scheduled(&definition, session, context).await
            }
        };

        let result = WorkflowResult {
            workflow: name.to_string(),
            session_id: session.id,
            mode: session.mode,
            status: outcome.status,
            units: outcome.units,
            context: outcome.context,
            started_at,
            finished_at: Utc::now(),
            error: outcome.error,
        };
        self.finish(&result)?;
        Ok(result)
    }

    fn finish(&self, result: &WorkflowResult) -> Result<()> {
        let success = result.is_success();
        let duration = result.duration();
        lock(&self.outcomes).record(success);
        lock(&self.metrics).record_finish(success, duration);

        let target = if success {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        self.transition(result.session_id, target)?;

        if success {
            info!(
                workflow = %result.workflow,
                session_id = %result.session_id.short(),
                duration_ms = duration.as_millis() as u64,
                "workflow completed"
            );
            self.events.emit(OrchestrationEvent::WorkflowCompleted {
                workflow: result.workflow.clone(),
                session_id: result.session_id.to_string(),
                duration_ms: duration.as_millis() as u64,
            });
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "workflow did not succeed".to_string());
            warn!(
                workflow = %result.workflow,
                session_id = %result.session_id.short(),
                error = %error,
                "workflow failed"
            );
            self.events.emit(OrchestrationEvent::WorkflowFailed {
                workflow: result.workflow.clone(),
                session_id: result.session_id.to_string(),
                error,
            });
        }
        Ok(())
    }

    async fn run_pipeline(
        &self,
        definition: &WorkflowDefinition,
        mode: ExecutionMode,
        context: WorkflowContext,
    ) -> RunOutcome {
        let config = PipelineConfig {
            level_parallel: mode == ExecutionMode::Parallel,
            ..self.config.pipeline_config()
        };
        let pipeline = definition.units.iter().fold(
            Pipeline::new(&definition.name)
                .with_config(config)
                .with_events(self.events.clone()),
            |pipeline, unit| pipeline.stage(unit.to_stage()),
        );

        let run = pipeline.run(context).await;
        RunOutcome {
            status: run.status,
            units: run.stages,
            context: run.context,
            error: run.error,
        }
    }

    async fn run_scheduled(
        &self,
        definition: &WorkflowDefinition,
        session: &Session,
        context: WorkflowContext,
    ) -> RunOutcome {
        let dag = definition.dag();
        let order = match dag.validate().and_then(|_| dag.topological_sort()) {
            Ok(order) => order,
            Err(e) => {
                warn!(workflow = %definition.name, error = %e, "workflow graph rejected");
                return RunOutcome::rejected(definition, context, e.to_string());
            }
        };

        self.scheduler.start();
        let namespace = session.id.to_string();
        let units: HashMap<&TaskId, _> = definition.units.iter().map(|u| (&u.id, u)).collect();

        // Topological order keeps every dependency ahead of its dependents
        // within a tier, which head-of-line dispatch relies on.
        let mut submitted = Vec::with_capacity(order.len());
        for id in &order {
            let Some(unit) = units.get(id) else { continue };
            let mut task = unit.to_task(&namespace, context.clone());
            if session.mode == ExecutionMode::Priority {
                task.resources.clear();
            }
            match self.scheduler.submit_task(task) {
                Ok(task_id) => submitted.push((task_id, *unit)),
                Err(e) => {
                    self.cancel_all(&submitted);
                    let ids: Vec<TaskId> = submitted.into_iter().map(|(id, _)| id).collect();
                    self.scheduler.forget(&ids);
                    return RunOutcome::rejected(definition, context, e.to_string());
                }
            }
        }

        let ids: Vec<TaskId> = submitted.iter().map(|(id, _)| id.clone()).collect();
        let timeout = self.config.workflow_timeout();
        let (results, aborted) = match self.scheduler.wait_for_completion(&ids, timeout).await {
            Ok(results) => (results, None),
            Err(e) => {
                warn!(workflow = %definition.name, error = %e, "scheduled workflow aborted");
                self.cancel_all(&submitted);
                let reason = e.to_string();
                let partial = submitted
                    .iter()
                    .map(|(id, unit)| {
                        self.scheduler
                            .get_task_result(id.as_str())
                            .unwrap_or_else(|| ExecutionResult::cancelled(id.clone(), &unit.name, &reason))
                    })
                    .collect();
                (partial, Some(reason))
            }
        };

        // Results are copied out; the scheduler need not keep this run.
        self.scheduler.forget(&ids);

        let mut context = context;
        let mut first_failure = None;
        let mut units_out = Vec::with_capacity(results.len());
        for (mut result, (_, unit)) in results.into_iter().zip(&submitted) {
            result.id = unit.id.clone();
            if result.is_success() {
                context.insert(unit.id.as_str(), result.output.clone());
            } else if result.status == ExecutionStatus::Failed && first_failure.is_none() {
                first_failure = Some(format!(
                    "unit '{}' failed: {}",
                    unit.id,
                    result.error.as_deref().unwrap_or("unknown error")
                ));
            }
            units_out.push(result);
        }

        let all_ok = aborted.is_none() && units_out.iter().all(|r| r.status.satisfies_dependency());
        debug!(
            workflow = %definition.name,
            units = units_out.len(),
            success = all_ok,
            "scheduled workflow settled"
        );
        RunOutcome {
            status: if all_ok {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            },
            units: units_out,
            context,
            error: aborted.or(first_failure),
        }
    }

    fn cancel_all(&self, submitted: &[(TaskId, &super::WorkUnit)]) {
        for (id, _) in submitted {
            if let Err(e) = self.scheduler.cancel_task(id.as_str()) {
                debug!(task_id = %id, error = %e, "cancel skipped");
            }
        }
    }

    // ========== Health ==========

    pub fn get_health_status(&self) -> HealthStatus {
        let queue_depths: BTreeMap<String, usize> = self
            .scheduler
            .queue_depths()
            .into_iter()
            .map(|(priority, depth)| (priority.to_string(), depth))
            .collect();
        let queued: usize = queue_depths.values().sum();
        let running_tasks = self.scheduler.running_count();
        let allocator_utilization = self.allocator.utilization();
        let recent_failure_rate = lock(&self.outcomes).failure_rate();
        let active_sessions = self.live_sessions();

        let scheduler = if self.scheduler.is_running() {
            ComponentHealth::healthy("scheduler")
        } else if queued > 0 {
            ComponentHealth::with_status(
                "scheduler",
                ComponentStatus::Down,
                format!("stopped with {} queued tasks", queued),
            )
        } else {
            ComponentHealth::with_status("scheduler", ComponentStatus::Healthy, "idle".to_string())
        };

        let allocator = if allocator_utilization >= self.health.utilization_warning {
            ComponentHealth::with_status(
                "allocator",
                ComponentStatus::Degraded,
                format!("utilization {:.0}%", allocator_utilization * 100.0),
            )
        } else {
            ComponentHealth::healthy("allocator")
        };

        let failing = recent_failure_rate > self.health.failure_rate_threshold;
        let workflows = if failing {
            ComponentHealth::with_status(
                "workflows",
                ComponentStatus::Degraded,
                format!("recent failure rate {:.0}%", recent_failure_rate * 100.0),
            )
        } else {
            ComponentHealth::healthy("workflows")
        };

        let components = vec![scheduler, allocator, workflows];
        let healthy = !failing && components.iter().all(|c| c.status != ComponentStatus::Down);
        HealthStatus {
            healthy,
            checked_at: Utc::now(),
            components,
            queue_depths,
            running_tasks,
            allocator_utilization,
            recent_failure_rate,
            active_sessions,
        }
    }

    // ========== Lifecycle ==========

    /// Stop the scheduler's dispatch loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await?;
        info!("coordinator shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("scheduler", &self.scheduler)
            .field("sessions", &self.live_sessions())
            .finish_non_exhaustive()
    }
}
