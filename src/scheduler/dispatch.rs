//! The priority task scheduler.
//!
//! Submitted tasks wait in one FIFO queue per priority tier. A single
//! background loop scans the tiers, most urgent first, and dispatches queue
//! heads onto a bounded worker pool once their dependencies succeeded and the
//! allocator granted their resources. Workers retry failed attempts, release
//! their allocations and record a [`TaskResult`].
//!
//! Fairness comes from two rules. Each tier may dispatch at most its quota
//! per cycle, so a busy urgent tier cannot claim every free worker in one
//! cycle. And a tier that had an admissible head but got nothing for
//! `starvation_threshold` consecutive cycles is visited first in the next
//! one, so even `Background` work makes progress under sustained `Critical`
//! load. A head refused for lack of free workers, quota or resource
//! capacity counts as held back.

use super::priority::{Priority, TierQuotas};
use super::queue::PriorityQueues;
use super::task::{ScheduledTask, TaskContext};
use crate::core::{
    catch_panic, run_with_retry, ExecutionStatus, RetryPolicy, TaskId, TaskResult, WorkflowContext,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, OrchestrationEvent};
use crate::resource::{AllocationId, ResourceAllocator, ResourceRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default size of the worker pool.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default interval between scan cycles when nothing wakes the loop.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default number of empty-handed cycles before a tier jumps the order.
pub const DEFAULT_STARVATION_THRESHOLD: u32 = 3;

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub quotas: TierQuotas,
    pub starvation_threshold: u32,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            quotas: TierQuotas::default(),
            starvation_threshold: DEFAULT_STARVATION_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters since the scheduler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Scan cycles run by the dispatch loop or [`TaskScheduler::dispatch_cycle`].
    pub cycles: u64,
}

struct TaskEntry {
    task: ScheduledTask,
    status: ExecutionStatus,
    result: Option<TaskResult>,
    cancel: CancellationToken,
    started_at: Option<DateTime<Utc>>,
    /// Drop the entry as soon as the running task finishes.
    forgotten: bool,
}

impl TaskEntry {
    fn new(task: ScheduledTask) -> Self {
        Self {
            task,
            status: ExecutionStatus::Pending,
            result: None,
            cancel: CancellationToken::new(),
            started_at: None,
            forgotten: false,
        }
    }

    /// Settle a task that will never run.
    fn settle_unrun(&mut self, status: ExecutionStatus, reason: &str) {
        let mut result = TaskResult::new(self.task.id.clone(), &self.task.name, status);
        result.error = Some(reason.to_string());
        result.finished_at = Some(Utc::now());
        self.status = status;
        self.result = Some(result);
    }
}

#[derive(Default)]
struct State {
    queues: PriorityQueues,
    entries: HashMap<TaskId, TaskEntry>,
    running: usize,
    /// Consecutive cycles each tier held an admissible head but dispatched nothing.
    starved: [u32; 5],
    stats: SchedulerStats,
}

struct Shared {
    state: Mutex<State>,
    /// Wakes the dispatch loop early.
    wake: Notify,
    /// Signals waiters that some task reached a terminal status.
    settled: Notify,
    workers: Arc<Semaphore>,
    allocator: Arc<ResourceAllocator>,
    config: SchedulerConfig,
    events: EventBus,
}

/// Everything a worker needs, taken while the state lock is held.
struct Launch {
    task: ScheduledTask,
    inputs: WorkflowContext,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
    allocations: Vec<AllocationId>,
}

enum Admission {
    Ready,
    Waiting,
    Blocked(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Priority-tiered scheduler with resource-gated admission.
///
/// # Example
///
/// ```no_run
/// use flowcore::resource::ResourceAllocator;
/// use flowcore::scheduler::{Priority, ScheduledTask, SchedulerConfig, TaskScheduler};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn demo() -> flowcore::Result<()> {
/// let scheduler = TaskScheduler::new(SchedulerConfig::default(), Arc::new(ResourceAllocator::new()));
/// scheduler.start();
/// let id = scheduler.submit_task(
///     ScheduledTask::new("reindex", |_| async { Ok(serde_json::json!("ok")) })
///         .with_priority(Priority::High),
/// )?;
/// let results = scheduler.wait_for_completion(&[id], Duration::from_secs(5)).await?;
/// assert!(results[0].is_success());
/// scheduler.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct TaskScheduler {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, allocator: Arc<ResourceAllocator>) -> Self {
        Self::with_events(config, allocator, EventBus::default())
    }

    /// Create a scheduler publishing dispatch and completion events on `events`.
    pub fn with_events(
        config: SchedulerConfig,
        allocator: Arc<ResourceAllocator>,
        events: EventBus,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                settled: Notify::new(),
                workers,
                allocator,
                config,
                events,
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    // ========== Lifecycle ==========

    /// Spawn the dispatch loop. Calling it again while running does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), shutdown.clone()));
        *lifecycle = Some((shutdown, handle));
        info!(
            max_workers = self.shared.config.max_workers,
            poll_interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            "scheduler started"
        );
    }

    /// Stop the dispatch loop and wait for it to exit.
    ///
    /// Running tasks finish on their own; queued tasks stay pending.
    pub async fn stop(&self) -> Result<()> {
        let running = lock(&self.lifecycle).take();
        let Some((shutdown, handle)) = running else {
            return Ok(());
        };
        shutdown.cancel();
        handle.await.map_err(|e| Error::TaskJoin(e.to_string()))?;
        info!("scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.lifecycle).is_some()
    }

    // ========== Submission & Cancellation ==========

    /// Queue a task in its priority tier.
    ///
    /// # Errors
    /// `Error::DuplicateTask` if a task with the same id was ever submitted.
    pub fn submit_task(&self, task: ScheduledTask) -> Result<TaskId> {
        let id = task.id.clone();
        let priority = task.priority;
        {
            let mut state = lock(&self.shared.state);
            if state.entries.contains_key(&id) {
                return Err(Error::DuplicateTask(id.to_string()));
            }
            state.queues.push(priority, id.clone());
            state.entries.insert(id.clone(), TaskEntry::new(task));
            state.stats.submitted += 1;
        }
        debug!(task_id = %id, priority = %priority, "task submitted");
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancel a task.
    ///
    /// A pending task is cancelled at once and never runs. A running task
    /// only has its cancellation token fired; it keeps running until its
    /// logic returns. Returns `false` for tasks already terminal.
    ///
    /// # Errors
    /// `Error::TaskNotFound` for an unknown id.
    pub fn cancel_task(&self, id: &str) -> Result<bool> {
        let dequeued = {
            let mut guard = lock(&self.shared.state);
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(id) else {
                return Err(Error::TaskNotFound(id.to_string()));
            };
            match entry.status {
                ExecutionStatus::Pending => {
                    entry.settle_unrun(ExecutionStatus::Cancelled, "cancelled before dispatch");
                    state.queues.remove(&entry.task.id);
                    state.stats.cancelled += 1;
                    true
                }
                ExecutionStatus::Running => {
                    entry.cancel.cancel();
                    false
                }
                _ => return Ok(false),
            }
        };

        if dequeued {
            info!(task_id = id, "pending task cancelled");
            self.shared.events.emit(OrchestrationEvent::TaskCompleted {
                task_id: TaskId::new(id),
                status: ExecutionStatus::Cancelled,
            });
            self.shared.wake.notify_one();
            self.shared.settled.notify_waiters();
        } else {
            info!(task_id = id, "cancellation requested for running task");
        }
        Ok(true)
    }

    /// Drop the listed tasks and their results.
    ///
    /// Terminal tasks go at once and pending ones are dequeued without
    /// running. A running task is dropped when it finishes. Returns how many
    /// entries were removed now. Forget whole runs: a task still waiting on
    /// a forgotten dependency never becomes ready.
    pub fn forget(&self, ids: &[TaskId]) -> usize {
        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        let mut removed = 0;
        for id in ids {
            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };
            match entry.status {
                ExecutionStatus::Running => entry.forgotten = true,
                ExecutionStatus::Pending => {
                    state.queues.remove(id);
                    state.entries.remove(id);
                    state.stats.cancelled += 1;
                    removed += 1;
                }
                _ => {
                    state.entries.remove(id);
                    removed += 1;
                }
            }
        }
        debug!(requested = ids.len(), removed, "tasks forgotten");
        removed
    }

    // ========== Queries ==========

    pub fn get_task_status(&self, id: &str) -> Option<ExecutionStatus> {
        lock(&self.shared.state).entries.get(id).map(|e| e.status)
    }

    /// Result of a task, once it reached a terminal status.
    pub fn get_task_result(&self, id: &str) -> Option<TaskResult> {
        lock(&self.shared.state)
            .entries
            .get(id)
            .and_then(|e| e.result.clone())
    }

    pub fn queue_depths(&self) -> Vec<(Priority, usize)> {
        lock(&self.shared.state).queues.depths()
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.shared.state).queues.len()
    }

    pub fn running_count(&self) -> usize {
        lock(&self.shared.state).running
    }

    /// Tasks the scheduler still holds, whatever their status.
    pub fn task_count(&self) -> usize {
        lock(&self.shared.state).entries.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        lock(&self.shared.state).stats
    }

    /// Wait until every listed task reached a terminal status.
    ///
    /// Results come back in the order of `ids`.
    ///
    /// # Errors
    /// `Error::TaskNotFound` for an unknown id, `Error::SchedulerNotRunning`
    /// if a listed task is still queued while the loop is stopped, and
    /// `Error::Timeout` if `timeout` elapses first.
    pub async fn wait_for_completion(
        &self,
        ids: &[TaskId],
        timeout: Duration,
    ) -> Result<Vec<TaskResult>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.shared.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if let Some(results) = self.collect_results(ids)? {
                return Ok(results);
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                return Err(Error::Timeout(timeout));
            }
        }
    }

    fn collect_results(&self, ids: &[TaskId]) -> Result<Option<Vec<TaskResult>>> {
        let state = lock(&self.shared.state);
        let mut results = Vec::with_capacity(ids.len());
        let mut queued = false;
        for id in ids {
            let entry = state
                .entries
                .get(id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            match &entry.result {
                Some(result) if entry.status.is_terminal() => results.push(result.clone()),
                _ => queued |= entry.status == ExecutionStatus::Pending,
            }
        }
        if results.len() == ids.len() {
            return Ok(Some(results));
        }
        drop(state);
        if queued && !self.is_running() {
            return Err(Error::SchedulerNotRunning);
        }
        Ok(None)
    }

    /// Run one scan cycle now. Returns how many tasks were dispatched.
    ///
    /// The dispatch loop calls this on every wake-up; it is public so
    /// callers can step a stopped scheduler deterministically.
    pub fn dispatch_cycle(&self) -> usize {
        dispatch_cycle(&self.shared)
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some((shutdown, _)) = lock(&self.lifecycle).take() {
            shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn dispatch_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        dispatch_cycle(&shared);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
        }
    }
    debug!("dispatch loop exited");
}

fn dependency_admission(entries: &HashMap<TaskId, TaskEntry>, task: &ScheduledTask) -> Admission {
    for dep in &task.depends_on {
        match entries.get(dep).map(|e| e.status) {
            Some(status) if status.satisfies_dependency() => {}
            Some(status) if status.blocks_dependents() => {
                return Admission::Blocked(format!("dependency '{}' {}", dep, status));
            }
            _ => return Admission::Waiting,
        }
    }
    Admission::Ready
}

/// Whether some request can never be granted, even with the resource idle.
fn exceeds_capacity(allocator: &ResourceAllocator, requests: &[ResourceRequest]) -> bool {
    requests.iter().any(|r| {
        allocator
            .get_usage(&r.resource_id)
            .map_or(true, |usage| r.amount > usage.capacity)
    })
}

/// The task's own context plus the output of each dependency.
fn gather_inputs(entries: &HashMap<TaskId, TaskEntry>, task: &ScheduledTask) -> WorkflowContext {
    let mut inputs = task.context.clone();
    for dep in &task.depends_on {
        if let Some(result) = entries.get(dep).and_then(|e| e.result.as_ref()) {
            inputs.insert(dep.as_str(), result.output.clone());
        }
    }
    inputs
}

fn dispatch_cycle(shared: &Arc<Shared>) -> usize {
    let mut launches = Vec::new();
    let mut settled: Vec<(TaskId, ExecutionStatus)> = Vec::new();
    {
        let mut guard = lock(&shared.state);
        let state = &mut *guard;
        state.stats.cycles += 1;

        let threshold = shared.config.starvation_threshold;
        let mut order = Priority::ALL;
        order.sort_by_key(|p| (state.starved[p.index()] < threshold, *p));

        for priority in order {
            let quota = shared.config.quotas.quota(priority);
            let mut dispatched = 0;
            let mut held_back = false;

            while let Some(head) = state.queues.front(priority).cloned() {
                let admission = state
                    .entries
                    .get(&head)
                    .map(|entry| dependency_admission(&state.entries, &entry.task));
                match admission {
                    None => {
                        state.queues.pop_front(priority);
                        continue;
                    }
                    Some(Admission::Blocked(reason)) => {
                        state.queues.pop_front(priority);
                        if let Some(entry) = state.entries.get_mut(&head) {
                            entry.settle_unrun(ExecutionStatus::Cancelled, &reason);
                        }
                        state.stats.cancelled += 1;
                        debug!(task_id = %head, reason = %reason, "task cancelled");
                        settled.push((head, ExecutionStatus::Cancelled));
                        continue;
                    }
                    Some(Admission::Waiting) => break,
                    Some(Admission::Ready) => {}
                }

                if dispatched >= quota {
                    held_back = true;
                    break;
                }
                let Ok(permit) = Arc::clone(&shared.workers).try_acquire_owned() else {
                    held_back = true;
                    break;
                };

                let requests = state
                    .entries
                    .get(&head)
                    .map(|e| e.task.resources.clone())
                    .unwrap_or_default();
                let allocations = if requests.is_empty() {
                    Vec::new()
                } else {
                    match shared.allocator.allocate_many(head.as_str(), &requests) {
                        Ok(granted) => granted.into_iter().map(|a| a.id).collect(),
                        Err(e) => {
                            drop(permit);
                            let permanent = !matches!(e, Error::InsufficientCapacity { .. })
                                || exceeds_capacity(&shared.allocator, &requests);
                            if !permanent {
                                held_back = true;
                                break;
                            }
                            state.queues.pop_front(priority);
                            if let Some(entry) = state.entries.get_mut(&head) {
                                entry.settle_unrun(ExecutionStatus::Failed, &e.to_string());
                            }
                            state.stats.failed += 1;
                            warn!(task_id = %head, error = %e, "task can never be admitted");
                            settled.push((head, ExecutionStatus::Failed));
                            continue;
                        }
                    }
                };

                state.queues.pop_front(priority);
                let Some(task) = state.entries.get(&head).map(|e| e.task.clone()) else {
                    continue;
                };
                let inputs = gather_inputs(&state.entries, &task);
                let Some(entry) = state.entries.get_mut(&head) else {
                    continue;
                };
                entry.status = ExecutionStatus::Running;
                entry.started_at = Some(Utc::now());
                launches.push(Launch {
                    task,
                    inputs,
                    cancel: entry.cancel.clone(),
                    permit,
                    allocations,
                });
                state.running += 1;
                state.stats.dispatched += 1;
                dispatched += 1;
            }

            let starved = &mut state.starved[priority.index()];
            if dispatched > 0 {
                *starved = 0;
            } else if held_back {
                *starved += 1;
            }
        }
    }

    let count = launches.len();
    for launch in launches {
        debug!(task_id = %launch.task.id, priority = %launch.task.priority, "task dispatched");
        shared.events.emit(OrchestrationEvent::TaskDispatched {
            task_id: launch.task.id.clone(),
            priority: launch.task.priority.to_string(),
        });
        tokio::spawn(run_task(Arc::clone(shared), launch));
    }
    if !settled.is_empty() {
        for (task_id, status) in settled {
            shared
                .events
                .emit(OrchestrationEvent::TaskCompleted { task_id, status });
        }
        shared.settled.notify_waiters();
    }
    count
}

async fn run_task(shared: Arc<Shared>, launch: Launch) {
    let Launch {
        task,
        inputs,
        cancel,
        permit,
        allocations,
    } = launch;

    let outcome = run_with_retry(
        task.id.as_str(),
        task.retry_count,
        task.timeout,
        &shared.config.retry,
        Some(&cancel),
        |attempt| {
            catch_panic("task", || {
                (task.action)(TaskContext {
                    task_id: task.id.clone(),
                    attempt,
                    inputs: inputs.clone(),
                    cancellation: cancel.clone(),
                })
            })
        },
    )
    .await;

    for allocation in &allocations {
        if let Err(e) = shared.allocator.release(allocation) {
            warn!(task_id = %task.id, allocation = %allocation.short(), error = %e, "release failed");
        }
    }
    drop(permit);

    let mut result = TaskResult::from_outcome(task.id.clone(), &task.name, outcome);
    let status = result.status;
    debug!(task_id = %task.id, status = %status, "task finished");

    // Published before the result becomes visible, so anyone who observes a
    // terminal status has also seen its event delivered.
    shared.events.emit(OrchestrationEvent::TaskCompleted {
        task_id: task.id.clone(),
        status,
    });
    {
        let mut state = lock(&shared.state);
        if state.entries.get(&task.id).is_some_and(|e| e.forgotten) {
            state.entries.remove(&task.id);
        } else if let Some(entry) = state.entries.get_mut(&task.id) {
            result.started_at = entry.started_at;
            entry.status = status;
            entry.result = Some(result);
        }
        state.running = state.running.saturating_sub(1);
        match status {
            ExecutionStatus::Success => state.stats.succeeded += 1,
            ExecutionStatus::Cancelled => state.stats.cancelled += 1,
            _ => state.stats.failed += 1,
        }
    }
    shared.wake.notify_one();
    shared.settled.notify_waiters();
}
