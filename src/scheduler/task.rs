//! Tasks submitted to the scheduler.

use super::priority::Priority;
use crate::core::{DagNode, TaskId, WorkflowContext};
use crate::resource::ResourceRequest;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a task's logic receives on each attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// 0-based attempt number.
    pub attempt: u32,
    /// The task's own context plus the output of each dependency, keyed by
    /// the dependency's id.
    pub inputs: WorkflowContext,
    /// Fires when the task is cancelled while running. Observing it is up
    /// to the task; the scheduler lets the attempt finish regardless.
    pub cancellation: CancellationToken,
}

/// Future returned by a task's logic.
pub type TaskFuture = BoxFuture<'static, std::result::Result<Value, String>>;

/// Work performed by a scheduled task.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// A unit of work for the [`TaskScheduler`](super::TaskScheduler).
#[derive(Clone)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
    pub depends_on: Vec<TaskId>,
    /// Capacity that must be granted, all at once, before the task starts.
    pub resources: Vec<ResourceRequest>,
    pub retry_count: u32,
    pub timeout: Option<Duration>,
    /// Initial inputs handed to the task.
    pub context: WorkflowContext,
    pub(crate) action: TaskFn,
}

impl ScheduledTask {
    pub fn new<F, Fut>(id: &str, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        Self::from_fn(id, Arc::new(move |ctx| f(ctx).boxed()))
    }

    pub fn from_fn(id: &str, action: TaskFn) -> Self {
        Self {
            id: TaskId::new(id),
            name: id.to_string(),
            priority: Priority::default(),
            depends_on: Vec::new(),
            resources: Vec::new(),
            retry_count: 0,
            timeout: None,
            context: WorkflowContext::new(),
            action,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| TaskId::new(*d)).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_resource(mut self, resource_id: &str, amount: u64) -> Self {
        self.resources.push(ResourceRequest::new(resource_id, amount));
        self
    }

    pub fn with_resources(mut self, resources: Vec<ResourceRequest>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: WorkflowContext) -> Self {
        self.context = context;
        self
    }
}

impl DagNode for ScheduledTask {
    fn node_id(&self) -> &TaskId {
        &self.id
    }

    fn node_dependencies(&self) -> &[TaskId] {
        &self.depends_on
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .field("resources", &self.resources)
            .field("retry_count", &self.retry_count)
            .field("timeout", &self.timeout)
            .finish()
    }
}
