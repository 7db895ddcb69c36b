//! Stage definitions.

use crate::core::{DagNode, ExecutionStatus, StageResult, TaskId, WorkflowContext};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by a stage's logic.
pub type StageFuture = BoxFuture<'static, std::result::Result<Value, String>>;

/// Work performed by a stage. Receives a snapshot of the run context.
pub type StageFn = Arc<dyn Fn(WorkflowContext) -> StageFuture + Send + Sync>;

/// Decides whether a conditional stage runs.
pub type Predicate = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// Callback fired after a stage reaches a terminal status.
pub type StageHook = Arc<dyn Fn(&StageResult, &WorkflowContext) + Send + Sync>;

/// Wrap an async closure as a [`StageFn`].
pub fn stage_fn<F, Fut>(f: F) -> StageFn
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// What a stage does when it runs.
#[derive(Clone)]
pub enum StageKind {
    /// Invoke the function once per attempt.
    Function(StageFn),
    /// Evaluate the predicate; run the action if it holds, skip otherwise.
    Conditional { predicate: Predicate, action: StageFn },
    /// Run the children concurrently. Children are independent of each
    /// other; their own `depends_on` lists are ignored.
    Parallel {
        children: Vec<Stage>,
        max_concurrency: Option<usize>,
    },
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Function(_) => "function",
            StageKind::Conditional { .. } => "conditional",
            StageKind::Parallel { .. } => "parallel",
        }
    }
}

/// A unit of a pipeline.
#[derive(Clone)]
pub struct Stage {
    pub id: TaskId,
    pub name: String,
    pub depends_on: Vec<TaskId>,
    /// Extra attempts after the first failure.
    pub retry_count: u32,
    /// Bound on each attempt. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub kind: StageKind,
    pub(crate) on_success: Option<StageHook>,
    pub(crate) on_failure: Option<StageHook>,
}

impl Stage {
    fn with_kind(id: &str, kind: StageKind) -> Self {
        Self {
            id: TaskId::new(id),
            name: id.to_string(),
            depends_on: Vec::new(),
            retry_count: 0,
            timeout: None,
            kind,
            on_success: None,
            on_failure: None,
        }
    }

    /// A stage that runs an async function.
    pub fn function<F, Fut>(id: &str, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        Self::with_kind(id, StageKind::Function(stage_fn(f)))
    }

    /// A stage built from an existing [`StageFn`].
    pub fn from_fn(id: &str, action: StageFn) -> Self {
        Self::with_kind(id, StageKind::Function(action))
    }

    /// A stage that only runs when `predicate` holds for the context it
    /// receives; otherwise it is recorded as skipped.
    pub fn conditional<P, F, Fut>(id: &str, predicate: P, f: F) -> Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        Self::with_kind(
            id,
            StageKind::Conditional {
                predicate: Arc::new(predicate),
                action: stage_fn(f),
            },
        )
    }

    /// A stage that fans out over `children`.
    pub fn parallel(id: &str, children: Vec<Stage>) -> Self {
        Self::with_kind(
            id,
            StageKind::Parallel {
                children,
                max_concurrency: None,
            },
        )
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| TaskId::new(*d)).collect();
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

    /// Bound how many children of a parallel stage run at once.
    /// Has no effect on other kinds.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        if let StageKind::Parallel {
            max_concurrency, ..
        } = &mut self.kind
        {
            *max_concurrency = Some(limit.max(1));
        }
        self
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StageResult, &WorkflowContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StageResult, &WorkflowContext) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    /// Fire `on_success` for a successful run, `on_failure` for a failed one.
    /// Skipped and cancelled stages fire neither.
    pub(crate) fn run_hooks(&self, result: &StageResult, ctx: &WorkflowContext) {
        let hook = match result.status {
            ExecutionStatus::Success => self.on_success.as_ref(),
            ExecutionStatus::Failed => self.on_failure.as_ref(),
            _ => None,
        };
        if let Some(hook) = hook {
            hook(result, ctx);
        }
    }
}

impl DagNode for Stage {
    fn node_id(&self) -> &TaskId {
        &self.id
    }

    fn node_dependencies(&self) -> &[TaskId] {
        &self.depends_on
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Stage");
        s.field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("depends_on", &self.depends_on)
            .field("retry_count", &self.retry_count)
            .field("timeout", &self.timeout);
        if let StageKind::Parallel { children, .. } = &self.kind {
            s.field("children", children);
        }
        s.finish()
    }
}
