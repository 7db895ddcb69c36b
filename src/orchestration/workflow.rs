//! Workflow definitions handed to the coordinator.
//!
//! A workflow is a named set of [`WorkUnit`]s. The same definition runs
//! through the pipeline executor or the scheduler depending on the session
//! mode, so a unit carries both the pipeline view (retries, timeout) and the
//! scheduler view (priority, resource requests) of the work.

use crate::core::{DagNode, TaskDag, TaskId, WorkflowContext};
use crate::pipeline::{stage_fn, Stage, StageFn};
use crate::resource::ResourceRequest;
use crate::scheduler::{Priority, ScheduledTask};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One step of a workflow.
#[derive(Clone)]
pub struct WorkUnit {
    pub id: TaskId,
    pub name: String,
    pub depends_on: Vec<TaskId>,
    pub retry_count: u32,
    pub timeout: Option<Duration>,
    /// Used by the priority and resource-aware modes.
    pub priority: Priority,
    /// Enforced only in resource-aware mode.
    pub resources: Vec<ResourceRequest>,
    pub action: StageFn,
}

impl WorkUnit {
    pub fn new<F, Fut>(id: &str, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        Self {
            id: TaskId::new(id),
            name: id.to_string(),
            depends_on: Vec::new(),
            retry_count: 0,
            timeout: None,
            priority: Priority::default(),
            resources: Vec::new(),
            action: stage_fn(f),
        }
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

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resource(mut self, resource_id: &str, amount: u64) -> Self {
        self.resources.push(ResourceRequest::new(resource_id, amount));
        self
    }

    /// The unit as a pipeline stage.
    pub fn to_stage(&self) -> Stage {
        let mut stage = Stage::from_fn(self.id.as_str(), Arc::clone(&self.action))
            .with_name(&self.name)
            .with_retries(self.retry_count);
        stage.depends_on = self.depends_on.clone();
        stage.timeout = self.timeout;
        stage
    }

    /// The unit as a scheduler task with its id and dependencies prefixed
    /// by `namespace`, so concurrent runs of one workflow never collide.
    ///
    /// The action receives `context` plus the outputs of the unit's direct
    /// dependencies, keyed by the *unprefixed* unit id. Unlike a pipeline
    /// stage it does not see outputs of transitive dependencies or of
    /// unrelated units.
    pub fn to_task(&self, namespace: &str, context: WorkflowContext) -> ScheduledTask {
        let action = Arc::clone(&self.action);
        let prefix = format!("{}:", namespace);
        let deps = self
            .depends_on
            .iter()
            .map(|d| TaskId::new(format!("{}{}", prefix, d)))
            .collect();

        let mut task = ScheduledTask::new(&format!("{}{}", prefix, self.id), move |ctx| {
            let inputs = strip_namespace(ctx.inputs, &prefix);
            action(inputs)
        })
        .with_name(&self.name)
        .with_priority(self.priority)
        .with_dependencies(deps)
        .with_resources(self.resources.clone())
        .with_retries(self.retry_count)
        .with_context(context);
        task.timeout = self.timeout;
        task
    }
}

impl DagNode for WorkUnit {
    fn node_id(&self) -> &TaskId {
        &self.id
    }

    fn node_dependencies(&self) -> &[TaskId] {
        &self.depends_on
    }
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("retry_count", &self.retry_count)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

fn strip_namespace(inputs: WorkflowContext, prefix: &str) -> WorkflowContext {
    let mut stripped = WorkflowContext::new();
    for key in inputs.keys() {
        if let Some(value) = inputs.get(key) {
            stripped.insert(key.strip_prefix(prefix).unwrap_or(key), value.clone());
        }
    }
    stripped
}

/// A named, versioned set of work units.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: Option<String>,
    pub units: Vec<WorkUnit>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            description: None,
            units: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn unit(mut self, unit: WorkUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn unit_ids(&self) -> Vec<TaskId> {
        self.units.iter().map(|u| u.id.clone()).collect()
    }

    pub fn dag(&self) -> TaskDag {
        TaskDag::build(&self.units)
    }

    /// Check the units form a valid DAG.
    pub fn validate(&self) -> Result<()> {
        self.dag().validate()
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            unit_count: self.units.len(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for a stored workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub description: Option<String>,
    pub unit_count: usize,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}
