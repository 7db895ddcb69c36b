use std::time::Duration;

use thiserror::Error;

/// Structural problems found while validating a dependency graph.
///
/// Every problem is collected so callers get the full picture in one pass
/// instead of fixing one missing dependency at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    /// `(dependent, unknown dependency)` pairs.
    pub missing_dependencies: Vec<(String, String)>,
    /// Each cycle as a concrete path; the first node is repeated at the end.
    pub cycles: Vec<Vec<String>>,
    /// Identities declared more than once.
    pub duplicates: Vec<String>,
}

impl ValidationError {
    pub fn is_empty(&self) -> bool {
        self.missing_dependencies.is_empty() && self.cycles.is_empty() && self.duplicates.is_empty()
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        for (node, dep) in &self.missing_dependencies {
            parts.push(format!("'{}' depends on unknown '{}'", node, dep));
        }
        for cycle in &self.cycles {
            parts.push(format!("cycle detected: {}", cycle.join(" -> ")));
        }
        for dup in &self.duplicates {
            parts.push(format!("duplicate identity '{}'", dup));
        }
        if parts.is_empty() {
            write!(f, "invalid graph")
        } else {
            write!(f, "{}", parts.join("; "))
        }
    }
}

impl std::error::Error for ValidationError {}

/// Failure of a single unit of work.
///
/// These never cross the workflow boundary as `Err`; they are rendered into
/// the `error` field of a stage or task result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Insufficient capacity on {resource}: requested {requested}, available {available}")]
    InsufficientCapacity {
        resource: String,
        requested: u64,
        available: u64,
    },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource already registered: {0}")]
    ResourceExists(String),

    #[error("Invalid allocation amount {amount} for {resource}")]
    InvalidAmount { resource: String, amount: u64 },

    #[error("Allocation not found: {0}")]
    AllocationNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already submitted: {0}")]
    DuplicateTask(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow already exists: {0}")]
    WorkflowExists(String),

    #[error("Invalid session state: expected {expected}, found {found}")]
    InvalidSessionState { expected: String, found: String },

    #[error("Scheduler is not running")]
    SchedulerNotRunning,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
