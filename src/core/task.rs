//! Identity and status types shared by stages and scheduled tasks.
//!
//! Stages and tasks are both "units of work" with an identity, a set of
//! dependencies and a status that moves from `Pending` to one terminal
//! state. The helpers here encode which terminal states satisfy a
//! dependency and which block it.

use serde::{Deserialize, Serialize};

/// Identifier for a stage or task within one workflow run.
///
/// Unlike session and allocation ids these are chosen by the caller
/// ("build", "test", "deploy") so dependency sets stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a stage or task.
///
/// `Success` and `Skipped` satisfy a dependency; `Failed` and `Cancelled`
/// block every dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    /// Check if the status is final (no further transitions).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Check if a dependent may start given this dependency status.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Skipped)
    }

    /// Check if this status blocks dependents permanently.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}
