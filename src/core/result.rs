//! Per-unit execution results.

use crate::core::retry::AttemptOutcome;
use crate::core::task::{ExecutionStatus, TaskId};
use crate::error::ExecutionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Outcome of one stage or task.
///
/// Produced once the unit reaches a terminal status and never mutated
/// afterwards. Parallel stages keep their children's results in
/// `children`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: TaskId,
    pub name: String,
    pub status: ExecutionStatus,
    /// Value produced by the unit; `Null` unless it succeeded.
    pub output: Value,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times the unit's logic was invoked.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExecutionResult>,
}

/// Result of a pipeline stage.
pub type StageResult = ExecutionResult;

/// Result of a scheduled task.
pub type TaskResult = ExecutionResult;

impl ExecutionResult {
    pub fn new(id: TaskId, name: &str, status: ExecutionStatus) -> Self {
        Self {
            id,
            name: name.to_string(),
            status,
            output: Value::Null,
            error: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
            children: Vec::new(),
        }
    }

    /// A unit that never ran because an upstream unit failed or the run
    /// was aborted.
    pub fn cancelled(id: TaskId, name: &str, reason: &str) -> Self {
        let mut result = Self::new(id, name, ExecutionStatus::Cancelled);
        result.error = Some(reason.to_string());
        result.finished_at = Some(Utc::now());
        result
    }

    pub fn skipped(id: TaskId, name: &str) -> Self {
        let now = Utc::now();
        let mut result = Self::new(id, name, ExecutionStatus::Skipped);
        result.started_at = Some(now);
        result.finished_at = Some(now);
        result
    }

    /// Record the final outcome of a unit that ran.
    ///
    /// A cancellation observed between attempts is recorded as
    /// `Cancelled`; every other error is `Failed`.
    pub fn from_outcome(id: TaskId, name: &str, outcome: AttemptOutcome) -> Self {
        let mut result = match outcome.result {
            Ok(output) => {
                let mut r = Self::new(id, name, ExecutionStatus::Success);
                r.output = output;
                r
            }
            Err(ExecutionError::Cancelled(reason)) => {
                let mut r = Self::new(id, name, ExecutionStatus::Cancelled);
                r.error = Some(reason);
                r
            }
            Err(e) => {
                let mut r = Self::new(id, name, ExecutionStatus::Failed);
                r.error = Some(e.to_string());
                r
            }
        };
        result.attempts = outcome.attempts;
        result.finished_at = Some(Utc::now());
        result
    }

    /// Retries consumed beyond the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
