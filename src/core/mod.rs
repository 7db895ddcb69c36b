//! Core domain models for flowcore orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: unit identities and statuses, per-unit
//! results, the shared run context, retry timing, and the dependency DAG.

pub mod context;
pub mod dag;
pub mod result;
pub mod retry;
pub mod task;

pub use context::{WorkflowContext, PARAMS_KEY};
pub use dag::{DagNode, NodeSpec, TaskDag};
pub use result::{ExecutionResult, StageResult, TaskResult};
pub use retry::{catch_panic, run_with_retry, AttemptOutcome, RetryPolicy};
pub use task::{ExecutionStatus, TaskId};
