//! Stage pipelines.
//!
//! A pipeline is a DAG of stages run in dependency order, with per-stage
//! retries, fail-fast propagation and optional level-parallel execution.

mod executor;
mod stage;

pub use executor::{Pipeline, PipelineConfig, PipelineResult, DEFAULT_MAX_PARALLEL};
pub use stage::{stage_fn, Predicate, Stage, StageFn, StageFuture, StageHook, StageKind};
