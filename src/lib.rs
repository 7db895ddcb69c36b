//! Workflow orchestration core.
//!
//! - [`core`]: unit identities, statuses, results, run context, retry
//!   timing and the dependency DAG.
//! - [`resource`]: capacity-bounded resource allocator.
//! - [`pipeline`]: dependency-ordered stage execution with retries and
//!   fail-fast.
//! - [`scheduler`]: five-tier priority scheduler with a bounded worker pool.
//! - [`orchestration`]: sessions, execution modes, health and metrics.
//! - [`events`]: lifecycle events for external observers.

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod resource;
pub mod scheduler;

pub use error::{Error, Result};
pub use events::{EventBus, EventType, OrchestrationEvent};
pub use orchestration::{Coordinator, ExecutionMode, WorkUnit, WorkflowDefinition, WorkflowResult};
