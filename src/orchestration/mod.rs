//! Orchestration layer.
//!
//! The [`Coordinator`] ties the pieces together: it stores workflow
//! definitions, hands out sessions, runs each workflow through the pipeline
//! executor or the priority scheduler depending on the session's mode, and
//! reports health and metrics.

mod coordinator;
mod health;
mod metrics;
mod repository;
mod session;
mod workflow;

pub use coordinator::{Coordinator, WorkflowResult};
pub use health::{
    ComponentHealth, ComponentStatus, FailureWindow, HealthConfig, HealthStatus,
    DEFAULT_FAILURE_RATE_THRESHOLD, DEFAULT_FAILURE_WINDOW, DEFAULT_UTILIZATION_WARNING,
};
pub use metrics::OrchestrationMetrics;
pub use repository::{InMemoryWorkflowRepository, WorkflowRepository};
pub use session::{ExecutionMode, Session, SessionId, SessionState};
pub use workflow::{WorkUnit, WorkflowDefinition, WorkflowSummary};
