//! Priority task scheduling.
//!
//! Tasks are queued in five priority tiers and dispatched by a background
//! loop onto a bounded worker pool, gated by dependencies and by the
//! resource allocator.

mod dispatch;
mod priority;
mod queue;
mod task;

pub use dispatch::{
    SchedulerConfig, SchedulerStats, TaskScheduler, DEFAULT_MAX_WORKERS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_STARVATION_THRESHOLD,
};
pub use priority::{Priority, TierQuotas};
pub use queue::PriorityQueues;
pub use task::{ScheduledTask, TaskContext, TaskFn, TaskFuture};
