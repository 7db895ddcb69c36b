//! Health reporting for the coordinator.
//!
//! The coordinator keeps a sliding window of recent workflow outcomes and
//! combines it with scheduler and allocator snapshots into a
//! [`HealthStatus`]. A component is `Down` when it cannot do work,
//! `Degraded` when it works but needs attention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default number of workflow outcomes in the failure-rate window.
pub const DEFAULT_FAILURE_WINDOW: usize = 20;

/// Default failure rate above which workflows are reported unhealthy.
pub const DEFAULT_FAILURE_RATE_THRESHOLD: f64 = 0.5;

/// Default allocator utilization at which resources are reported degraded.
pub const DEFAULT_UTILIZATION_WARNING: f64 = 0.9;

/// Thresholds used when building a [`HealthStatus`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub failure_window: usize,
    pub failure_rate_threshold: f64,
    pub utilization_warning: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_window: DEFAULT_FAILURE_WINDOW,
            failure_rate_threshold: DEFAULT_FAILURE_RATE_THRESHOLD,
            utilization_warning: DEFAULT_UTILIZATION_WARNING,
        }
    }
}

/// Fixed-size record of the most recent workflow outcomes.
///
/// # Example
///
/// ```
/// use flowcore::orchestration::FailureWindow;
///
/// let mut window = FailureWindow::new(4);
/// window.record(true);
/// window.record(false);
/// assert_eq!(window.failure_rate(), 0.5);
/// ```
#[derive(Debug, Clone)]
pub struct FailureWindow {
    capacity: usize,
    /// `true` for a success.
    outcomes: VecDeque<bool>,
}

impl FailureWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            outcomes: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    /// Fraction of recorded outcomes that failed; 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentStatus::Healthy => write!(f, "healthy"),
            ComponentStatus::Degraded => write!(f, "degraded"),
            ComponentStatus::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ComponentStatus::Healthy,
            detail: None,
        }
    }

    pub fn with_status(name: &str, status: ComponentStatus, detail: String) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: Some(detail),
        }
    }
}

/// Point-in-time health of the whole orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// No component is down and the failure rate is within threshold.
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub components: Vec<ComponentHealth>,
    /// Pending tasks per scheduler tier.
    pub queue_depths: BTreeMap<String, usize>,
    pub running_tasks: usize,
    /// Fraction of all registered capacity currently allocated.
    pub allocator_utilization: f64,
    pub recent_failure_rate: f64,
    pub active_sessions: usize,
}

impl HealthStatus {
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}
