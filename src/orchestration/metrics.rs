//! Workflow counters kept by the coordinator.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Totals since the coordinator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationMetrics {
    pub workflows_started: u64,
    pub workflows_succeeded: u64,
    pub workflows_failed: u64,
    /// Summed wall time of finished workflows.
    pub total_duration_ms: u64,
}

impl OrchestrationMetrics {
    pub(crate) fn record_start(&mut self) {
        self.workflows_started += 1;
    }

    pub(crate) fn record_finish(&mut self, success: bool, duration: Duration) {
        if success {
            self.workflows_succeeded += 1;
        } else {
            self.workflows_failed += 1;
        }
        self.total_duration_ms += duration.as_millis() as u64;
    }

    pub fn workflows_finished(&self) -> u64 {
        self.workflows_succeeded + self.workflows_failed
    }

    /// Started but not yet finished.
    pub fn workflows_in_flight(&self) -> u64 {
        self.workflows_started.saturating_sub(self.workflows_finished())
    }

    /// Mean wall time of finished workflows, zero before the first one.
    pub fn average_duration(&self) -> Duration {
        match self.workflows_finished() {
            0 => Duration::ZERO,
            n => Duration::from_millis(self.total_duration_ms / n),
        }
    }
}
