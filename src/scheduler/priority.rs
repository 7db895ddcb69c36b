//! Priority tiers and their per-cycle dispatch quotas.

use serde::{Deserialize, Serialize};

/// Priority tier of a scheduled task. Lower discriminant is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    /// Every tier, most urgent first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

/// Maximum tasks each tier may dispatch in one scan cycle.
///
/// A zero quota is read as one: every tier can always make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierQuotas {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub background: usize,
}

impl Default for TierQuotas {
    fn default() -> Self {
        Self {
            critical: 8,
            high: 4,
            normal: 2,
            low: 1,
            background: 1,
        }
    }
}

impl TierQuotas {
    pub fn quota(&self, priority: Priority) -> usize {
        let raw = match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
            Priority::Background => self.background,
        };
        raw.max(1)
    }
}
