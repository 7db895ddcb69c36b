//! One FIFO queue per priority tier.

use super::priority::Priority;
use crate::core::TaskId;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct PriorityQueues {
    tiers: [VecDeque<TaskId>; 5],
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: Priority, id: TaskId) {
        self.tiers[priority.index()].push_back(id);
    }

    pub fn front(&self, priority: Priority) -> Option<&TaskId> {
        self.tiers[priority.index()].front()
    }

    pub fn pop_front(&mut self, priority: Priority) -> Option<TaskId> {
        self.tiers[priority.index()].pop_front()
    }

    /// Remove a queued id from whichever tier holds it.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        for tier in &mut self.tiers {
            if let Some(pos) = tier.iter().position(|queued| queued == id) {
                tier.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].len()
    }

    /// Queue depth of every tier, most urgent first.
    pub fn depths(&self) -> Vec<(Priority, usize)> {
        Priority::ALL.iter().map(|p| (*p, self.depth(*p))).collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }
}
