//! Execution sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Finished sessions kept for `Coordinator::session_state` lookups.
pub const FINISHED_SESSION_HISTORY: usize = 64;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a session executes its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Pipeline, one unit at a time in topological order.
    Sequential,
    /// Pipeline, each execution level concurrently.
    Parallel,
    /// Scheduler, by priority; resource requests are ignored.
    Priority,
    /// Scheduler, by priority, admitted only with granted resources.
    ResourceAware,
}

impl ExecutionMode {
    pub fn uses_scheduler(self) -> bool {
        matches!(self, ExecutionMode::Priority | ExecutionMode::ResourceAware)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Priority => write!(f, "priority"),
            ExecutionMode::ResourceAware => write!(f, "resource_aware"),
        }
    }
}

/// Lifecycle of a session: `Created` until a workflow runs in it, then
/// `Running`, then `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Created | SessionState::Running)
    }

    /// Valid transitions:
    /// - Created -> Running
    /// - Running -> Completed OR Failed
    pub fn can_transition(self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Created, SessionState::Running)
                | (SessionState::Running, SessionState::Completed)
                | (SessionState::Running, SessionState::Failed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Running => write!(f, "running"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Handle to a session created by the coordinator.
///
/// Carries the session's identity and mode; its live state is owned by the
/// coordinator and read through `Coordinator::session_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            id: SessionId::new(),
            mode,
            created_at: Utc::now(),
        }
    }
}

/// Session states: live sessions by id plus a short history of finished ones.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    live: HashMap<SessionId, SessionState>,
    finished: VecDeque<(SessionId, SessionState)>,
    history: usize,
}

impl SessionRegistry {
    pub(crate) fn new(history: usize) -> Self {
        Self {
            live: HashMap::new(),
            finished: VecDeque::new(),
            history,
        }
    }

    pub(crate) fn insert(&mut self, id: SessionId) {
        self.live.insert(id, SessionState::Created);
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<SessionState> {
        self.live.get(&id).copied().or_else(|| {
            self.finished
                .iter()
                .find(|(finished, _)| *finished == id)
                .map(|(_, state)| *state)
        })
    }

    /// Move a live session to `target`. Finished sessions leave the live
    /// map for the history, whose oldest entry falls off past capacity.
    ///
    /// Returns the state found when the transition is not allowed.
    pub(crate) fn transition(
        &mut self,
        id: SessionId,
        target: SessionState,
    ) -> std::result::Result<(), Option<SessionState>> {
        match self.live.get(&id).copied() {
            Some(state) if state.can_transition(target) => {
                if target.is_active() {
                    self.live.insert(id, target);
                } else {
                    self.live.remove(&id);
                    self.finished.push_back((id, target));
                    while self.finished.len() > self.history {
                        self.finished.pop_front();
                    }
                }
                Ok(())
            }
            Some(state) => Err(Some(state)),
            None => Err(self.get(id)),
        }
    }

    /// Sessions created or running.
    pub(crate) fn live_count(&self) -> usize {
        self.live.len()
    }
}
