//! Lifecycle events and the bus that delivers them.
//!
//! Components publish [`OrchestrationEvent`]s as workflows, stages and tasks
//! move through their lifecycle. Observers either register a callback for one
//! [`EventType`] or subscribe to the broadcast stream of every event.
//! Publishing with nobody listening is a no-op.

use crate::core::{ExecutionStatus, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast channel capacity used by [`EventBus::default`].
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Discriminant used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    StageStarted,
    StageCompleted,
    TaskDispatched,
    TaskCompleted,
}

/// Something that happened during orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    WorkflowStarted {
        workflow: String,
        session_id: String,
        mode: String,
    },
    WorkflowCompleted {
        workflow: String,
        session_id: String,
        duration_ms: u64,
    },
    WorkflowFailed {
        workflow: String,
        session_id: String,
        error: String,
    },
    StageStarted {
        stage_id: TaskId,
    },
    StageCompleted {
        stage_id: TaskId,
        status: ExecutionStatus,
        attempts: u32,
    },
    TaskDispatched {
        task_id: TaskId,
        priority: String,
    },
    TaskCompleted {
        task_id: TaskId,
        status: ExecutionStatus,
    },
}

impl OrchestrationEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            OrchestrationEvent::WorkflowStarted { .. } => EventType::WorkflowStarted,
            OrchestrationEvent::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            OrchestrationEvent::WorkflowFailed { .. } => EventType::WorkflowFailed,
            OrchestrationEvent::StageStarted { .. } => EventType::StageStarted,
            OrchestrationEvent::StageCompleted { .. } => EventType::StageCompleted,
            OrchestrationEvent::TaskDispatched { .. } => EventType::TaskDispatched,
            OrchestrationEvent::TaskCompleted { .. } => EventType::TaskCompleted,
        }
    }
}

/// Callback invoked synchronously for each matching event.
pub type EventHandler = Arc<dyn Fn(&OrchestrationEvent) + Send + Sync>;

/// Multi-producer event bus.
///
/// Cloning the bus shares both the handler registry and the broadcast
/// sender, so handlers registered through any clone see events emitted
/// through every other clone.
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<EventType, Vec<EventHandler>>>>,
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            sender,
        }
    }

    /// Register a callback for one event type.
    pub fn register<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&OrchestrationEvent) + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Receive every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to matching handlers, then to subscribers.
    ///
    /// Handlers run on the emitting task after the registry lock is
    /// released, so a handler may register further handlers.
    pub fn emit(&self, event: OrchestrationEvent) {
        let matching: Vec<EventHandler> = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers
                .get(&event.event_type())
                .cloned()
                .unwrap_or_default()
        };
        trace!(event = ?event.event_type(), handlers = matching.len(), "emit");
        for handler in &matching {
            handler(&event);
        }
        let _ = self.sender.send(event);
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event_type)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self
            .handlers
            .read()
            .map(|h| h.values().map(Vec::len).sum::<usize>())
            .unwrap_or(0);
        f.debug_struct("EventBus")
            .field("handlers", &handlers)
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
