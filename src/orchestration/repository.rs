//! Storage for workflow definitions.

use super::workflow::{WorkflowDefinition, WorkflowSummary};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Where the coordinator looks up workflows by name.
///
/// Synchronous and object safe so the coordinator can hold any backend as
/// `Arc<dyn WorkflowRepository>`.
pub trait WorkflowRepository: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<WorkflowDefinition>>;

    /// Summaries of every stored workflow, sorted by name.
    fn list(&self) -> Result<Vec<WorkflowSummary>>;

    /// Store a new workflow.
    ///
    /// # Errors
    /// `Error::WorkflowExists` if the name is taken.
    fn create(&self, definition: WorkflowDefinition) -> Result<()>;

    /// Replace a stored workflow, bumping its version.
    ///
    /// # Errors
    /// `Error::WorkflowNotFound` if nothing is stored under the name.
    fn update(&self, definition: WorkflowDefinition) -> Result<()>;

    /// Remove a workflow. Returns `true` if it existed.
    fn delete(&self, name: &str) -> Result<bool>;
}

/// Process-local repository.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, WorkflowDefinition>> {
        self.workflows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, WorkflowDefinition>> {
        self.workflows.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    fn get(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.read().get(name).cloned())
    }

    fn list(&self) -> Result<Vec<WorkflowSummary>> {
        let mut summaries: Vec<_> = self.read().values().map(|d| d.summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    fn create(&self, definition: WorkflowDefinition) -> Result<()> {
        let mut workflows = self.write();
        if workflows.contains_key(&definition.name) {
            return Err(Error::WorkflowExists(definition.name));
        }
        debug!(workflow = %definition.name, units = definition.units.len(), "workflow stored");
        workflows.insert(definition.name.clone(), definition);
        Ok(())
    }

    fn update(&self, mut definition: WorkflowDefinition) -> Result<()> {
        let mut workflows = self.write();
        let Some(existing) = workflows.get(&definition.name) else {
            return Err(Error::WorkflowNotFound(definition.name));
        };
        definition.version = existing.version + 1;
        definition.created_at = existing.created_at;
        definition.updated_at = Utc::now();
        debug!(workflow = %definition.name, version = definition.version, "workflow updated");
        workflows.insert(definition.name.clone(), definition);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.write().remove(name).is_some())
    }
}
