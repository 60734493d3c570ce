//! In-Memory Store
//!
//! Keeps workflows and executions in process-local maps.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{sort_newest_first, sort_oldest_first, ExecutionStore, WorkflowStore};
use crate::error::StoreError;
use crate::workflow::{Workflow, WorkflowExecution};

/// Map-backed implementation of both store traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<String, Workflow>>,
    executions: RwLock<HashMap<String, WorkflowExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored execution records.
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows
            .write()
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn find_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().get(id).cloned())
    }

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .find(|w| w.name == name)
            .cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows: Vec<Workflow> = self.workflows.read().values().cloned().collect();
        sort_oldest_first(&mut workflows);
        Ok(workflows)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn find_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.read().get(id).cloned())
    }

    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut executions: Vec<WorkflowExecution> = self
            .executions
            .read()
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        sort_newest_first(&mut executions);
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Context, WorkflowDefinition, WorkflowStep};

    fn workflow(name: &str) -> Workflow {
        let definition =
            WorkflowDefinition::from_steps(name, vec![WorkflowStep::new("a", "script")]);
        Workflow::new(name, "", definition)
    }

    #[tokio::test]
    async fn test_workflow_roundtrip() {
        let store = MemoryStore::new();
        let wf = workflow("alpha");
        store.save_workflow(&wf).await.unwrap();

        let found = store.find_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(found.name, "alpha");
        assert!(store.find_workflow("missing").await.unwrap().is_none());

        let by_name = store.find_workflow_by_name("alpha").await.unwrap().unwrap();
        assert_eq!(by_name.id, wf.id);
        assert!(store.find_workflow_by_name("beta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces() {
        let store = MemoryStore::new();
        let mut wf = workflow("alpha");
        store.save_workflow(&wf).await.unwrap();

        wf.execution_count = 3;
        store.save_workflow(&wf).await.unwrap();

        let all = store.list_workflows().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].execution_count, 3);
    }

    #[tokio::test]
    async fn test_list_executions_filters_by_workflow() {
        let store = MemoryStore::new();
        for workflow_id in ["wf-1", "wf-1", "wf-2"] {
            let exec = WorkflowExecution::new(workflow_id, 1, Context::new(), ["a"]);
            store.save_execution(&exec).await.unwrap();
        }

        assert_eq!(store.execution_count(), 3);
        assert_eq!(store.list_executions("wf-1").await.unwrap().len(), 2);
        assert_eq!(store.list_executions("wf-2").await.unwrap().len(), 1);
        assert!(store.list_executions("wf-3").await.unwrap().is_empty());
    }
}
