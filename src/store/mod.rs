//! Persistence Module
//!
//! Storage collaborators for the workflow catalog and execution records.
//! The orchestrator only talks to the traits; backends decide where the
//! documents live.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local maps, the default for tests and embedding
//! - [`FileStore`]: one pretty-printed JSON document per record on disk

use async_trait::async_trait;

use crate::error::StoreError;
use crate::workflow::{Workflow, WorkflowExecution};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Catalog of workflows.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts or replaces a workflow by id.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn find_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError>;

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, StoreError>;

    /// All workflows, oldest first.
    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;
}

/// Execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts or replaces an execution by id.
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn find_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Executions of one workflow, most recently started first.
    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError>;
}

/// Orders executions newest first by start time, falling back to creation time.
pub(crate) fn sort_newest_first(executions: &mut [WorkflowExecution]) {
    executions.sort_by(|a, b| {
        let a_key = a.started_at.unwrap_or(a.created_at);
        let b_key = b.started_at.unwrap_or(b.created_at);
        b_key.cmp(&a_key).then_with(|| b.id.cmp(&a.id))
    });
}

/// Orders workflows oldest first.
pub(crate) fn sort_oldest_first(workflows: &mut [Workflow]) {
    workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
