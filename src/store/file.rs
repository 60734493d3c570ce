//! File Store
//!
//! Persists each workflow and execution as a pretty-printed JSON document:
//!
//! ```text
//! <root>/workflows/<id>.json
//! <root>/executions/<id>.json
//! ```
//!
//! Documents are written to a temporary sibling and renamed into place, so
//! a reader never sees a half-written record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use super::{sort_newest_first, sort_oldest_first, ExecutionStore, WorkflowStore};
use crate::error::StoreError;
use crate::workflow::{Workflow, WorkflowExecution};

const WORKFLOWS_DIR: &str = "workflows";
const EXECUTIONS_DIR: &str = "executions";

/// JSON-document implementation of both store traits.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(WORKFLOWS_DIR)).await?;
        fs::create_dir_all(root.join(EXECUTIONS_DIR)).await?;
        debug!("File store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, dir: &str, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(StoreError::Backend(format!("Invalid record id: '{}'", id)));
        }
        Ok(self.root.join(dir).join(format!("{}.json", id)))
    }

    async fn write_document<T: Serialize>(&self, dir: &str, id: &str, value: &T) -> Result<(), StoreError> {
        let path = self.document_path(dir, id)?;
        let json = serde_json::to_string_pretty(value)?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn read_document<T: DeserializeOwned>(&self, dir: &str, id: &str) -> Result<Option<T>, StoreError> {
        let path = match self.document_path(dir, id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };

        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads every document in a directory, skipping unreadable ones.
    async fn read_all<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, StoreError> {
        let mut entries = fs::read_dir(self.root.join(dir)).await?;
        let mut documents = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str(&content) {
                Ok(document) => documents.push(document),
                Err(e) => warn!("Skipping unreadable document {}: {}", path.display(), e),
            }
        }

        Ok(documents)
    }
}

#[async_trait]
impl WorkflowStore for FileStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.write_document(WORKFLOWS_DIR, &workflow.id, workflow).await
    }

    async fn find_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        self.read_document(WORKFLOWS_DIR, id).await
    }

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, StoreError> {
        let workflows: Vec<Workflow> = self.read_all(WORKFLOWS_DIR).await?;
        Ok(workflows.into_iter().find(|w| w.name == name))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows: Vec<Workflow> = self.read_all(WORKFLOWS_DIR).await?;
        sort_oldest_first(&mut workflows);
        Ok(workflows)
    }
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.write_document(EXECUTIONS_DIR, &execution.id, execution).await
    }

    async fn find_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        self.read_document(EXECUTIONS_DIR, id).await
    }

    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError> {
        let executions: Vec<WorkflowExecution> = self.read_all(EXECUTIONS_DIR).await?;
        let mut executions: Vec<WorkflowExecution> = executions
            .into_iter()
            .filter(|e| e.workflow_id == workflow_id)
            .collect();
        sort_newest_first(&mut executions);
        Ok(executions)
    }
}
