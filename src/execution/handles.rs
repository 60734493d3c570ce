//! Execution Handles
//!
//! Live executions are tracked by id so they can be observed and
//! cancelled. A handle pairs the execution record, behind an async lock,
//! with the cancellation token of its run. Handles are removed once the
//! record reaches a terminal status.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::workflow::WorkflowExecution;

/// The live state of one execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub id: String,
    pub workflow_id: String,
    /// Every transition and progress update happens under this lock
    pub record: tokio::sync::Mutex<WorkflowExecution>,
    /// Cancelled on `cancel_execution`, workflow timeout, or shutdown
    pub token: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(record: WorkflowExecution) -> Self {
        Self {
            id: record.id.clone(),
            workflow_id: record.workflow_id.clone(),
            record: tokio::sync::Mutex::new(record),
            token: CancellationToken::new(),
        }
    }

    /// Copy of the current record.
    pub async fn snapshot(&self) -> WorkflowExecution {
        self.record.lock().await.clone()
    }
}

/// Handles of non-terminal executions, keyed by execution id.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    handles: Mutex<HashMap<String, Arc<ExecutionHandle>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ExecutionHandle>) {
        self.handles.lock().insert(handle.id.clone(), handle);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ExecutionHandle>> {
        self.handles.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ExecutionHandle>> {
        self.handles.lock().remove(id)
    }

    /// Ids of live executions, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
