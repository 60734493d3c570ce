//! Error Types
//!
//! Typed errors for each layer of the engine:
//!
//! - [`EngineError`]: returned synchronously by the orchestrator's control surface
//! - [`StepError`]: produced while running a single step, absorbed by retry/on-error policy
//! - [`StoreError`]: raised by persistence backends
//!
//! Asynchronous execution failures never surface as errors to callers. They are
//! recorded on the execution record, classified by [`FailureKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::expression::ExpressionError;
use crate::workflow::model::WorkflowStatus;
use crate::workflow::state::ExecutionStatus;

/// Errors returned by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed, cyclic, or otherwise invalid workflow definition.
    #[error("Invalid workflow definition: {0}")]
    DefinitionInvalid(String),

    /// Another workflow already uses this name.
    #[error("Workflow name already in use: '{0}'")]
    DuplicateWorkflowName(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The workflow exists but its lifecycle status forbids execution.
    #[error("Workflow '{id}' is not executable (status: {status})")]
    WorkflowNotExecutable { id: String, status: WorkflowStatus },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// A lifecycle or execution state transition that the state machine forbids.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The background execution task panicked or was aborted.
    #[error("Execution task failed: {0}")]
    Join(String),
}

impl EngineError {
    pub(crate) fn execution_transition(from: ExecutionStatus, to: ExecutionStatus) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub(crate) fn workflow_transition(from: WorkflowStatus, to: WorkflowStatus) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Errors produced while executing one step.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// No executor is registered for the step's type.
    #[error("Unknown step type: '{0}'")]
    UnknownStepType(String),

    /// The executor reported a failure.
    #[error("Step '{step}' failed: {message}")]
    Failed { step: String, message: String },

    /// A single attempt exceeded the step timeout.
    #[error("Step '{step}' timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    /// A parameter required by the executor is missing or has the wrong shape.
    #[error("Step '{step}': invalid parameter '{parameter}': {message}")]
    InvalidParameter {
        step: String,
        parameter: String,
        message: String,
    },

    #[error("Step '{step}': {source}")]
    Expression {
        step: String,
        #[source]
        source: ExpressionError,
    },
}

impl StepError {
    /// Shorthand for an executor-level failure.
    pub fn failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn invalid_parameter(
        step: impl Into<String>,
        parameter: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            step: step.into(),
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Only executor failures and timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Timeout { .. })
    }

    /// Classification written into an execution's error details.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownStepType(_) => FailureKind::UnknownStepType,
            Self::Timeout { .. } => FailureKind::StepTimeout,
            Self::Cancelled => FailureKind::ExecutionCancelled,
            Self::Failed { .. } | Self::InvalidParameter { .. } | Self::Expression { .. } => {
                FailureKind::StepExecutionFailed
            }
        }
    }
}

/// Why an execution ended in FAILED or TIMEOUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    StepExecutionFailed,
    StepTimeout,
    WorkflowTimeout,
    UnknownStepType,
    ExecutionCancelled,
}

/// Errors raised by persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}
