//! Workflow Data Model
//!
//! Core data structures describing what a workflow is: its definition
//! (ordered steps and their dependencies) and the catalog entry that wraps
//! it with a lifecycle status and execution counters.
//!
//! # Example Definition Document
//!
//! ```yaml
//! name: nightly-report
//! version: "1.2.0"
//! timeoutSeconds: 600
//! retryCount: 1
//! variables:
//!   region: eu-west
//! steps:
//!   - name: fetch
//!     type: agent-command
//!     parameters:
//!       agent: collector
//!       command: "collect ${region}"
//!
//!   - name: summarize
//!     type: script
//!     dependencies: [fetch]
//!     condition: "fetch != null"
//!     parameters:
//!       expression: "'rows: ' + fetch.rows"
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::ExecutionStatus;
use crate::error::EngineError;

/// The shared key-value map threaded through a run.
pub type Context = Map<String, Value>;

/// Kind of work a step performs, used to pick its executor.
///
/// The built-in kinds have dedicated variants; anything else is carried as
/// [`StepType::Custom`] so new executors can be registered by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    AgentCommand,
    Condition,
    Loop,
    Parallel,
    Script,
    Custom(String),
}

impl StepType {
    /// Registry key for this step type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentCommand => "agent-command",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Script => "script",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        match value.trim() {
            "agent-command" => Self::AgentCommand,
            "condition" => Self::Condition,
            "loop" => Self::Loop,
            "parallel" => Self::Parallel,
            "script" => Self::Script,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<&str> for StepType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the workflow when a step exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    /// Let the current wave settle, then fail without starting later waves.
    #[default]
    FailWorkflow,
    /// Record the failure and unblock dependents.
    Continue,
    /// Cancel the rest of the wave and fail immediately.
    FailFast,
}

/// A single unit of work inside a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique name within the definition; also the dependency graph node id
    pub name: String,

    /// Executor kind
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Executor-specific parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// Names of steps that must settle successfully before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Optional boolean expression; when false the step is skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Per-attempt timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Retries after the first attempt; falls back to the definition default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default)]
    pub on_error: OnError,
}

impl WorkflowStep {
    /// Creates a step with no parameters or dependencies.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::WorkflowStep;
    ///
    /// let step = WorkflowStep::new("render", "script")
    ///     .with_parameter("expression", "'hello ' + name")
    ///     .depends_on("load")
    ///     .with_retry_count(2);
    /// assert_eq!(step.dependencies, vec!["load"]);
    /// ```
    pub fn new(name: impl Into<String>, step_type: impl Into<StepType>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            step_type: step_type.into(),
            parameters: Map::new(),
            dependencies: Vec::new(),
            condition: None,
            timeout_seconds: None,
            retry_count: None,
            on_error: OnError::default(),
        }
    }

    /// Sets one executor parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_name: impl Into<String>) -> Self {
        let name = step_name.into();
        if !self.dependencies.contains(&name) {
            self.dependencies.push(name);
        }
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    /// Reads a string parameter.
    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Context key the built-in executors write their result under.
    pub fn output_key(&self) -> &str {
        self.parameter_str("outputKey").unwrap_or(&self.name)
    }
}

/// Declarative description of a workflow: ordered steps plus defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Ordered list of steps
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,

    /// Initial context seed
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Whole-workflow deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Retry budget inherited by steps without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            description: String::new(),
            version: default_version(),
            steps: Vec::new(),
            variables: Map::new(),
            timeout_seconds: None,
            retry_count: None,
        }
    }

    /// Creates a definition from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            steps,
            ..Self::new(name)
        }
    }

    /// Appends a step, rejecting duplicate names.
    pub fn add_step(&mut self, step: WorkflowStep) -> Result<(), String> {
        if self.steps.iter().any(|s| s.name == step.name) {
            return Err(format!("Step '{}' already exists", step.name));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .collect()
    }

    /// Returns the number of steps in the definition.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Lifecycle status of a catalogued workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Inactive,
    Archived,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Inactive => "INACTIVE",
            Self::Archived => "ARCHIVED",
        };
        f.write_str(label)
    }
}

/// Catalog entry: a definition plus lifecycle status and running counters.
///
/// Counters are only touched by the orchestrator, once per terminal
/// execution transition, via [`Workflow::record_execution`].
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,

    /// Current definition; executions keep their own snapshot
    pub definition: Arc<WorkflowDefinition>,

    /// Bumped every time the definition is replaced
    pub revision: u32,

    pub status: WorkflowStatus,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_duration_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Creates a DRAFT workflow with a fresh id.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        definition: WorkflowDefinition,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            definition: Arc::new(definition),
            revision: 1,
            status: WorkflowStatus::Draft,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_executed_at: None,
            last_execution_duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Only ACTIVE and PAUSED workflows may be executed.
    pub fn is_executable(&self) -> bool {
        matches!(self.status, WorkflowStatus::Active | WorkflowStatus::Paused)
    }

    /// Changes the lifecycle status. ARCHIVED is final.
    pub fn set_status(&mut self, status: WorkflowStatus) -> Result<(), EngineError> {
        if self.status == WorkflowStatus::Archived && status != WorkflowStatus::Archived {
            return Err(EngineError::workflow_transition(self.status, status));
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replaces the definition and bumps the revision.
    pub fn replace_definition(&mut self, definition: WorkflowDefinition) {
        self.definition = Arc::new(definition);
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    /// Folds one terminal execution outcome into the counters.
    pub fn record_execution(
        &mut self,
        status: ExecutionStatus,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    ) {
        self.execution_count += 1;
        match status {
            ExecutionStatus::Completed => self.success_count += 1,
            ExecutionStatus::Failed | ExecutionStatus::Timeout => self.failure_count += 1,
            _ => {}
        }
        self.last_executed_at = Some(finished_at);
        self.last_execution_duration_ms = Some(duration_ms);
        self.updated_at = finished_at;
    }
}
