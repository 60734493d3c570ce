//! Workflow Execution State
//!
//! The mutable record of one run of a workflow: its status, context,
//! progress counters, per-step outcomes, and timing.
//!
//! Status moves strictly forward:
//!
//! ```text
//! PENDING -> RUNNING -> { COMPLETED | FAILED | CANCELLED | TIMEOUT }
//!    \_________________________________/^
//!            (cancel while PENDING)
//! ```
//!
//! The orchestrator owns the record while it is live; once terminal it is
//! read-only history.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::Context;
use crate::error::EngineError;
use crate::monitoring::{EventType, ExecutionTimeline};

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    /// Returns true for states with no outgoing transition.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Checks whether the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(label)
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step is waiting for its wave
    Pending,
    /// Step is currently executing
    Running,
    /// Step completed successfully
    Completed,
    /// Step condition was false
    Skipped,
    /// Step failed after exhausting retries
    Failed,
    /// Step was interrupted by cancellation
    Cancelled,
}

impl StepStatus {
    /// Successful and skipped steps both satisfy their dependents and count as progress.
    pub fn counts_as_progress(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Per-step outcome tracked on the execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub status: StepStatus,
    /// Number of executor invocations made
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One run of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    /// Revision of the workflow definition this run executes
    pub workflow_revision: u32,
    pub status: ExecutionStatus,

    pub input: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Context>,
    pub context: Context,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub total_steps: usize,
    pub completed_steps: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Outcome of each step, keyed by step name
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,

    #[serde(default)]
    pub timeline: ExecutionTimeline,

    /// Steps counted toward progress whose wave has not been merged yet
    #[serde(skip)]
    unmerged_steps: Vec<String>,
}

impl WorkflowExecution {
    /// Creates a PENDING execution for the given step names.
    pub fn new<'a>(
        workflow_id: impl Into<String>,
        workflow_revision: u32,
        input: Context,
        step_names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let steps: BTreeMap<String, StepRecord> = step_names
            .into_iter()
            .map(|name| (name.to_string(), StepRecord::pending()))
            .collect();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            workflow_revision,
            status: ExecutionStatus::Pending,
            context: Context::new(),
            input,
            output: None,
            current_step: None,
            total_steps: steps.len(),
            completed_steps: 0,
            error_message: None,
            error_details: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            steps,
            timeline: ExecutionTimeline::new(),
            unmerged_steps: Vec::new(),
        }
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::execution_transition(self.status, next));
        }
        debug!("Execution {}: {} -> {}", self.id, self.status, next);
        self.status = next;
        Ok(())
    }

    /// Sets completion time and duration together. Steps still running
    /// are marked cancelled.
    fn finish(&mut self, now: DateTime<Utc>) {
        for (name, record) in self.steps.iter_mut() {
            if record.status == StepStatus::Running {
                record.status = StepStatus::Cancelled;
                record.completed_at = Some(now);
                self.timeline.add_event(name.clone(), EventType::Cancelled, record.attempts);
            }
        }

        let began = self.started_at.unwrap_or(self.created_at);
        self.completed_at = Some(now);
        self.duration_ms = Some((now - began).num_milliseconds().max(0) as u64);
        self.current_step = None;
    }

    /// PENDING -> RUNNING, seeding the context.
    pub fn start(&mut self, context: Context) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.context = context;
        Ok(())
    }

    /// RUNNING -> COMPLETED with the final context as output.
    pub fn complete(&mut self, context: Context) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Completed)?;
        self.output = Some(context.clone());
        self.context = context;
        self.finish(Utc::now());
        Ok(())
    }

    /// RUNNING -> FAILED.
    pub fn fail(&mut self, message: impl Into<String>, details: Value) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = Some(message.into());
        self.error_details = Some(details);
        self.finish(Utc::now());
        Ok(())
    }

    /// RUNNING -> TIMEOUT.
    pub fn time_out(&mut self, message: impl Into<String>, details: Value) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Timeout)?;
        self.error_message = Some(message.into());
        self.error_details = Some(details);
        self.finish(Utc::now());
        Ok(())
    }

    /// PENDING|RUNNING -> CANCELLED.
    ///
    /// Progress falls back to the last merged wave: steps that settled in
    /// the interrupted wave are marked cancelled, since their output never
    /// reached the context.
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Cancelled)?;
        let now = Utc::now();
        for name in std::mem::take(&mut self.unmerged_steps) {
            if let Some(record) = self.steps.get_mut(&name) {
                record.status = StepStatus::Cancelled;
                record.completed_at = Some(now);
                self.timeline.add_event(name.clone(), EventType::Cancelled, record.attempts);
                self.completed_steps = self.completed_steps.saturating_sub(1);
            }
        }
        self.finish(now);
        Ok(())
    }

    /// Marks the current wave's outputs as merged into the context.
    pub fn merge_wave(&mut self, context: Context) {
        self.context = context;
        self.unmerged_steps.clear();
    }

    /// Marks a step as dispatched.
    pub fn record_step_started(&mut self, step: &str) {
        let record = self
            .steps
            .entry(step.to_string())
            .or_insert_with(StepRecord::pending);
        record.status = StepStatus::Running;
        record.started_at = Some(Utc::now());
        record.attempts = record.attempts.max(1);
        self.current_step = Some(step.to_string());
        self.timeline.add_event(step, EventType::Started, 1);
    }

    /// Notes that an attempt failed and another one will follow.
    pub fn record_step_retry(&mut self, step: &str, failed_attempt: u32) {
        if let Some(record) = self.steps.get_mut(step) {
            record.attempts = failed_attempt + 1;
        }
        self.timeline.add_event(step, EventType::Retrying, failed_attempt);
    }

    /// Records a step's final outcome and advances progress.
    ///
    /// Progress only moves forward: a step already settled is ignored.
    pub fn record_step_settled(
        &mut self,
        step: &str,
        status: StepStatus,
        attempts: u32,
        error: Option<String>,
    ) {
        let record = self
            .steps
            .entry(step.to_string())
            .or_insert_with(StepRecord::pending);
        if matches!(
            record.status,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed | StepStatus::Cancelled
        ) {
            return;
        }

        let now = Utc::now();
        record.status = status;
        record.attempts = attempts;
        record.error = error;
        record.completed_at = Some(now);
        if record.started_at.is_none() {
            record.started_at = Some(now);
        }

        let event = match status {
            StepStatus::Completed => EventType::Completed,
            StepStatus::Skipped => EventType::Skipped,
            StepStatus::Cancelled => EventType::Cancelled,
            _ => EventType::Failed,
        };
        self.timeline.add_event(step, event, attempts);

        if status.counts_as_progress() {
            self.completed_steps = (self.completed_steps + 1).min(self.total_steps);
            self.unmerged_steps.push(step.to_string());
        }
        self.current_step = Some(step.to_string());
    }

    /// Returns completion as a fraction in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 1.0;
        }
        self.completed_steps as f64 / self.total_steps as f64
    }

    /// Returns the names of steps in the given status.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
