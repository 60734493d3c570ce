//! Workflow Orchestrator
//!
//! The core engine that owns the workflow catalog and drives executions:
//! - Catalog operations (create, revise, lifecycle status)
//! - Wave-by-wave execution with concurrent steps inside a wave
//! - Conditions, retries, timeouts, and `onError` policies
//! - Cancellation of individual executions or all of them
//! - Counter updates on the owning workflow when a run ends
//!
//! Executions run on background tasks. Callers observe them through the
//! execution record (`get_execution`) or by awaiting the
//! [`RunningExecution`] returned from `execute_workflow`. Failures inside a
//! run never surface as errors to the caller; they end up on the record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::executor::{ExecutorRegistry, StepScope};
use super::handles::{ExecutionHandle, ExecutionRegistry};
use super::retry::RetryPolicy;
use super::step::{run_step, step_timeout, StepObserver};
use crate::config::EngineConfig;
use crate::error::{EngineError, FailureKind, StepError};
use crate::store::{ExecutionStore, MemoryStore, WorkflowStore};
use crate::workflow::expression;
use crate::workflow::{
    parse_definition, plan, validate_definition, Context, DefinitionFormat, ExecutionPlan, OnError,
    StepStatus, Workflow, WorkflowDefinition, WorkflowExecution, WorkflowStatus, WorkflowStep,
};

type WorkflowLocks = parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// How a run ended, before it is written to the record.
enum RunOutcome {
    Completed(Context),
    Failed { message: String, details: Value },
    TimedOut { message: String, details: Value },
    Cancelled,
}

impl RunOutcome {
    /// Escalation of a step failure. Step timeouts time out the execution.
    fn from_step_error(step: &str, err: &StepError) -> Self {
        let message = match err {
            StepError::UnknownStepType(_) | StepError::Cancelled => format!("Step '{}': {}", step, err),
            _ => err.to_string(),
        };
        let details = json!({
            "kind": err.kind(),
            "step": step,
            "error": err.to_string(),
        });

        match err {
            StepError::Timeout { .. } => Self::TimedOut { message, details },
            _ => Self::Failed { message, details },
        }
    }
}

/// A started execution.
#[derive(Debug)]
pub struct RunningExecution {
    execution_id: String,
    task: JoinHandle<WorkflowExecution>,
}

impl RunningExecution {
    /// Id of the execution record.
    pub fn id(&self) -> &str {
        &self.execution_id
    }

    /// Waits for the execution to reach a terminal status.
    pub async fn wait(self) -> Result<WorkflowExecution, EngineError> {
        self.task.await.map_err(|e| EngineError::Join(e.to_string()))
    }
}

/// Workflow orchestrator.
///
/// Cheap to clone; clones share the catalog, the stores, and the live
/// executions.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::config::EngineConfig;
/// use flowrunner::execution::{EchoAgent, ExecutorRegistry, Orchestrator};
/// use flowrunner::workflow::{Context, WorkflowDefinition, WorkflowStep};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = ExecutorRegistry::with_builtins(Arc::new(EchoAgent));
///     let orchestrator = Orchestrator::in_memory(registry, EngineConfig::default());
///
///     let definition = WorkflowDefinition::from_steps(
///         "hello",
///         vec![WorkflowStep::new("greet", "script").with_parameter("expression", "'hi'")],
///     );
///     let workflow = orchestrator.create_workflow("hello", "", definition).await?;
///     orchestrator.activate_workflow(&workflow.id).await?;
///
///     let execution = orchestrator
///         .execute_workflow(&workflow.id, Context::new())
///         .await?
///         .wait()
///         .await?;
///     println!("{}", execution.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    registry: Arc<ExecutorRegistry>,
    config: Arc<EngineConfig>,
    handles: ExecutionRegistry,
    /// Serializes read-modify-write of one workflow's catalog entry
    workflow_locks: WorkflowLocks,
    /// Serializes name-uniqueness checks with inserts
    catalog_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Creates an orchestrator over the given stores.
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        registry: ExecutorRegistry,
        config: EngineConfig,
    ) -> Self {
        info!(
            "Orchestrator ready (step kinds: {}, max parallel steps: {})",
            registry.kinds().join(", "),
            config.max_parallel_steps
        );

        Self {
            inner: Arc::new(Inner {
                workflows,
                executions,
                registry: Arc::new(registry),
                config: Arc::new(config),
                handles: ExecutionRegistry::new(),
                workflow_locks: parking_lot::Mutex::new(HashMap::new()),
                catalog_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Creates an orchestrator backed by a fresh [`MemoryStore`].
    pub fn in_memory(registry: ExecutorRegistry, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store, registry, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.inner.registry
    }

    /// Validates a definition and adds it to the catalog as a DRAFT workflow.
    ///
    /// Fails with `DefinitionInvalid` for malformed or cyclic definitions
    /// and `DuplicateWorkflowName` when the name is taken.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: &str,
        definition: WorkflowDefinition,
    ) -> Result<Workflow, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::DefinitionInvalid(
                "Workflow name must not be empty".to_string(),
            ));
        }

        validate_definition(&definition)?;
        self.warn_unknown_types(&definition);

        let _catalog = self.inner.catalog_lock.lock().await;
        if self.inner.workflows.find_workflow_by_name(name).await?.is_some() {
            return Err(EngineError::DuplicateWorkflowName(name.to_string()));
        }

        let workflow = Workflow::new(name, description, definition);
        self.inner.workflows.save_workflow(&workflow).await?;

        info!(
            "Created workflow '{}' ({}) with {} steps",
            workflow.name,
            workflow.id,
            workflow.definition.len()
        );
        Ok(workflow)
    }

    /// Parses a JSON or YAML definition document and creates a workflow from it.
    pub async fn create_workflow_from_document(
        &self,
        document: &str,
        format: DefinitionFormat,
    ) -> Result<Workflow, EngineError> {
        let definition = parse_definition(document, format)?;
        let name = definition.name.clone();
        let description = definition.description.clone();
        self.create_workflow(&name, &description, definition).await
    }

    /// Replaces a workflow's definition and bumps its revision.
    ///
    /// Running executions keep the definition they started with.
    pub async fn update_workflow_definition(
        &self,
        workflow_id: &str,
        definition: WorkflowDefinition,
    ) -> Result<Workflow, EngineError> {
        validate_definition(&definition)?;
        self.warn_unknown_types(&definition);

        let _guard = self.inner.lock_workflow(workflow_id).await;

        let mut workflow = self.inner.load_workflow(workflow_id).await?;
        workflow.replace_definition(definition);
        self.inner.workflows.save_workflow(&workflow).await?;

        info!(
            "Workflow '{}' updated to revision {}",
            workflow.name, workflow.revision
        );
        Ok(workflow)
    }

    /// Changes a workflow's lifecycle status. ARCHIVED is final.
    pub async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<Workflow, EngineError> {
        let _guard = self.inner.lock_workflow(workflow_id).await;

        let mut workflow = self.inner.load_workflow(workflow_id).await?;
        let previous = workflow.status;
        workflow.set_status(status)?;
        self.inner.workflows.save_workflow(&workflow).await?;

        info!("Workflow '{}': {} -> {}", workflow.name, previous, status);
        Ok(workflow)
    }

    /// Marks a workflow ACTIVE so it can be executed.
    pub async fn activate_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        self.update_workflow_status(workflow_id, WorkflowStatus::Active).await
    }

    /// Starts an execution of a workflow's current definition.
    ///
    /// The PENDING record is stored before this returns; the run itself
    /// proceeds on a background task that first moves it to RUNNING.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Context,
    ) -> Result<RunningExecution, EngineError> {
        let workflow = self.inner.load_workflow(workflow_id).await?;
        if !workflow.is_executable() {
            return Err(EngineError::WorkflowNotExecutable {
                id: workflow.id,
                status: workflow.status,
            });
        }

        let definition = Arc::clone(&workflow.definition);
        let plan = plan(&definition.steps).map_err(|e| EngineError::DefinitionInvalid(e.to_string()))?;

        let record = WorkflowExecution::new(
            &workflow.id,
            workflow.revision,
            input.clone(),
            definition.steps.iter().map(|s| s.name.as_str()),
        );
        self.inner.executions.save_execution(&record).await?;

        let handle = Arc::new(ExecutionHandle::new(record));
        self.inner.handles.insert(Arc::clone(&handle));

        info!(
            "Execution {} created for workflow '{}' (revision {})",
            handle.id, workflow.name, workflow.revision
        );

        let execution_id = handle.id.clone();
        let task = tokio::spawn(Arc::clone(&self.inner).drive(handle, definition, plan, input));

        Ok(RunningExecution { execution_id, task })
    }

    /// Cancels a PENDING or RUNNING execution.
    ///
    /// Returns `Ok(false)` when the execution already ended.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool, EngineError> {
        let Some(handle) = self.inner.handles.get(execution_id) else {
            return match self.inner.executions.find_execution(execution_id).await? {
                Some(_) => Ok(false),
                None => Err(EngineError::ExecutionNotFound(execution_id.to_string())),
            };
        };

        let snapshot = {
            let mut record = handle.record.lock().await;
            if record.status.is_terminal() {
                return Ok(false);
            }

            handle.token.cancel();
            record.cancel()?;
            self.inner.save_record(&record).await;
            record.clone()
        };

        info!(
            "Execution {} of workflow {} cancelled ({} of {} steps settled)",
            execution_id, handle.workflow_id, snapshot.completed_steps, snapshot.total_steps
        );
        self.inner.record_outcome(&snapshot).await;
        self.inner.handles.remove(execution_id);
        Ok(true)
    }

    /// Cancels every live execution and returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for id in self.inner.handles.active_ids() {
            match self.cancel_execution(&id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to cancel execution {}: {}", id, e),
            }
        }
        if cancelled > 0 {
            info!("Cancelled {} running executions", cancelled);
        }
        cancelled
    }

    /// Current state of an execution.
    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
        if let Some(handle) = self.inner.handles.get(execution_id) {
            return Ok(handle.snapshot().await);
        }
        self.inner
            .executions
            .find_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Executions of a workflow, most recently started first.
    pub async fn get_workflow_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.inner.executions.list_executions(workflow_id).await?)
    }

    /// Ids of executions that have not ended yet.
    pub fn active_executions(&self) -> Vec<String> {
        self.inner.handles.active_ids()
    }

    pub async fn get_all_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.inner.workflows.list_workflows().await?)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        self.inner.load_workflow(workflow_id).await
    }

    pub async fn get_workflow_by_name(&self, name: &str) -> Result<Workflow, EngineError> {
        self.inner
            .workflows
            .find_workflow_by_name(name)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))
    }

    /// Unknown types are only fatal at dispatch; executors may be registered later.
    fn warn_unknown_types(&self, definition: &WorkflowDefinition) {
        for step in &definition.steps {
            if !self.inner.registry.contains(&step.step_type) {
                warn!(
                    "Step '{}' uses step type '{}' which has no registered executor",
                    step.name, step.step_type
                );
            }
        }
    }
}

/// Exclusive access to one workflow's catalog entry.
///
/// The lock map entry is dropped on release once nobody else holds or
/// waits for it.
struct WorkflowGuard<'a> {
    locks: &'a WorkflowLocks,
    workflow_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for WorkflowGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        if locks
            .get(&self.workflow_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.workflow_id);
        }
    }
}

/// Mirrors retry notices into the execution record.
struct RecordObserver<'a> {
    inner: &'a Inner,
    handle: &'a ExecutionHandle,
}

#[async_trait]
impl StepObserver for RecordObserver<'_> {
    async fn retrying(&self, step: &str, failed_attempt: u32, _error: &StepError) {
        self.inner
            .update_record(self.handle, |record| record.record_step_retry(step, failed_attempt))
            .await;
    }
}

impl Inner {
    async fn lock_workflow(&self, workflow_id: &str) -> WorkflowGuard<'_> {
        let lock = self
            .workflow_locks
            .lock()
            .entry(workflow_id.to_string())
            .or_default()
            .clone();

        WorkflowGuard {
            locks: &self.workflow_locks,
            workflow_id: workflow_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        self.workflows
            .find_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn save_record(&self, record: &WorkflowExecution) {
        if let Err(e) = self.executions.save_execution(record).await {
            error!("Failed to persist execution {}: {}", record.id, e);
        }
    }

    /// Applies `update` to a live record and persists it.
    ///
    /// Returns false without touching the record once it is terminal.
    async fn update_record<F>(&self, handle: &ExecutionHandle, update: F) -> bool
    where
        F: FnOnce(&mut WorkflowExecution) + Send,
    {
        let mut record = handle.record.lock().await;
        if record.status.is_terminal() {
            return false;
        }
        update(&mut *record);
        self.save_record(&record).await;
        true
    }

    /// Folds a terminal execution into its workflow's counters.
    async fn record_outcome(&self, execution: &WorkflowExecution) {
        let _guard = self.lock_workflow(&execution.workflow_id).await;

        let mut workflow = match self.workflows.find_workflow(&execution.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                warn!(
                    "Workflow {} disappeared before execution {} was counted",
                    execution.workflow_id, execution.id
                );
                return;
            }
            Err(e) => {
                error!("Failed to load workflow {}: {}", execution.workflow_id, e);
                return;
            }
        };

        workflow.record_execution(
            execution.status,
            execution.duration_ms.unwrap_or(0),
            execution.completed_at.unwrap_or_else(Utc::now),
        );
        if let Err(e) = self.workflows.save_workflow(&workflow).await {
            error!("Failed to update counters of workflow {}: {}", workflow.id, e);
        }
    }

    /// Background task body of one execution.
    async fn drive(
        self: Arc<Self>,
        handle: Arc<ExecutionHandle>,
        definition: Arc<WorkflowDefinition>,
        plan: ExecutionPlan,
        input: Context,
    ) -> WorkflowExecution {
        // Input wins over definition variables
        let mut seed = definition.variables.clone();
        seed.extend(input);

        let started = self
            .update_record(&handle, |record| {
                if let Err(e) = record.start(seed.clone()) {
                    error!("Execution {}: {}", record.id, e);
                }
            })
            .await;
        if !started {
            info!("Execution {} was cancelled before it started", handle.id);
            return self.finalize(&handle, RunOutcome::Cancelled).await;
        }

        info!(
            "Execution {} running: {} steps in {} waves",
            handle.id,
            plan.step_count(),
            plan.waves().len()
        );

        let deadline = definition
            .timeout_seconds
            .or(self.config.default_workflow_timeout_secs);
        let run_token = handle.token.child_token();
        let run = self.run_waves(&handle, &definition, &plan, seed, run_token.clone());

        let outcome = match deadline {
            Some(seconds) => match tokio::time::timeout(Duration::from_secs(seconds), run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    run_token.cancel();
                    warn!("Execution {} timed out after {}s", handle.id, seconds);
                    RunOutcome::TimedOut {
                        message: format!("Workflow timed out after {}s", seconds),
                        details: json!({
                            "kind": FailureKind::WorkflowTimeout,
                            "timeoutSeconds": seconds,
                        }),
                    }
                }
            },
            None => run.await,
        };

        self.finalize(&handle, outcome).await
    }

    /// Runs the plan wave by wave against a shared context.
    async fn run_waves(
        self: &Arc<Self>,
        handle: &Arc<ExecutionHandle>,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        mut context: Context,
        token: CancellationToken,
    ) -> RunOutcome {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_steps));

        for (wave_index, wave) in plan.waves().iter().enumerate() {
            if token.is_cancelled() {
                return RunOutcome::Cancelled;
            }
            debug!(
                "Execution {}: wave {} with {} steps",
                handle.id,
                wave_index,
                wave.len()
            );

            let snapshot = Arc::new(context.clone());
            let wave_token = token.child_token();
            let mut tasks = JoinSet::new();
            let mut patches: Vec<Option<Context>> = vec![None; wave.len()];
            let mut escalation: Option<RunOutcome> = None;

            for (slot, &index) in wave.iter().enumerate() {
                let step = &definition.steps[index];

                if let Some(condition) = &step.condition {
                    match expression::evaluate_condition(condition, &snapshot) {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(
                                "Execution {}: skipping step '{}' (condition false)",
                                handle.id, step.name
                            );
                            self.update_record(handle, |record| {
                                record.record_step_settled(&step.name, StepStatus::Skipped, 0, None)
                            })
                            .await;
                            continue;
                        }
                        Err(source) => {
                            let err = StepError::Expression {
                                step: step.name.clone(),
                                source,
                            };
                            if let Some(outcome) = self.step_failed(handle, step, &err, 0, &mut escalation).await {
                                wave_token.cancel();
                                tasks.shutdown().await;
                                return outcome;
                            }
                            continue;
                        }
                    }
                }

                let retries = step.retry_count.or(definition.retry_count).unwrap_or(0);
                let policy = RetryPolicy::from_config(&self.config, retries);
                let timeout = step_timeout(step, &self.config);
                let scope = StepScope::new(
                    handle.id.clone(),
                    wave_token.clone(),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.config),
                )
                .with_default_retries(definition.retry_count.unwrap_or(0));

                let inner = Arc::clone(self);
                let handle = Arc::clone(handle);
                let step = step.clone();
                let context = Arc::clone(&snapshot);
                let permits = Arc::clone(&permits);

                tasks.spawn(async move {
                    let permit = tokio::select! {
                        permit = permits.acquire_owned() => permit.ok(),
                        _ = scope.cancellation.cancelled() => None,
                    };
                    let Some(_permit) = permit else {
                        return (slot, Err(StepError::Cancelled), 0);
                    };

                    inner
                        .update_record(&handle, |record| record.record_step_started(&step.name))
                        .await;
                    let observer = RecordObserver {
                        inner: &inner,
                        handle: &handle,
                    };
                    let outcome = run_step(&step, &context, &scope, &policy, timeout, Some(&observer)).await;
                    (slot, outcome.result, outcome.attempts)
                });
            }

            loop {
                let joined = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tasks.shutdown().await;
                        return RunOutcome::Cancelled;
                    }
                    joined = tasks.join_next() => joined,
                };
                let Some(joined) = joined else { break };

                let (slot, result, attempts) = match joined {
                    Ok(settled) => settled,
                    Err(e) => {
                        error!("Execution {}: step task failed: {}", handle.id, e);
                        wave_token.cancel();
                        tasks.shutdown().await;
                        return RunOutcome::Failed {
                            message: format!("Step task failed: {}", e),
                            details: json!({
                                "kind": FailureKind::StepExecutionFailed,
                                "error": e.to_string(),
                            }),
                        };
                    }
                };
                let step = &definition.steps[wave[slot]];

                match result {
                    Ok(patch) => {
                        debug!(
                            "Execution {}: step '{}' completed after {} attempt(s)",
                            handle.id, step.name, attempts
                        );
                        self.update_record(handle, |record| {
                            record.record_step_settled(&step.name, StepStatus::Completed, attempts, None)
                        })
                        .await;
                        patches[slot] = Some(patch);
                    }
                    Err(StepError::Cancelled) if token.is_cancelled() => {
                        tasks.shutdown().await;
                        return RunOutcome::Cancelled;
                    }
                    Err(err) => {
                        if let Some(outcome) = self.step_failed(handle, step, &err, attempts, &mut escalation).await {
                            wave_token.cancel();
                            tasks.shutdown().await;
                            return outcome;
                        }
                    }
                }
            }

            // Merge in declaration order, independent of completion order
            for patch in patches.into_iter().flatten() {
                context.extend(patch);
            }
            let merged = context.clone();
            self.update_record(handle, move |record| record.merge_wave(merged)).await;

            if let Some(outcome) = escalation {
                info!(
                    "Execution {}: stopping after wave {} due to a failed step",
                    handle.id, wave_index
                );
                return outcome;
            }
        }

        RunOutcome::Completed(context)
    }

    /// Records a failed step and applies its `onError` policy.
    ///
    /// Returns an outcome when the execution must end immediately.
    async fn step_failed(
        &self,
        handle: &ExecutionHandle,
        step: &WorkflowStep,
        err: &StepError,
        attempts: u32,
        escalation: &mut Option<RunOutcome>,
    ) -> Option<RunOutcome> {
        warn!(
            "Execution {}: step '{}' failed after {} attempt(s): {}",
            handle.id, step.name, attempts, err
        );
        let message = err.to_string();
        self.update_record(handle, |record| {
            record.record_step_settled(&step.name, StepStatus::Failed, attempts, Some(message))
        })
        .await;

        match step.on_error {
            OnError::Continue => {
                info!(
                    "Execution {}: continuing past failed step '{}'",
                    handle.id, step.name
                );
                None
            }
            OnError::FailWorkflow => {
                if escalation.is_none() {
                    *escalation = Some(RunOutcome::from_step_error(&step.name, err));
                }
                None
            }
            OnError::FailFast => Some(RunOutcome::from_step_error(&step.name, err)),
        }
    }

    /// Writes the outcome to the record unless it is already terminal.
    async fn finalize(&self, handle: &ExecutionHandle, outcome: RunOutcome) -> WorkflowExecution {
        let mut record = handle.record.lock().await;
        if record.status.is_terminal() {
            let snapshot = record.clone();
            drop(record);
            self.handles.remove(&handle.id);
            return snapshot;
        }

        let transition = match outcome {
            RunOutcome::Completed(context) => record.complete(context),
            RunOutcome::Failed { message, details } => record.fail(message, details),
            RunOutcome::TimedOut { message, details } => record.time_out(message, details),
            RunOutcome::Cancelled => record.cancel(),
        };
        if let Err(e) = transition {
            error!("Execution {}: {}", handle.id, e);
        }
        self.save_record(&record).await;
        let snapshot = record.clone();
        drop(record);

        info!(
            "Execution {} finished: {} ({} of {} steps, {} ms)",
            snapshot.id,
            snapshot.status,
            snapshot.completed_steps,
            snapshot.total_steps,
            snapshot.duration_ms.unwrap_or(0)
        );

        self.record_outcome(&snapshot).await;
        self.handles.remove(&handle.id);
        snapshot
    }
}
