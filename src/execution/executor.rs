//! Step Executor Contract
//!
//! A step executor turns one [`WorkflowStep`] plus a read-only view of the
//! context into a patch that the orchestrator merges back. Executors are
//! registered by step type; dispatching an unregistered type fails with
//! [`StepError::UnknownStepType`].
//!
//! # Implementing an executor
//!
//! ```rust
//! use async_trait::async_trait;
//! use flowrunner::execution::{StepExecutor, StepScope};
//! use flowrunner::error::StepError;
//! use flowrunner::workflow::{Context, WorkflowStep};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl StepExecutor for Echo {
//!     async fn execute(
//!         &self,
//!         step: &WorkflowStep,
//!         _context: &Context,
//!         _scope: &StepScope,
//!     ) -> Result<Context, StepError> {
//!         let mut patch = Context::new();
//!         patch.insert(step.output_key().to_string(), "echo".into());
//!         Ok(patch)
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::builtin::{
    AgentCommandExecutor, AgentInvoker, ConditionExecutor, LoopExecutor, ParallelExecutor,
    ScriptExecutor,
};
use crate::config::EngineConfig;
use crate::error::StepError;
use crate::workflow::{Context, StepType, WorkflowStep};

/// Executes one kind of step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs a single attempt of `step` and returns the context patch.
    ///
    /// The context is the snapshot taken when the step's wave started.
    /// Long-running executors should watch `scope.cancellation`.
    async fn execute(
        &self,
        step: &WorkflowStep,
        context: &Context,
        scope: &StepScope,
    ) -> Result<Context, StepError>;
}

/// Everything an executor may need besides the step and the context.
#[derive(Clone)]
pub struct StepScope {
    /// Id of the execution this step belongs to
    pub execution_id: String,
    /// Fires when the execution is cancelled, timed out, or its wave fails fast
    pub cancellation: CancellationToken,
    /// Registry used to dispatch nested steps
    pub registry: Arc<ExecutorRegistry>,
    pub config: Arc<EngineConfig>,
    /// Current attempt number (1-based)
    pub attempt: u32,
    /// Retry budget of the workflow definition, for nested steps without their own
    pub default_retries: u32,
}

impl StepScope {
    pub fn new(
        execution_id: impl Into<String>,
        cancellation: CancellationToken,
        registry: Arc<ExecutorRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            cancellation,
            registry,
            config,
            attempt: 1,
            default_retries: 0,
        }
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Same scope, tagged with another attempt number.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Check if execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl std::fmt::Debug for StepScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScope")
            .field("execution_id", &self.execution_id)
            .field("attempt", &self.attempt)
            .field("default_retries", &self.default_retries)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Step executors keyed by step type.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in step kinds.
    ///
    /// `agent-command` steps are delegated to `agents`.
    pub fn with_builtins(agents: Arc<dyn AgentInvoker>) -> Self {
        let mut registry = Self::new();
        registry.register(StepType::AgentCommand, AgentCommandExecutor::new(agents));
        registry.register(StepType::Condition, ConditionExecutor);
        registry.register(StepType::Loop, LoopExecutor);
        registry.register(StepType::Parallel, ParallelExecutor);
        registry.register(StepType::Script, ScriptExecutor);
        registry
    }

    /// Registers an executor for a step type.
    ///
    /// If an executor for the same type already exists, it is replaced.
    pub fn register<E: StepExecutor + 'static>(&mut self, step_type: impl Into<StepType>, executor: E) {
        self.register_arc(step_type, Arc::new(executor));
    }

    /// Registers an executor from an Arc.
    pub fn register_arc(&mut self, step_type: impl Into<StepType>, executor: Arc<dyn StepExecutor>) {
        let key = step_type.into().as_str().to_string();
        self.executors.insert(key, executor);
    }

    /// Looks up the executor for a step type.
    pub fn get(&self, step_type: &StepType) -> Result<Arc<dyn StepExecutor>, StepError> {
        self.executors
            .get(step_type.as_str())
            .cloned()
            .ok_or_else(|| StepError::UnknownStepType(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &StepType) -> bool {
        self.executors.contains_key(step_type.as_str())
    }

    /// Registered step types, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Builds a one-entry patch.
pub fn single_patch(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Context {
    let mut patch = Context::new();
    patch.insert(key.into(), value.into());
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::builtin::EchoAgent;

    struct Constant;

    #[async_trait]
    impl StepExecutor for Constant {
        async fn execute(
            &self,
            step: &WorkflowStep,
            _context: &Context,
            _scope: &StepScope,
        ) -> Result<Context, StepError> {
            Ok(single_patch(step.output_key(), 7))
        }
    }

    fn scope(registry: ExecutorRegistry) -> StepScope {
        StepScope::new(
            "exec-1",
            CancellationToken::new(),
            Arc::new(registry),
            Arc::new(EngineConfig::default()),
        )
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ExecutorRegistry::with_builtins(Arc::new(EchoAgent));
        assert_eq!(
            registry.kinds(),
            vec!["agent-command", "condition", "loop", "parallel", "script"]
        );
        assert!(registry.contains(&StepType::Loop));
        assert!(!registry.contains(&StepType::from("http")));
    }

    #[test]
    fn test_unknown_step_type() {
        let registry = ExecutorRegistry::new();
        assert!(registry.is_empty());
        match registry.get(&StepType::from("mystery")) {
            Err(StepError::UnknownStepType(kind)) => assert_eq!(kind, "mystery"),
            _ => panic!("Expected UnknownStepType"),
        }
    }

    #[tokio::test]
    async fn test_register_custom_and_dispatch() {
        let mut registry = ExecutorRegistry::new();
        registry.register("constant", Constant);
        assert_eq!(registry.len(), 1);

        let step = WorkflowStep::new("c", "constant");
        let executor = registry.get(&step.step_type).unwrap();
        let scope = scope(registry);
        let patch = executor.execute(&step, &Context::new(), &scope).await.unwrap();

        assert_eq!(patch["c"], 7);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ExecutorRegistry::with_builtins(Arc::new(EchoAgent));
        registry.register(StepType::Script, Constant);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_scope_for_attempt() {
        let scope = scope(ExecutorRegistry::new());
        let retry = scope.for_attempt(3);

        assert_eq!(scope.attempt, 1);
        assert_eq!(retry.attempt, 3);
        assert_eq!(retry.execution_id, "exec-1");
        assert_eq!(scope.clone().with_default_retries(2).for_attempt(2).default_retries, 2);

        scope.cancellation.cancel();
        assert!(retry.is_cancelled());
    }
}
