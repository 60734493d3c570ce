//! Built-in Step Executors
//!
//! The step kinds every registry created with
//! [`ExecutorRegistry::with_builtins`](super::ExecutorRegistry::with_builtins)
//! understands:
//!
//! | Type            | Parameters                                      |
//! |-----------------|-------------------------------------------------|
//! | `agent-command` | `agent`, `command` (`${path}` templated)        |
//! | `condition`     | `expression`                                    |
//! | `loop`          | `step`, and `iterations` or `itemsKey`          |
//! | `parallel`      | `steps`                                         |
//! | `script`        | `expression` or `command`                       |
//!
//! All of them accept `outputKey`, defaulting to the step name.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info};
use serde_json::Value;

use super::executor::{single_patch, StepExecutor, StepScope};
use super::step::{run_nested, run_shell};
use crate::error::StepError;
use crate::workflow::expression::{self, lookup, render_template};
use crate::workflow::{Context, WorkflowStep};

/// External collaborator that carries out `agent-command` steps.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Sends `command` to `agent` and returns its result.
    async fn invoke_agent(&self, agent: &str, command: &str, context: &Context) -> Result<Value, String>;
}

/// Agent that answers every command with the command text itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAgent;

#[async_trait]
impl AgentInvoker for EchoAgent {
    async fn invoke_agent(&self, agent: &str, command: &str, _context: &Context) -> Result<Value, String> {
        info!("[{}] {}", agent, command);
        Ok(Value::String(command.to_string()))
    }
}

fn required_str<'a>(step: &'a WorkflowStep, parameter: &str) -> Result<&'a str, StepError> {
    step.parameter_str(parameter)
        .ok_or_else(|| StepError::invalid_parameter(&step.name, parameter, "required string is missing"))
}

fn nested_step(step: &WorkflowStep, value: &Value, parameter: &str) -> Result<WorkflowStep, StepError> {
    serde_json::from_value(value.clone())
        .map_err(|e| StepError::invalid_parameter(&step.name, parameter, e.to_string()))
}

fn evaluate(step: &WorkflowStep, source: &str, context: &Context) -> Result<Value, StepError> {
    expression::evaluate(source, context).map_err(|source| StepError::Expression {
        step: step.name.clone(),
        source,
    })
}

/// Delegates to an [`AgentInvoker`].
pub struct AgentCommandExecutor {
    agents: Arc<dyn AgentInvoker>,
}

impl AgentCommandExecutor {
    pub fn new(agents: Arc<dyn AgentInvoker>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl StepExecutor for AgentCommandExecutor {
    async fn execute(&self, step: &WorkflowStep, context: &Context, _scope: &StepScope) -> Result<Context, StepError> {
        let agent = required_str(step, "agent")?;
        let command = render_template(required_str(step, "command")?, context);

        debug!("Step '{}': invoking agent '{}'", step.name, agent);
        let result = self
            .agents
            .invoke_agent(agent, &command, context)
            .await
            .map_err(|e| StepError::failed(&step.name, e))?;

        Ok(single_patch(step.output_key(), result))
    }
}

/// Evaluates `expression` and stores its truthiness.
pub struct ConditionExecutor;

#[async_trait]
impl StepExecutor for ConditionExecutor {
    async fn execute(&self, step: &WorkflowStep, context: &Context, _scope: &StepScope) -> Result<Context, StepError> {
        let source = required_str(step, "expression")?;
        let value = evaluate(step, source, context)?;
        Ok(single_patch(step.output_key(), expression::is_truthy(&value)))
    }
}

/// Runs a nested step once per iteration and collects the results.
///
/// Each iteration sees the step's context plus `index` and `item`. The
/// value an iteration contributes is what its nested step wrote under its
/// own output key, or the whole patch when it wrote something else.
/// Iterations whose nested condition is false contribute nothing.
pub struct LoopExecutor;

#[async_trait]
impl StepExecutor for LoopExecutor {
    async fn execute(&self, step: &WorkflowStep, context: &Context, scope: &StepScope) -> Result<Context, StepError> {
        let nested = step
            .parameters
            .get("step")
            .ok_or_else(|| StepError::invalid_parameter(&step.name, "step", "nested step is missing"))
            .and_then(|value| nested_step(step, value, "step"))?;

        let items: Vec<Value> = if let Some(key) = step.parameter_str("itemsKey") {
            match lookup(context, key) {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(StepError::invalid_parameter(
                        &step.name,
                        "itemsKey",
                        format!("'{}' is not an array: {}", key, other),
                    ))
                }
            }
        } else {
            let count = step
                .parameters
                .get("iterations")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    StepError::invalid_parameter(&step.name, "iterations", "expected a non-negative integer or itemsKey")
                })?;
            if count > scope.config.max_loop_iterations as u64 {
                return Err(StepError::invalid_parameter(
                    &step.name,
                    "iterations",
                    format!("{} exceeds the limit of {}", count, scope.config.max_loop_iterations),
                ));
            }
            (0..count).map(Value::from).collect()
        };

        if items.len() > scope.config.max_loop_iterations {
            return Err(StepError::invalid_parameter(
                &step.name,
                "itemsKey",
                format!("{} items exceed the limit of {}", items.len(), scope.config.max_loop_iterations),
            ));
        }

        debug!("Step '{}': looping {} times over '{}'", step.name, items.len(), nested.name);

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if scope.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let mut iteration = context.clone();
            iteration.insert("index".to_string(), Value::from(index));
            iteration.insert("item".to_string(), item);

            let Some(mut patch) = run_nested(&nested, &iteration, scope).await? else {
                continue;
            };
            let value = match patch.remove(nested.output_key()) {
                Some(value) if patch.is_empty() => value,
                Some(value) => {
                    patch.insert(nested.output_key().to_string(), value);
                    Value::Object(patch)
                }
                None => Value::Object(patch),
            };
            results.push(value);
        }

        Ok(single_patch(step.output_key(), results))
    }
}

/// Runs independent nested steps concurrently against the same context.
///
/// Patches are merged in declaration order; the first failing nested step
/// in declaration order fails the whole step.
pub struct ParallelExecutor;

#[async_trait]
impl StepExecutor for ParallelExecutor {
    async fn execute(&self, step: &WorkflowStep, context: &Context, scope: &StepScope) -> Result<Context, StepError> {
        let values = step
            .parameters
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| StepError::invalid_parameter(&step.name, "steps", "expected an array of steps"))?;

        let mut nested = Vec::with_capacity(values.len());
        for value in values {
            let child = nested_step(step, value, "steps")?;
            if !child.dependencies.is_empty() {
                return Err(StepError::invalid_parameter(
                    &step.name,
                    "steps",
                    format!("nested step '{}' must not declare dependencies", child.name),
                ));
            }
            nested.push(child);
        }

        debug!("Step '{}': fanning out {} nested steps", step.name, nested.len());

        let results = join_all(nested.iter().map(|child| run_nested(child, context, scope))).await;

        let mut merged = Context::new();
        for result in results {
            if let Some(patch) = result? {
                merged.extend(patch);
            }
        }
        Ok(merged)
    }
}

/// Evaluates an `expression`, or runs a shell `command`.
pub struct ScriptExecutor;

#[async_trait]
impl StepExecutor for ScriptExecutor {
    async fn execute(&self, step: &WorkflowStep, context: &Context, scope: &StepScope) -> Result<Context, StepError> {
        let value = if let Some(source) = step.parameter_str("expression") {
            evaluate(step, source, context)?
        } else if let Some(command) = step.parameter_str("command") {
            let command = render_template(command, context);
            run_shell(&scope.config.script_shell, &command, context)
                .await
                .map_err(|e| StepError::failed(&step.name, e))?
        } else {
            return Err(StepError::invalid_parameter(
                &step.name,
                "expression",
                "either 'expression' or 'command' is required",
            ));
        };

        Ok(single_patch(step.output_key(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::execution::executor::ExecutorRegistry;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Failing;

    #[async_trait]
    impl AgentInvoker for Failing {
        async fn invoke_agent(&self, agent: &str, _command: &str, _context: &Context) -> Result<Value, String> {
            Err(format!("{} is offline", agent))
        }
    }

    fn scope() -> StepScope {
        scope_with(EngineConfig::default())
    }

    fn scope_with(config: EngineConfig) -> StepScope {
        StepScope::new(
            "exec",
            CancellationToken::new(),
            Arc::new(ExecutorRegistry::with_builtins(Arc::new(EchoAgent))),
            Arc::new(config),
        )
    }

    fn context(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => Context::new(),
        }
    }

    #[tokio::test]
    async fn test_agent_command_renders_template() {
        let step = WorkflowStep::new("ask", "agent-command")
            .with_parameter("agent", "writer")
            .with_parameter("command", "greet ${user.name}")
            .with_parameter("outputKey", "greeting");
        let ctx = context(json!({"user": {"name": "ada"}}));

        let executor = AgentCommandExecutor::new(Arc::new(EchoAgent));
        let patch = executor.execute(&step, &ctx, &scope()).await.unwrap();

        assert_eq!(patch, context(json!({"greeting": "greet ada"})));
    }

    #[tokio::test]
    async fn test_agent_command_errors() {
        let step = WorkflowStep::new("ask", "agent-command").with_parameter("agent", "writer");
        let executor = AgentCommandExecutor::new(Arc::new(Failing));
        let err = executor.execute(&step, &Context::new(), &scope()).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidParameter { ref parameter, .. } if parameter == "command"));

        let step = step.with_parameter("command", "go");
        let err = executor.execute(&step, &Context::new(), &scope()).await.unwrap_err();
        assert_eq!(err, StepError::failed("ask", "writer is offline"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_condition_executor() {
        let step = WorkflowStep::new("big", "condition").with_parameter("expression", "size > 10");

        let patch = ConditionExecutor
            .execute(&step, &context(json!({"size": 12})), &scope())
            .await
            .unwrap();
        assert_eq!(patch["big"], true);

        let patch = ConditionExecutor
            .execute(&step, &context(json!({"size": 3})), &scope())
            .await
            .unwrap();
        assert_eq!(patch["big"], false);

        let bad = WorkflowStep::new("bad", "condition").with_parameter("expression", "size >");
        let err = ConditionExecutor.execute(&bad, &Context::new(), &scope()).await.unwrap_err();
        assert!(matches!(err, StepError::Expression { .. }));
    }

    #[tokio::test]
    async fn test_script_expression() {
        let step = WorkflowStep::new("sum", "script").with_parameter("expression", "a + b * 2");
        let patch = ScriptExecutor
            .execute(&step, &context(json!({"a": 1, "b": 3})), &scope())
            .await
            .unwrap();
        assert_eq!(patch["sum"], 7);
    }

    #[tokio::test]
    async fn test_script_requires_body() {
        let step = WorkflowStep::new("empty", "script");
        let err = ScriptExecutor.execute(&step, &Context::new(), &scope()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_command() {
        let config = EngineConfig {
            script_shell: "sh".to_string(),
            ..EngineConfig::default()
        };
        let step = WorkflowStep::new("shell", "script")
            .with_parameter("command", "echo \"[${n}, $FLOW_N]\"");
        let patch = ScriptExecutor
            .execute(&step, &context(json!({"n": 4})), &scope_with(config))
            .await
            .unwrap();
        assert_eq!(patch["shell"], json!([4, 4]));
    }

    #[tokio::test]
    async fn test_loop_iterations() {
        let step = WorkflowStep::new("squares", "loop")
            .with_parameter("iterations", 4)
            .with_parameter(
                "step",
                json!({"name": "sq", "type": "script", "parameters": {"expression": "index * index"}}),
            );
        let patch = LoopExecutor.execute(&step, &Context::new(), &scope()).await.unwrap();
        assert_eq!(patch["squares"], json!([0, 1, 4, 9]));
    }

    #[tokio::test]
    async fn test_loop_items_key() {
        let step = WorkflowStep::new("greet", "loop")
            .with_parameter("itemsKey", "people")
            .with_parameter(
                "step",
                json!({"name": "g", "type": "script", "parameters": {"expression": "'hi ' + item"}}),
            );
        let ctx = context(json!({"people": ["ann", "bob"]}));
        let patch = LoopExecutor.execute(&step, &ctx, &scope()).await.unwrap();
        assert_eq!(patch["greet"], json!(["hi ann", "hi bob"]));
    }

    #[tokio::test]
    async fn test_loop_limit() {
        let config = EngineConfig {
            max_loop_iterations: 3,
            ..EngineConfig::default()
        };
        let step = WorkflowStep::new("many", "loop")
            .with_parameter("iterations", 4)
            .with_parameter("step", json!({"name": "x", "type": "script", "parameters": {"expression": "1"}}));
        let err = LoopExecutor.execute(&step, &Context::new(), &scope_with(config)).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn test_loop_propagates_nested_failure() {
        let step = WorkflowStep::new("l", "loop")
            .with_parameter("iterations", 2)
            .with_parameter("step", json!({"name": "x", "type": "nope"}));
        let err = LoopExecutor.execute(&step, &Context::new(), &scope()).await.unwrap_err();
        assert_eq!(err, StepError::UnknownStepType("nope".to_string()));
    }

    #[tokio::test]
    async fn test_parallel_merges_in_order() {
        let step = WorkflowStep::new("fan", "parallel").with_parameter(
            "steps",
            json!([
                {"name": "a", "type": "script", "parameters": {"expression": "1", "outputKey": "shared"}},
                {"name": "b", "type": "script", "parameters": {"expression": "2", "outputKey": "shared"}},
                {"name": "c", "type": "condition", "parameters": {"expression": "true"}}
            ]),
        );
        let patch = ParallelExecutor.execute(&step, &Context::new(), &scope()).await.unwrap();
        assert_eq!(patch, context(json!({"shared": 2, "c": true})));
    }

    #[tokio::test]
    async fn test_nested_conditions() {
        let looped = WorkflowStep::new("evens", "loop").with_parameter("iterations", 5).with_parameter(
            "step",
            json!({"name": "x", "type": "script", "condition": "index != 1 && index != 3", "parameters": {"expression": "item * 10"}}),
        );
        let patch = LoopExecutor.execute(&looped, &Context::new(), &scope()).await.unwrap();
        assert_eq!(patch["evens"], json!([0, 20, 40]));

        let fan = WorkflowStep::new("fan", "parallel").with_parameter(
            "steps",
            json!([
                {"name": "a", "type": "script", "parameters": {"expression": "1"}},
                {"name": "b", "type": "script", "condition": "false", "parameters": {"expression": "2"}}
            ]),
        );
        let patch = ParallelExecutor.execute(&fan, &Context::new(), &scope()).await.unwrap();
        assert_eq!(patch, context(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_parallel_rejects_dependencies() {
        let step = WorkflowStep::new("fan", "parallel").with_parameter(
            "steps",
            json!([{"name": "a", "type": "script", "dependencies": ["b"]}]),
        );
        let err = ParallelExecutor.execute(&step, &Context::new(), &scope()).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidParameter { .. }));
    }
}
