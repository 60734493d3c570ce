//! Individual Step Execution
//!
//! Runs a single workflow step through its executor, handling:
//! - Retries with exponential backoff
//! - Per-attempt timeouts
//! - Cooperative cancellation (between and during attempts)
//! - Executor panics, reported as step failures
//!
//! Also hosts the shell runner used by `script` commands.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, warn};
use serde_json::Value;
use tokio::process::Command;

use super::executor::{StepExecutor, StepScope};
use super::retry::RetryPolicy;
use crate::config::EngineConfig;
use crate::error::StepError;
use crate::workflow::expression::{display_value, evaluate_condition};
use crate::workflow::{Context, WorkflowStep};

/// Receives notice of failed attempts that will be retried.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn retrying(&self, step: &str, failed_attempt: u32, error: &StepError);
}

/// Final result of running a step, with the number of executor invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub result: Result<Context, StepError>,
    pub attempts: u32,
}

/// Per-attempt timeout: the step's own, else the configured default.
pub fn step_timeout(step: &WorkflowStep, config: &EngineConfig) -> Option<Duration> {
    step.timeout_seconds
        .or(config.default_step_timeout_secs)
        .map(Duration::from_secs)
}

/// Executes a step until it succeeds, fails for good, or is cancelled.
///
/// Only retryable errors (executor failures and timeouts) are retried, up
/// to `policy.max_retries` times. Each attempt is timed independently.
/// Cancellation during an attempt or a backoff sleep ends the step with
/// [`StepError::Cancelled`].
pub async fn run_step(
    step: &WorkflowStep,
    context: &Context,
    scope: &StepScope,
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    observer: Option<&dyn StepObserver>,
) -> StepOutcome {
    let executor = match scope.registry.get(&step.step_type) {
        Ok(executor) => executor,
        Err(e) => {
            error!("Step '{}': {}", step.name, e);
            return StepOutcome {
                result: Err(e),
                attempts: 0,
            };
        }
    };

    let mut attempt = 1;
    loop {
        if scope.is_cancelled() {
            return StepOutcome {
                result: Err(StepError::Cancelled),
                attempts: attempt - 1,
            };
        }

        debug!(
            "Step '{}' attempt {}/{} (execution {})",
            step.name,
            attempt,
            policy.max_attempts(),
            scope.execution_id
        );

        let attempt_scope = scope.for_attempt(attempt);
        let result = run_attempt(executor.as_ref(), step, context, &attempt_scope, timeout).await;

        match result {
            Err(e) if e.is_retryable() && attempt < policy.max_attempts() => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Step '{}' attempt {} failed: {}. Retrying in {:?}",
                    step.name, attempt, e, delay
                );
                if let Some(observer) = observer {
                    observer.retrying(&step.name, attempt, &e).await;
                }

                tokio::select! {
                    _ = scope.cancellation.cancelled() => {
                        return StepOutcome {
                            result: Err(StepError::Cancelled),
                            attempts: attempt,
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            result => {
                return StepOutcome {
                    result,
                    attempts: attempt,
                }
            }
        }
    }
}

/// Runs one executor invocation under the timeout and the cancellation token.
async fn run_attempt(
    executor: &dyn StepExecutor,
    step: &WorkflowStep,
    context: &Context,
    scope: &StepScope,
    timeout: Option<Duration>,
) -> Result<Context, StepError> {
    let invocation = async {
        match AssertUnwindSafe(executor.execute(step, context, scope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(StepError::failed(
                &step.name,
                format!("executor panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    };

    let timed = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, invocation)
                .await
                .unwrap_or_else(|_| {
                    Err(StepError::Timeout {
                        step: step.name.clone(),
                        seconds: limit.as_secs(),
                    })
                }),
            None => invocation.await,
        }
    };

    tokio::select! {
        biased;
        _ = scope.cancellation.cancelled() => Err(StepError::Cancelled),
        result = timed => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a step embedded in a `loop` or `parallel` step.
///
/// Returns `None` when the nested step's condition is false. Retries fall
/// back to the definition's budget; failed attempts are not reported to the
/// execution record.
pub async fn run_nested(
    step: &WorkflowStep,
    context: &Context,
    scope: &StepScope,
) -> Result<Option<Context>, StepError> {
    if let Some(condition) = &step.condition {
        let run = evaluate_condition(condition, context).map_err(|source| StepError::Expression {
            step: step.name.clone(),
            source,
        })?;
        if !run {
            debug!("Nested step '{}' skipped (condition false)", step.name);
            return Ok(None);
        }
    }

    let retries = step.retry_count.unwrap_or(scope.default_retries);
    let policy = RetryPolicy::from_config(&scope.config, retries);
    let timeout = step_timeout(step, &scope.config);
    run_step(step, context, scope, &policy, timeout, None).await.result.map(Some)
}

/// Environment variable name a context key is exported under.
pub fn env_var_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("FLOW_{}", sanitized)
}

/// Runs a shell snippet with `<shell> -c` and returns its parsed stdout.
///
/// Every top-level context entry is exported as `FLOW_<KEY>`. Stdout is
/// parsed as JSON when possible, otherwise returned as trimmed text. The
/// child is killed if the returned future is dropped.
pub async fn run_shell(shell: &str, command: &str, context: &Context) -> Result<Value, String> {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command).kill_on_drop(true);
    for (key, value) in context {
        cmd.env(env_var_name(key), display_value(value));
    }

    debug!("Running shell command with {}: {}", shell, command);
    let output = cmd
        .output()
        .await
        .map_err(|e| format!("Failed to start '{}': {}", shell, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        let trimmed = stdout.trim();
        if !trimmed.is_empty() {
            debug!("Shell output:\n{}", trimmed);
        }
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!("stdout:\n{}", stdout);
        }
        Err(format!(
            "Command exited with code {:?}: {}",
            output.status.code(),
            stderr.trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::executor::{single_patch, ExecutorRegistry};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Fails the first `failures` attempts.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepExecutor for Flaky {
        async fn execute(
            &self,
            step: &WorkflowStep,
            _context: &Context,
            scope: &StepScope,
        ) -> Result<Context, StepError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(call, scope.attempt);
            if call <= self.failures {
                Err(StepError::failed(&step.name, format!("attempt {}", call)))
            } else {
                Ok(single_patch(step.output_key(), call))
            }
        }
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl StepExecutor for Sleeper {
        async fn execute(
            &self,
            _step: &WorkflowStep,
            _context: &Context,
            _scope: &StepScope,
        ) -> Result<Context, StepError> {
            tokio::time::sleep(self.0).await;
            Ok(Context::new())
        }
    }

    struct Panicker;

    #[async_trait]
    impl StepExecutor for Panicker {
        async fn execute(
            &self,
            _step: &WorkflowStep,
            _context: &Context,
            _scope: &StepScope,
        ) -> Result<Context, StepError> {
            panic!("boom");
        }
    }

    struct Bad;

    #[async_trait]
    impl StepExecutor for Bad {
        async fn execute(
            &self,
            step: &WorkflowStep,
            _context: &Context,
            _scope: &StepScope,
        ) -> Result<Context, StepError> {
            Err(StepError::invalid_parameter(&step.name, "x", "missing"))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u32>>);

    #[async_trait]
    impl StepObserver for Recorder {
        async fn retrying(&self, _step: &str, failed_attempt: u32, _error: &StepError) {
            self.0.lock().push(failed_attempt);
        }
    }

    fn scope_with(kind: &str, executor: impl StepExecutor + 'static) -> StepScope {
        let mut registry = ExecutorRegistry::new();
        registry.register(kind, executor);
        StepScope::new(
            "exec",
            CancellationToken::new(),
            Arc::new(registry),
            Arc::new(EngineConfig::default()),
        )
    }

    fn fast_retries(n: u32) -> RetryPolicy {
        RetryPolicy::new(n, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_nested_uses_definition_retries() {
        let scope = scope_with("flaky", Flaky { failures: 1, calls: AtomicU32::new(0) });
        let step = WorkflowStep::new("f", "flaky");

        assert!(run_nested(&step, &Context::new(), &scope).await.is_err());

        let scope = scope_with("flaky", Flaky { failures: 1, calls: AtomicU32::new(0) }).with_default_retries(1);
        let patch = run_nested(&step, &Context::new(), &scope).await.unwrap().unwrap();
        assert_eq!(patch["f"], 2);

        let scope = scope_with("flaky", Flaky { failures: 1, calls: AtomicU32::new(0) }).with_default_retries(3);
        let own_budget = step.clone().with_retry_count(0);
        assert!(run_nested(&own_budget, &Context::new(), &scope).await.is_err());
    }

    #[tokio::test]
    async fn test_nested_condition() {
        let scope = scope_with("flaky", Flaky { failures: 0, calls: AtomicU32::new(0) });
        let mut context = Context::new();
        context.insert("enabled".to_string(), Value::Bool(false));

        let gated = WorkflowStep::new("f", "flaky").with_condition("enabled");
        assert_eq!(run_nested(&gated, &context, &scope).await, Ok(None));

        let broken = WorkflowStep::new("f", "flaky").with_condition("enabled >");
        assert!(matches!(
            run_nested(&broken, &context, &scope).await,
            Err(StepError::Expression { .. })
        ));

        context.insert("enabled".to_string(), Value::Bool(true));
        assert!(run_nested(&gated, &context, &scope).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let scope = scope_with("flaky", Flaky { failures: 2, calls: AtomicU32::new(0) });
        let step = WorkflowStep::new("f", "flaky");
        let recorder = Recorder::default();

        let outcome = run_step(&step, &Context::new(), &scope, &fast_retries(2), None, Some(&recorder)).await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap()["f"], 3);
        assert_eq!(*recorder.0.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let scope = scope_with("flaky", Flaky { failures: 5, calls: AtomicU32::new(0) });
        let step = WorkflowStep::new("f", "flaky");

        let outcome = run_step(&step, &Context::new(), &scope, &fast_retries(1), None, None).await;

        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.result, Err(StepError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let scope = scope_with("bad", Bad);
        let step = WorkflowStep::new("b", "bad");

        let outcome = run_step(&step, &Context::new(), &scope, &fast_retries(3), None, None).await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(StepError::InvalidParameter { .. })));
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let scope = scope_with("slow", Sleeper(Duration::from_secs(30)));
        let step = WorkflowStep::new("s", "slow");

        let started = std::time::Instant::now();
        let outcome = run_step(
            &step,
            &Context::new(),
            &scope,
            &fast_retries(1),
            Some(Duration::from_millis(50)),
            None,
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.result, Err(StepError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_attempt() {
        let scope = scope_with("slow", Sleeper(Duration::from_secs(30)));
        let step = WorkflowStep::new("s", "slow");

        let token = scope.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let outcome = run_step(&step, &Context::new(), &scope, &RetryPolicy::none(), None, None).await;
        assert_eq!(outcome.result, Err(StepError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let scope = scope_with("slow", Sleeper(Duration::from_millis(1)));
        scope.cancellation.cancel();

        let outcome = run_step(&WorkflowStep::new("s", "slow"), &Context::new(), &scope, &RetryPolicy::none(), None, None).await;
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.result, Err(StepError::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_step_type() {
        let scope = scope_with("known", Bad);
        let outcome = run_step(&WorkflowStep::new("u", "unknown"), &Context::new(), &scope, &fast_retries(2), None, None).await;

        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.result, Err(StepError::UnknownStepType("unknown".to_string())));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let scope = scope_with("panic", Panicker);
        let outcome = run_step(&WorkflowStep::new("p", "panic"), &Context::new(), &scope, &RetryPolicy::none(), None, None).await;

        match outcome.result {
            Err(StepError::Failed { message, .. }) => assert!(message.contains("boom")),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_step_timeout_fallback() {
        let config = EngineConfig::default();
        assert_eq!(step_timeout(&WorkflowStep::new("a", "x"), &config), Some(Duration::from_secs(300)));
        assert_eq!(
            step_timeout(&WorkflowStep::new("a", "x").with_timeout(2), &config),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("user.name"), "FLOW_USER_NAME");
        assert_eq!(env_var_name("count"), "FLOW_COUNT");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_json_and_text() {
        let mut context = Context::new();
        context.insert("name".to_string(), Value::from("world"));

        let value = run_shell("sh", "echo '{\"n\": 2}'", &context).await.unwrap();
        assert_eq!(value["n"], 2);

        let value = run_shell("sh", "echo \"hello $FLOW_NAME\"", &context).await.unwrap();
        assert_eq!(value, "hello world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_shell_failure() {
        let err = run_shell("sh", "echo oops >&2; exit 3", &Context::new()).await.unwrap_err();
        assert!(err.contains("3"));
        assert!(err.contains("oops"));
    }
}
