//! Workflow Execution Module
//!
//! Provides the orchestrator that runs workflow executions, the executor
//! contract step kinds plug into, and the built-in step kinds.
//!
//! # Architecture
//!
//! - [`engine`]: Orchestrator driving executions wave by wave
//! - [`executor`]: `StepExecutor` trait and the registry keyed by step type
//! - [`step`]: One step's attempts, timeouts, and retries
//! - [`builtin`]: agent-command, condition, loop, parallel, and script steps
//! - [`retry`]: Exponential backoff policy
//! - [`handles`]: Live executions and their cancellation tokens

pub mod builtin;
pub mod engine;
pub mod executor;
pub mod handles;
pub mod retry;
pub mod step;

pub use builtin::{AgentInvoker, EchoAgent};
pub use engine::{Orchestrator, RunningExecution};
pub use executor::{single_patch, ExecutorRegistry, StepExecutor, StepScope};
pub use retry::RetryPolicy;
pub use step::{StepObserver, StepOutcome};
