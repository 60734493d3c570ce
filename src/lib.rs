//! FlowRunner - Asynchronous Workflow Orchestration Engine
//!
//! Runs declarative workflows: named steps with dependencies, optional
//! conditions, timeouts, retries, and error policies. Independent steps run
//! concurrently; dependent steps wait for their dependencies. Every run is
//! tracked as an execution record with per-step outcomes and a timeline.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Definitions, parsing, validation, wave planning, and execution records
//! - [`execution`]: Orchestrator, step executors, retries, and cancellation
//! - [`store`]: Persistence of workflows and executions (in memory or on disk)
//! - [`monitoring`]: Step timeline for overlap checks and Gantt charts
//! - [`config`]: Engine defaults from file and environment
//! - [`error`]: Error types shared across modules
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::{load_definition, EchoAgent, EngineConfig, ExecutorRegistry, Orchestrator};
//! use flowrunner::workflow::Context;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow definition from YAML
//!     let definition = load_definition("pipeline.yaml")?;
//!
//!     // Create the orchestrator with the built-in step kinds
//!     let registry = ExecutorRegistry::with_builtins(Arc::new(EchoAgent));
//!     let orchestrator = Orchestrator::in_memory(registry, EngineConfig::resolve());
//!
//!     let name = definition.name.clone();
//!     let workflow = orchestrator.create_workflow(&name, "", definition).await?;
//!     orchestrator.activate_workflow(&workflow.id).await?;
//!
//!     // Execute the workflow and wait for it to finish
//!     let execution = orchestrator
//!         .execute_workflow(&workflow.id, Context::new())
//!         .await?
//!         .wait()
//!         .await?;
//!     println!("{}: {}", execution.id, execution.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, StepError};
pub use execution::{EchoAgent, ExecutorRegistry, Orchestrator, StepExecutor};
pub use workflow::model::{Workflow, WorkflowDefinition, WorkflowStep};
pub use workflow::parser::load_definition;
pub use workflow::state::{ExecutionStatus, WorkflowExecution};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowRunner");
    }

    #[test]
    fn test_module_exports_step() {
        let step = WorkflowStep::new("test", "script").with_parameter("expression", "1");
        assert_eq!(step.name, "test");
        assert_eq!(step.step_type.as_str(), "script");
    }

    #[test]
    fn test_module_exports_definition() {
        let definition = WorkflowDefinition::new("empty");
        assert!(definition.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
