//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating workflows, plus the execution record they produce.
//!
//! # Structure
//!
//! - [`model`]: Definitions, steps, and the catalogued [`Workflow`]
//! - [`state`]: Execution records and their state machine
//! - [`parser`]: YAML/JSON documents
//! - [`validator`]: Validation rules and dependency checking
//! - [`planner`]: Wave planning
//! - [`expression`]: Conditions and script expressions

pub mod expression;
pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{
    Context, OnError, StepType, Workflow, WorkflowDefinition, WorkflowStatus, WorkflowStep,
};
pub use parser::{load_definition, parse_definition, save_definition, DefinitionFormat};
pub use planner::{plan, ExecutionPlan, PlanError};
pub use state::{ExecutionStatus, StepRecord, StepStatus, WorkflowExecution};
pub use validator::validate_definition;
