//! Workflow Validation
//!
//! Checks a definition before it enters the catalog:
//! - Definition and step field validation
//! - Expression syntax for conditions and script expressions
//! - Reference integrity and cycle detection (via the planner)
//!
//! Every problem found is reported at once; a definition that passes comes
//! back with its wave plan.

use std::collections::HashSet;

use log::{debug, info, warn};
use serde_json::Value;

use super::expression;
use super::model::{StepType, WorkflowDefinition, WorkflowStep};
use super::planner::{self, ExecutionPlan, PlanError};
use crate::error::EngineError;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflowName,
    EmptyWorkflow,
    EmptyStepName,
    DuplicateStepName(String),
    UnknownDependency { step: String, dependency: String },
    CyclicDependency(Vec<String>),
    InvalidExpression { step: String, message: String },
    ZeroTimeout(String),
    InvalidNestedStep { step: String, message: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflowName => write!(f, "Workflow has an empty name"),
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::UnknownDependency { step, dependency } => {
                write!(f, "Step '{}' depends on unknown step '{}'", step, dependency)
            }
            Self::CyclicDependency(cycle) => {
                write!(f, "Workflow contains cyclic dependencies: {}", cycle.join(" -> "))
            }
            Self::InvalidExpression { step, message } => {
                write!(f, "Step '{}' has an invalid expression: {}", step, message)
            }
            Self::ZeroTimeout(scope) => write!(f, "{} has a timeout of zero seconds", scope),
            Self::InvalidNestedStep { step, message } => {
                write!(f, "Step '{}' has an invalid nested step: {}", step, message)
            }
        }
    }
}

impl From<PlanError> for ValidationError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::DuplicateStep(name) => Self::DuplicateStepName(name),
            PlanError::UnknownDependency { step, dependency } => {
                Self::UnknownDependency { step, dependency }
            }
            PlanError::CycleDetected { cycle } => Self::CyclicDependency(cycle),
        }
    }
}

fn check_expression(step: &WorkflowStep, source: &str, errors: &mut Vec<ValidationError>) {
    if let Err(e) = expression::parse(source) {
        errors.push(ValidationError::InvalidExpression {
            step: step.name.clone(),
            message: e.to_string(),
        });
    }
}

/// Validates a single step's fields.
fn validate_step(step: &WorkflowStep) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors; // Can't report further without a name
    }

    if let Some(condition) = &step.condition {
        check_expression(step, condition, &mut errors);
    }

    if step.timeout_seconds == Some(0) {
        errors.push(ValidationError::ZeroTimeout(format!("Step '{}'", step.name)));
    }

    match &step.step_type {
        StepType::Condition => match step.parameter_str("expression") {
            Some(source) => check_expression(step, source, &mut errors),
            None => warn!("Step '{}': condition step has no expression", step.name),
        },
        StepType::Script => {
            if let Some(source) = step.parameter_str("expression") {
                check_expression(step, source, &mut errors);
            } else if step.parameter_str("command").is_none() {
                warn!("Step '{}': script has neither expression nor command", step.name);
            }
        }
        StepType::AgentCommand => {
            if step.parameter_str("command").is_none() {
                warn!("Step '{}': agent-command has no command", step.name);
            }
        }
        StepType::Loop => match step.parameters.get("step") {
            Some(nested) => validate_nested(step, nested, false, &mut errors),
            None => warn!("Step '{}': loop has no nested step", step.name),
        },
        StepType::Parallel => match step.parameters.get("steps").and_then(Value::as_array) {
            Some(nested) => {
                for value in nested {
                    validate_nested(step, value, true, &mut errors);
                }
            }
            None => warn!("Step '{}': parallel has no nested steps", step.name),
        },
        StepType::Custom(kind) => {
            debug!("Step '{}' uses custom type '{}'", step.name, kind);
        }
    }

    if step.dependencies.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.name);
    }

    errors
}

/// Validates a step embedded in a loop or parallel step's parameters.
fn validate_nested(
    parent: &WorkflowStep,
    value: &Value,
    reject_dependencies: bool,
    errors: &mut Vec<ValidationError>,
) {
    let nested: WorkflowStep = match serde_json::from_value(value.clone()) {
        Ok(nested) => nested,
        Err(e) => {
            errors.push(ValidationError::InvalidNestedStep {
                step: parent.name.clone(),
                message: e.to_string(),
            });
            return;
        }
    };

    if reject_dependencies && !nested.dependencies.is_empty() {
        errors.push(ValidationError::InvalidNestedStep {
            step: parent.name.clone(),
            message: format!("'{}' declares dependencies", nested.name),
        });
    }

    for err in validate_step(&nested) {
        errors.push(ValidationError::InvalidNestedStep {
            step: parent.name.clone(),
            message: err.to_string(),
        });
    }
}

/// Collects every validation problem in a definition.
///
/// Performs the following checks:
/// 1. Definition has a name and at least one step
/// 2. All steps have valid fields and parseable expressions
/// 3. No duplicate step names
/// 4. All dependencies point to existing steps
/// 5. No cyclic dependencies
pub fn collect_errors(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.name.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowName);
    }
    if definition.steps.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }
    if definition.timeout_seconds == Some(0) {
        errors.push(ValidationError::ZeroTimeout("Workflow".to_string()));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if !step.name.is_empty() && !seen.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(step.name.clone()));
        }
        errors.extend(validate_step(step));

        for dep in &step.dependencies {
            if !definition.steps.iter().any(|s| &s.name == dep) {
                errors.push(ValidationError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Cycles are only meaningful once references resolve
    if errors.is_empty() {
        if let Err(e) = planner::plan(&definition.steps) {
            errors.push(e.into());
        }
    }

    errors
}

/// Validates a definition and returns its execution plan.
///
/// All problems are joined into one [`EngineError::DefinitionInvalid`].
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<ExecutionPlan, EngineError> {
    info!(
        "Validating workflow '{}' with {} steps",
        definition.name,
        definition.steps.len()
    );

    let errors = collect_errors(definition);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(EngineError::DefinitionInvalid(messages.join("\n")));
    }

    let plan = planner::plan(&definition.steps)
        .map_err(|e| EngineError::DefinitionInvalid(ValidationError::from(e).to_string()))?;

    info!(
        "Workflow '{}' validated: {} steps in {} waves",
        definition.name,
        plan.step_count(),
        plan.waves().len()
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition::from_steps("test", steps)
    }

    #[test]
    fn test_valid_definition() {
        let def = definition(vec![
            WorkflowStep::new("step1", "script").with_parameter("expression", "1 + 1"),
            WorkflowStep::new("step2", "script")
                .with_parameter("expression", "step1 * 2")
                .with_condition("step1 > 0")
                .depends_on("step1"),
        ]);

        let plan = validate_definition(&def).unwrap();
        assert_eq!(plan.wave_names(), vec![vec!["step1"], vec!["step2"]]);
    }

    #[test]
    fn test_empty_workflow() {
        let def = WorkflowDefinition::new("empty");
        let errors = collect_errors(&def);
        assert_eq!(errors, vec![ValidationError::EmptyWorkflow]);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_empty_workflow_name() {
        let def = WorkflowDefinition::from_steps("  ", vec![WorkflowStep::new("a", "script")]);
        assert!(collect_errors(&def).contains(&ValidationError::EmptyWorkflowName));
    }

    #[test]
    fn test_duplicate_names() {
        let def = definition(vec![
            WorkflowStep::new("same", "script"),
            WorkflowStep::new("same", "script"),
        ]);

        let errors = collect_errors(&def);
        assert!(errors.contains(&ValidationError::DuplicateStepName("same".to_string())));
    }

    #[test]
    fn test_cyclic_dependency() {
        let def = definition(vec![
            WorkflowStep::new("a", "script").depends_on("b"),
            WorkflowStep::new("b", "script").depends_on("a"),
        ]);

        match validate_definition(&def) {
            Err(EngineError::DefinitionInvalid(message)) => {
                assert!(message.contains("cyclic"));
                assert!(message.contains("->"));
            }
            other => panic!("Expected DefinitionInvalid, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let def = definition(vec![WorkflowStep::new("step1", "script").depends_on("ghost")]);

        let result = validate_definition(&def);
        assert!(matches!(result, Err(EngineError::DefinitionInvalid(ref m)) if m.contains("ghost")));
    }

    #[test]
    fn test_invalid_condition() {
        let def = definition(vec![WorkflowStep::new("a", "script").with_condition("x ==")]);
        let errors = collect_errors(&def);
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::InvalidExpression { step, .. }] if step == "a"
        ));
    }

    #[test]
    fn test_invalid_script_expression() {
        let def = definition(vec![
            WorkflowStep::new("a", "script").with_parameter("expression", "(1 + 2")
        ]);
        assert_eq!(collect_errors(&def).len(), 1);
    }

    #[test]
    fn test_zero_timeouts() {
        let def = definition(vec![WorkflowStep::new("a", "script").with_timeout(0)]).with_timeout(0);
        let errors = collect_errors(&def);
        assert!(errors.contains(&ValidationError::ZeroTimeout("Workflow".to_string())));
        assert!(errors.contains(&ValidationError::ZeroTimeout("Step 'a'".to_string())));
    }

    #[test]
    fn test_empty_step_name() {
        let errors = validate_step(&WorkflowStep::new("  ", "script"));
        assert_eq!(errors, vec![ValidationError::EmptyStepName]);
    }

    #[test]
    fn test_custom_step_type_is_valid() {
        let def = definition(vec![WorkflowStep::new("a", "http-request")]);
        assert!(collect_errors(&def).is_empty());
    }

    #[test]
    fn test_parallel_nested_dependencies_rejected() {
        let step = WorkflowStep::new("fan", "parallel").with_parameter(
            "steps",
            json!([
                {"name": "x", "type": "script", "parameters": {"expression": "1"}},
                {"name": "y", "type": "script", "dependencies": ["x"]}
            ]),
        );
        let errors = validate_step(&step);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("declares dependencies"));
    }

    #[test]
    fn test_loop_nested_step_malformed() {
        let step = WorkflowStep::new("repeat", "loop")
            .with_parameter("iterations", 3)
            .with_parameter("step", json!({"type": "script"}));
        let errors = validate_step(&step);
        assert!(matches!(errors.as_slice(), [ValidationError::InvalidNestedStep { .. }]));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::EmptyWorkflow;
        assert_eq!(err.to_string(), "Workflow has no steps");

        let err = ValidationError::DuplicateStepName("test".to_string());
        assert!(err.to_string().contains("test"));

        let err = ValidationError::CyclicDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(
            err.to_string(),
            "Workflow contains cyclic dependencies: a -> b -> a"
        );
    }
}
