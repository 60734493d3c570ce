//! Execution Planner
//!
//! Turns a step list into waves of mutually independent steps:
//! - Dependency graph keyed by step name
//! - Reference checking (every dependency must name a step)
//! - Cycle detection with the offending cycle reported
//! - Wave layering with stable, definition-order tie-breaking
//!
//! A step lands in the first wave after all of its dependencies, so every
//! dependency appears in a strictly earlier wave. Steps without
//! dependencies form wave 0.

use std::collections::{HashMap, HashSet};

use log::debug;
use thiserror::Error;

use super::model::WorkflowStep;

/// Reasons a step list cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Cyclic dependency detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
}

/// Ordered waves of step indices into the planned step list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    waves: Vec<Vec<usize>>,
    names: Vec<String>,
}

impl ExecutionPlan {
    /// Waves of indices into the original step list.
    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }

    /// Waves as step names, for logging and assertions.
    pub fn wave_names(&self) -> Vec<Vec<&str>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|&i| self.names[i].as_str()).collect())
            .collect()
    }

    /// Index of the wave containing a step.
    pub fn wave_of(&self, step: &str) -> Option<usize> {
        let index = self.names.iter().position(|n| n == step)?;
        self.waves.iter().position(|wave| wave.contains(&index))
    }

    /// Total number of planned steps.
    pub fn step_count(&self) -> usize {
        self.names.len()
    }

    /// Returns true if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Builds the wave plan for a step list.
///
/// Uses Kahn's algorithm one layer at a time: each round takes every
/// not-yet-planned step whose dependencies are all planned, in definition
/// order. Identical inputs always yield identical plans.
pub fn plan(steps: &[WorkflowStep]) -> Result<ExecutionPlan, PlanError> {
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if index_of.insert(step.name.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStep(step.name.clone()));
        }
    }

    // Dependency indices per step, deduplicated
    let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
    for step in steps {
        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        for dep in &step.dependencies {
            let dep_index =
                *index_of
                    .get(dep.as_str())
                    .ok_or_else(|| PlanError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    })?;
            if seen.insert(dep_index) {
                deps.push(dep_index);
            }
        }
        dependencies.push(deps);
    }

    // Reverse edges and in-degrees
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut in_degree: Vec<usize> = vec![0; steps.len()];
    for (i, deps) in dependencies.iter().enumerate() {
        in_degree[i] = deps.len();
        for &dep in deps {
            dependents[dep].push(i);
        }
    }

    let mut waves: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut planned = 0;

    while !current.is_empty() {
        planned += current.len();

        let mut next = Vec::new();
        for &i in &current {
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();

        waves.push(current);
        current = next;
    }

    if planned != steps.len() {
        let cycle = find_cycle(steps, &dependencies, &in_degree);
        return Err(PlanError::CycleDetected { cycle });
    }

    let plan = ExecutionPlan {
        waves,
        names: steps.iter().map(|s| s.name.clone()).collect(),
    };
    debug!("Planned waves: {:?}", plan.wave_names());
    Ok(plan)
}

/// Walks unresolved dependencies from the first unplanned step until a
/// step repeats, then returns that loop closed on itself (`a -> b -> a`).
fn find_cycle(steps: &[WorkflowStep], dependencies: &[Vec<usize>], in_degree: &[usize]) -> Vec<String> {
    let unresolved = |i: usize| in_degree[i] > 0;

    let Some(start) = (0..steps.len()).find(|&i| unresolved(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut node = start;

    loop {
        if let Some(&at) = position.get(&node) {
            let mut cycle: Vec<String> = path[at..].iter().map(|&i| steps[i].name.clone()).collect();
            cycle.push(steps[node].name.clone());
            return cycle;
        }
        position.insert(node, path.len());
        path.push(node);

        // Every unresolved step has at least one unresolved dependency
        match dependencies[node].iter().copied().find(|&d| unresolved(d)) {
            Some(dep) => node = dep,
            None => return path.iter().map(|&i| steps[i].name.clone()).collect(),
        }
    }
}
