//! Workflow definition validation and ordering
//!
//! Validates definitions for structural correctness:
//! - dependency references resolve, with did-you-mean hints on typos
//! - the `depends_on` graph is a DAG (cycle members are named)
//! - entry point resolves
//! - retry policies and timeouts are within bounds
//!
//! Also computes the deterministic topological order the engine executes:
//! Kahn's algorithm with ties broken by step declaration order. The order
//! is fixed for the life of an instance.

use std::collections::{HashMap, HashSet};

use petgraph::algo;
use petgraph::graph::DiGraph;
use thiserror::Error;

use maestro_domain::{StepType, WorkflowDefinition};

// =============================================================================
// Errors
// =============================================================================

/// Structural defects that reject a definition at registration or
/// submission time
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow must have at least one step")]
    NoSteps,

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("step '{step_id}' depends on unknown step '{dependency}'{}", hint(.suggestion))]
    UnknownDependency {
        step_id: String,
        dependency: String,
        suggestion: Option<String>,
    },

    #[error("entry point '{entry_point}' not found in steps{}", hint(.suggestion))]
    UnknownEntryPoint {
        entry_point: String,
        suggestion: Option<String>,
    },

    #[error("workflow contains a dependency cycle involving steps: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error(
        "step '{0}' has an invalid retry policy: require max_attempts >= 1, \
         delay_seconds >= 1, backoff_multiplier >= 1.0, max_delay_seconds >= delay_seconds"
    )]
    InvalidRetryPolicy(String),

    #[error("step '{0}' timeout must be greater than 0")]
    ZeroTimeout(String),

    #[error("parallel step '{0}' defines no sub-tasks under task_args.tasks")]
    NoParallelTasks(String),
}

fn hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

/// Pick the step id most plausibly intended by a bad reference
///
/// A candidate qualifies when its edit distance stays within a third of
/// the reference's length (at least 2, so one-letter ids still match
/// their typos); anything further is noise, not a hint.
fn closest_step_id(target: &str, step_ids: &HashSet<&str>) -> Option<String> {
    let cutoff = (target.len() / 3).max(2);

    step_ids
        .iter()
        .map(|&id| (strsim::levenshtein(target, id), id))
        .filter(|(distance, _)| *distance <= cutoff)
        .min()
        .map(|(_, id)| id.to_string())
}

// =============================================================================
// Validation
// =============================================================================

/// Validate an entire workflow definition
///
/// Runs all checks and returns the first error found.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.steps.is_empty() {
        return Err(ValidationError::NoSteps);
    }

    validate_unique_ids(def)?;
    validate_dependency_references(def)?;
    validate_entry_point(def)?;
    validate_dag(def)?;
    validate_step_settings(def)?;
    Ok(())
}

/// Validate that step ids are unique within the definition
fn validate_unique_ids(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for step in &def.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }
    Ok(())
}

/// Validate that all `depends_on` references resolve to existing steps
fn validate_dependency_references(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    let step_ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &def.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(ValidationError::SelfDependency(step.id.clone()));
            }
            if !step_ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                    suggestion: closest_step_id(dep, &step_ids),
                });
            }
        }
    }
    Ok(())
}

/// Validate that the configured entry point exists
fn validate_entry_point(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if let Some(entry) = &def.entry_point {
        let step_ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
        if !step_ids.contains(entry.as_str()) {
            return Err(ValidationError::UnknownEntryPoint {
                entry_point: entry.clone(),
                suggestion: closest_step_id(entry, &step_ids),
            });
        }
    }
    Ok(())
}

/// Validate the dependency graph forms a DAG (no cycles)
fn validate_dag(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    let graph = build_dependency_graph(def);

    if algo::is_cyclic_directed(&graph) {
        // Name the cycle using strongly connected components
        let sccs = algo::kosaraju_scc(&graph);
        let cycle_members: Vec<String> = sccs
            .iter()
            .find(|scc| scc.len() > 1)
            .map(|scc| scc.iter().map(|&idx| graph[idx].to_string()).collect())
            .unwrap_or_default();

        return Err(ValidationError::DependencyCycle(cycle_members));
    }

    Ok(())
}

/// Build a petgraph DiGraph with an edge per dependency (dep -> dependent)
fn build_dependency_graph(def: &WorkflowDefinition) -> DiGraph<&str, ()> {
    let mut graph = DiGraph::new();
    let mut node_indices = HashMap::new();

    for step in &def.steps {
        let idx = graph.add_node(step.id.as_str());
        node_indices.insert(step.id.as_str(), idx);
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if let (Some(&dep_idx), Some(&step_idx)) = (
                node_indices.get(dep.as_str()),
                node_indices.get(step.id.as_str()),
            ) {
                graph.add_edge(dep_idx, step_idx, ());
            }
        }
    }

    graph
}

/// Validate per-step settings
fn validate_step_settings(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    for step in &def.steps {
        if step.timeout_seconds == 0 {
            return Err(ValidationError::ZeroTimeout(step.id.clone()));
        }

        if !step.retry_policy.is_valid() {
            return Err(ValidationError::InvalidRetryPolicy(step.id.clone()));
        }

        if step.step_type == StepType::Parallel && step.parallel_tasks().is_empty() {
            return Err(ValidationError::NoParallelTasks(step.id.clone()));
        }
    }

    Ok(())
}

// =============================================================================
// Topological Order
// =============================================================================

/// Compute the execution order with Kahn's algorithm
///
/// Ties break by the order steps appear in `def.steps`, so the result is
/// deterministic for a given definition. Assumes the definition already
/// validated as a DAG; any cycle remainder is appended in declaration
/// order so the engine can still fail it deterministically.
#[must_use]
pub fn topological_order(def: &WorkflowDefinition) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in &def.steps {
        in_degree.insert(step.id.as_str(), step.depends_on.len());
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut order = Vec::with_capacity(def.steps.len());
    let mut emitted: HashSet<&str> = HashSet::new();

    while order.len() < def.steps.len() {
        // Lowest declaration index among ready steps wins the tie
        let next = def
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .find(|id| !emitted.contains(id) && in_degree.get(id) == Some(&0));

        let Some(next) = next else {
            // Cycle remainder: append in declaration order
            for step in &def.steps {
                if !emitted.contains(step.id.as_str()) {
                    order.push(step.id.clone());
                }
            }
            break;
        };

        emitted.insert(next);
        order.push(next.to_string());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d = d.saturating_sub(1);
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_domain::{RetryPolicy, StepSpec};

    fn linear_def() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "linear",
            "content",
            vec![
                StepSpec::new("a", "A", StepType::Analysis, "tasks.a"),
                StepSpec::new("b", "B", StepType::Analysis, "tasks.b")
                    .with_depends_on(vec!["a".to_string()]),
                StepSpec::new("c", "C", StepType::Analysis, "tasks.c")
                    .with_depends_on(vec!["b".to_string()]),
            ],
        )
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate_definition(&linear_def()).is_ok());
    }

    #[test]
    fn test_empty_steps_rejected() {
        let def = WorkflowDefinition::new("empty", "content", vec![]);
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::NoSteps));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut def = linear_def();
        def.steps[1].id = "a".to_string();
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn test_unknown_dependency_with_suggestion() {
        let mut def = linear_def();
        def.steps[2].depends_on = vec!["aa".to_string()];

        let err = validate_definition(&def).unwrap_err();
        let ValidationError::UnknownDependency {
            step_id,
            dependency,
            suggestion,
        } = &err
        else {
            panic!("Expected UnknownDependency, got {err}");
        };
        assert_eq!(step_id, "c");
        assert_eq!(dependency, "aa");
        assert_eq!(suggestion.as_deref(), Some("a"));
        assert!(err.to_string().contains("did you mean 'a'"));
    }

    #[test]
    fn test_no_suggestion_for_distant_typo() {
        let mut def = linear_def();
        def.steps[2].depends_on = vec!["preprocess".to_string()];

        let err = validate_definition(&def).unwrap_err();
        let ValidationError::UnknownDependency { suggestion, .. } = &err else {
            panic!("Expected UnknownDependency, got {err}");
        };
        assert!(suggestion.is_none());
        assert!(!err.to_string().contains("did you mean"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut def = linear_def();
        def.steps[0].depends_on = vec!["a".to_string()];
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::SelfDependency(id) if id == "a"));
    }

    #[test]
    fn test_cycle_detection_names_members() {
        let mut def = linear_def();
        def.steps[0].depends_on = vec!["c".to_string()];
        let err = validate_definition(&def).unwrap_err();
        let ValidationError::DependencyCycle(members) = &err else {
            panic!("Expected DependencyCycle, got {err}");
        };
        assert!(members.iter().any(|m| m == "a"));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_entry_point_must_resolve() {
        let mut def = linear_def();
        def.entry_point = Some("bb".to_string());
        let err = validate_definition(&def).unwrap_err();
        let ValidationError::UnknownEntryPoint {
            entry_point,
            suggestion,
        } = &err
        else {
            panic!("Expected UnknownEntryPoint, got {err}");
        };
        assert_eq!(entry_point, "bb");
        assert_eq!(suggestion.as_deref(), Some("b"));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let mut def = linear_def();
        def.steps[0].retry_policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRetryPolicy(id) if id == "a"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut def = linear_def();
        def.steps[0].timeout_seconds = 0;
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::ZeroTimeout(id) if id == "a"));
    }

    #[test]
    fn test_parallel_requires_tasks() {
        let mut def = linear_def();
        def.steps[0].step_type = StepType::Parallel;
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::NoParallelTasks(id) if id == "a"));
    }

    #[test]
    fn test_topological_order_linear() {
        assert_eq!(topological_order(&linear_def()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topological_order_tie_break_by_declaration() {
        let def = WorkflowDefinition::new(
            "diamond",
            "content",
            vec![
                StepSpec::new("root", "Root", StepType::Analysis, "tasks.root"),
                StepSpec::new("right", "Right", StepType::Analysis, "tasks.right")
                    .with_depends_on(vec!["root".to_string()]),
                StepSpec::new("left", "Left", StepType::Analysis, "tasks.left")
                    .with_depends_on(vec!["root".to_string()]),
                StepSpec::new("join", "Join", StepType::Analysis, "tasks.join")
                    .with_depends_on(vec!["left".to_string(), "right".to_string()]),
            ],
        );

        // "right" is declared before "left", so it wins the tie
        assert_eq!(topological_order(&def), vec!["root", "right", "left", "join"]);
    }

    #[test]
    fn test_topological_order_respects_all_dependencies() {
        let def = linear_def();
        let order = topological_order(&def);
        for step in &def.steps {
            let pos = order.iter().position(|s| s == &step.id).unwrap();
            for dep in &step.depends_on {
                let dep_pos = order.iter().position(|s| s == dep).unwrap();
                assert!(dep_pos < pos, "{dep} must precede {}", step.id);
            }
        }
    }
}
