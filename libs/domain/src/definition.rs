//! Workflow definition models
//!
//! A definition is the declarative DAG template from which instances are
//! created. Definitions are immutable once registered; edits produce a new
//! logical version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::enums::StepType;
use crate::ids::DefinitionId;

/// Default per-step timeout (1 hour)
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3600;

/// Default workflow timeout (2 hours)
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 7200;

/// Default bound on concurrent sub-tasks inside a parallel step
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 5;

// =============================================================================
// Retry Policy
// =============================================================================

/// Retry configuration for workflow steps
///
/// Attempt `n` (1-indexed) that fails sleeps
/// `min(delay_seconds * backoff_multiplier^(n-1), max_delay_seconds)`
/// before the next attempt, until `max_attempts` is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_seconds: 60,
            backoff_multiplier: 2.0,
            max_delay_seconds: 3600,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Check the bounds required of every registered policy
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.max_attempts >= 1
            && self.delay_seconds >= 1
            && self.backoff_multiplier >= 1.0
            && self.max_delay_seconds >= self.delay_seconds
    }
}

// =============================================================================
// Step Spec
// =============================================================================

/// A sub-task of a `parallel` step, enumerated under `task_args.tasks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelTaskSpec {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Individual workflow step definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Opaque task name addressing the worker pool
    pub task_name: String,

    /// Static argument bundle merged over the built-in fields at dispatch
    #[serde(default)]
    pub task_args: Map<String, Value>,

    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,

    /// Step ids this step depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Optional expression evaluated against the instance context
    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Whether the instance continues when this step exhausts retries
    #[serde(default)]
    pub allow_failure: bool,
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

impl StepSpec {
    /// Create a step with defaults for everything but the addressing fields
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        step_type: StepType,
        task_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type,
            task_name: task_name.into(),
            task_args: Map::new(),
            timeout_seconds: DEFAULT_STEP_TIMEOUT_SECS,
            depends_on: Vec::new(),
            condition: None,
            retry_policy: RetryPolicy::default(),
            allow_failure: false,
        }
    }

    /// Set the static task arguments
    #[must_use]
    pub fn with_task_args(mut self, args: Map<String, Value>) -> Self {
        self.task_args = args;
        self
    }

    /// Set the dependency list
    #[must_use]
    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Set the execution condition
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Allow the instance to continue past a terminal failure of this step
    #[must_use]
    pub fn with_allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    /// Sub-tasks of a `parallel` step, parsed from `task_args.tasks`
    #[must_use]
    pub fn parallel_tasks(&self) -> Vec<ParallelTaskSpec> {
        self.task_args
            .get("tasks")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

// =============================================================================
// Workflow Definition
// =============================================================================

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: DefinitionId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,

    /// Workflow category: content, seo, ab_test, quality, ...
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,

    pub steps: Vec<StepSpec>,

    /// Id of the first step; defaults to `steps[0].id` during validation
    #[serde(default)]
    pub entry_point: Option<String>,

    #[serde(default = "default_workflow_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,

    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_workflow_timeout() -> u64 {
    DEFAULT_WORKFLOW_TIMEOUT_SECS
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL_STEPS
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    /// Create a definition with defaults for metadata fields
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        steps: Vec<StepSpec>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DefinitionId::new(),
            name: name.into(),
            description: None,
            version: default_version(),
            category: category.into(),
            tags: Vec::new(),
            steps,
            entry_point: None,
            timeout_seconds: DEFAULT_WORKFLOW_TIMEOUT_SECS,
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            created_by: None,
            created_at: now,
            updated_at: now,
            is_active: true,
        }
    }

    /// Look up a step by id
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The effective entry point: the configured one, or the first step
    #[must_use]
    pub fn effective_entry_point(&self) -> Option<&str> {
        self.entry_point
            .as_deref()
            .or_else(|| self.steps.first().map(|s| s.id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_seconds, 60);
        assert!(policy.is_valid());
    }

    #[test]
    fn test_retry_policy_bounds() {
        let bad = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(!bad.is_valid());

        let inverted = RetryPolicy {
            delay_seconds: 120,
            max_delay_seconds: 60,
            ..RetryPolicy::default()
        };
        assert!(!inverted.is_valid());
    }

    #[test]
    fn test_effective_entry_point_defaults_to_first_step() {
        let def = WorkflowDefinition::new(
            "test",
            "content",
            vec![
                StepSpec::new("a", "A", StepType::Analysis, "tasks.a"),
                StepSpec::new("b", "B", StepType::Analysis, "tasks.b"),
            ],
        );
        assert_eq!(def.effective_entry_point(), Some("a"));

        let mut def = def;
        def.entry_point = Some("b".to_string());
        assert_eq!(def.effective_entry_point(), Some("b"));
    }

    #[test]
    fn test_parallel_tasks_parsing() {
        let mut args = Map::new();
        args.insert(
            "tasks".to_string(),
            serde_json::json!([
                {"name": "tasks.keywords", "args": {"depth": 2}},
                {"name": "tasks.readability"}
            ]),
        );
        let step =
            StepSpec::new("fan", "Fan out", StepType::Parallel, "unused").with_task_args(args);

        let tasks = step.parallel_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "tasks.keywords");
        assert_eq!(tasks[0].args.get("depth"), Some(&serde_json::json!(2)));
        assert!(tasks[1].args.is_empty());
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let def = WorkflowDefinition::new(
            "seo_pipeline",
            "seo",
            vec![StepSpec::new("a", "A", StepType::Analysis, "tasks.a")],
        );
        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "seo_pipeline");
        assert_eq!(parsed.steps.len(), 1);
        assert!(parsed.is_active);
    }

    #[test]
    fn test_step_spec_deserializes_with_defaults() {
        let json = r#"{
            "id": "analyze",
            "name": "Analyze",
            "type": "analysis",
            "task_name": "tasks.analyze"
        }"#;
        let step: StepSpec = serde_json::from_str(json).unwrap();
        assert_eq!(step.timeout_seconds, DEFAULT_STEP_TIMEOUT_SECS);
        assert!(step.depends_on.is_empty());
        assert_eq!(step.retry_policy.max_attempts, 3);
        assert!(!step.allow_failure);
    }
}
