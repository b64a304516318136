//! Workflow instance models
//!
//! An instance is one execution of a definition: its own inputs, outputs,
//! accumulated context and per-step bookkeeping. The instance record in the
//! state store is the system of record; `InstanceSnapshot` is the hot copy
//! cached in the coordination store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::definition::WorkflowDefinition;
use crate::enums::{StepStatus, WorkflowStatus};
use crate::ids::{DefinitionId, InstanceId};

// =============================================================================
// Workflow Instance
// =============================================================================

/// Running instance of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_id: DefinitionId,
    pub workflow_version: String,

    pub status: WorkflowStatus,
    pub current_step_id: Option<String>,
    /// Completion order is insertion order
    pub completed_steps: Vec<String>,
    /// Steps whose retries were exhausted
    pub failed_steps: Vec<String>,

    /// Accumulated key/value context, seeded with workflow metadata and
    /// extended by step results published under the reserved `context` key
    pub context: Map<String, Value>,
    pub input_data: Map<String, Value>,
    pub output_data: Map<String, Value>,

    /// Structured result per executed step
    pub step_results: Map<String, Value>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub retry_count: u32,

    pub triggered_by: Option<String>,
    pub parent_instance_id: Option<InstanceId>,
}

impl WorkflowInstance {
    /// Materialise a new instance from a definition
    ///
    /// The context is seeded with the definition's metadata so conditions
    /// and tasks can reference `workflow_name`, `category` and `tags`.
    #[must_use]
    pub fn new(
        def: &WorkflowDefinition,
        input_data: Map<String, Value>,
        triggered_by: Option<String>,
        parent_instance_id: Option<InstanceId>,
    ) -> Self {
        let mut context = Map::new();
        context.insert("workflow_name".to_string(), Value::from(def.name.clone()));
        context.insert("category".to_string(), Value::from(def.category.clone()));
        context.insert("tags".to_string(), Value::from(def.tags.clone()));

        Self {
            id: InstanceId::new(),
            workflow_id: def.id,
            workflow_version: def.version.clone(),
            status: WorkflowStatus::Pending,
            current_step_id: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            context,
            input_data,
            output_data: Map::new(),
            step_results: Map::new(),
            started_at: Some(Utc::now()),
            completed_at: None,
            paused_at: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            triggered_by,
            parent_instance_id,
        }
    }

    /// Record the result of a completed step
    ///
    /// A step appears in at most one of `completed_steps` and
    /// `failed_steps`; recording a completion for a step already marked
    /// failed is ignored.
    pub fn add_step_result(&mut self, step_id: &str, result: Value) {
        if self.failed_steps.iter().any(|s| s == step_id) {
            return;
        }
        self.step_results.insert(step_id.to_string(), result);
        if !self.completed_steps.iter().any(|s| s == step_id) {
            self.completed_steps.push(step_id.to_string());
        }
    }

    /// Mark a step as terminally failed
    pub fn mark_step_failed(&mut self, step_id: &str, error: &str) {
        if self.completed_steps.iter().any(|s| s == step_id) {
            return;
        }
        if !self.failed_steps.iter().any(|s| s == step_id) {
            self.failed_steps.push(step_id.to_string());
        }
        self.step_results.insert(
            step_id.to_string(),
            serde_json::json!({ "status": "failed", "error": error }),
        );
    }

    /// Merge the reserved `context` and `output` keys of a step result
    /// into the instance
    pub fn merge_step_output(&mut self, result: &Value) {
        if let Some(Value::Object(ctx)) = result.get("context") {
            for (k, v) in ctx {
                self.context.insert(k.clone(), v.clone());
            }
        }
        if let Some(Value::Object(out)) = result.get("output") {
            for (k, v) in out {
                self.output_data.insert(k.clone(), v.clone());
            }
        }
    }

    /// Check whether a step reached a settled outcome
    #[must_use]
    pub fn is_step_settled(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
            || self.failed_steps.iter().any(|s| s == step_id)
    }

    /// Progress percentage: `100 * completed / total`
    #[must_use]
    pub fn progress(&self, total_steps: usize) -> f64 {
        if total_steps == 0 {
            return 0.0;
        }
        self.completed_steps.len() as f64 / total_steps as f64 * 100.0
    }
}

// =============================================================================
// Step State
// =============================================================================

/// Per-step execution state, cached in the coordination store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            last_attempt: None,
            result: None,
            error: None,
        }
    }
}

// =============================================================================
// Instance Snapshot
// =============================================================================

/// Hot-path copy of instance state held in the coordination store
///
/// Rebuilt from the durable record on cache miss; refreshed on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub workflow_id: DefinitionId,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
    pub total_steps: usize,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub step_states: HashMap<String, StepState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InstanceSnapshot {
    /// Initial snapshot for a freshly materialised instance
    #[must_use]
    pub fn initialize(instance: &WorkflowInstance, def: &WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance.id,
            workflow_id: instance.workflow_id,
            status: instance.status,
            current_step: None,
            total_steps: def.steps.len(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            step_states: def
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepState::default()))
                .collect(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Rebuild a snapshot from the durable record after a cache miss
    #[must_use]
    pub fn from_instance(instance: &WorkflowInstance, total_steps: usize) -> Self {
        let mut step_states = HashMap::new();
        for step_id in &instance.completed_steps {
            step_states.insert(
                step_id.clone(),
                StepState {
                    status: StepStatus::Completed,
                    result: instance.step_results.get(step_id).cloned(),
                    ..StepState::default()
                },
            );
        }
        for step_id in &instance.failed_steps {
            step_states.insert(
                step_id.clone(),
                StepState {
                    status: StepStatus::Failed,
                    result: instance.step_results.get(step_id).cloned(),
                    ..StepState::default()
                },
            );
        }

        Self {
            instance_id: instance.id,
            workflow_id: instance.workflow_id,
            status: instance.status,
            current_step: instance.current_step_id.clone(),
            total_steps,
            completed_steps: instance.completed_steps.clone(),
            failed_steps: instance.failed_steps.clone(),
            step_states,
            created_at: instance.started_at.unwrap_or_else(Utc::now),
            updated_at: Utc::now(),
            completed_at: instance.completed_at,
        }
    }

    /// Fold the durable record into this snapshot, keeping the per-step
    /// attempt counters the executor has accumulated
    pub fn sync_from(&mut self, instance: &WorkflowInstance) {
        self.status = instance.status;
        self.current_step = instance.current_step_id.clone();
        self.completed_steps = instance.completed_steps.clone();
        self.failed_steps = instance.failed_steps.clone();
        self.completed_at = instance.completed_at;

        for step_id in &instance.completed_steps {
            let state = self.step_states.entry(step_id.clone()).or_default();
            state.status = StepStatus::Completed;
            if state.result.is_none() {
                state.result = instance.step_results.get(step_id).cloned();
            }
        }
        for step_id in &instance.failed_steps {
            let state = self.step_states.entry(step_id.clone()).or_default();
            state.status = StepStatus::Failed;
        }

        self.updated_at = Utc::now();
    }

    /// Update a step's state and keep the derived lists consistent
    pub fn record_step(&mut self, step_id: &str, update: StepUpdate) {
        let state = self.step_states.entry(step_id.to_string()).or_default();
        state.status = update.status;
        state.last_attempt = Some(Utc::now());
        if update.bump_attempts {
            state.attempts += 1;
        }
        if let Some(result) = update.result {
            state.result = Some(result);
        }
        if let Some(error) = update.error {
            state.error = Some(error);
        }

        match update.status {
            StepStatus::Completed => {
                if !self.completed_steps.iter().any(|s| s == step_id) {
                    self.completed_steps.push(step_id.to_string());
                }
            }
            StepStatus::Failed => {
                if !self.failed_steps.iter().any(|s| s == step_id) {
                    self.failed_steps.push(step_id.to_string());
                }
            }
            _ => {}
        }

        if update.status == StepStatus::Running {
            self.current_step = Some(step_id.to_string());
        } else if self.current_step.as_deref() == Some(step_id) {
            self.current_step = None;
        }

        self.updated_at = Utc::now();
    }
}

/// One step-state mutation applied through [`InstanceSnapshot::record_step`]
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub bump_attempts: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StepUpdate {
    /// Mark a step running and count the attempt
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: StepStatus::Running,
            bump_attempts: true,
            ..Self::default()
        }
    }

    /// Mark a step completed with its result
    #[must_use]
    pub fn completed(result: Value) -> Self {
        Self {
            status: StepStatus::Completed,
            result: Some(result),
            ..Self::default()
        }
    }

    /// Mark a step terminally failed
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Mark a step as waiting for its next retry attempt
    #[must_use]
    pub fn retrying(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Retrying,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Mark a step skipped (failed required dependency)
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepSpec;
    use crate::enums::StepType;

    fn test_def() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "test",
            "content",
            vec![
                StepSpec::new("a", "A", StepType::Analysis, "tasks.a"),
                StepSpec::new("b", "B", StepType::Analysis, "tasks.b"),
            ],
        )
    }

    #[test]
    fn test_new_instance_seeds_context() {
        let def = test_def();
        let instance = WorkflowInstance::new(&def, Map::new(), Some("user-1".to_string()), None);

        assert_eq!(instance.status, WorkflowStatus::Pending);
        assert_eq!(instance.context["workflow_name"], "test");
        assert_eq!(instance.context["category"], "content");
        assert_eq!(instance.triggered_by.as_deref(), Some("user-1"));
        assert!(instance.started_at.is_some());
    }

    #[test]
    fn test_completed_and_failed_are_disjoint() {
        let def = test_def();
        let mut instance = WorkflowInstance::new(&def, Map::new(), None, None);

        instance.mark_step_failed("a", "boom");
        instance.add_step_result("a", serde_json::json!({"status": "ok"}));

        assert_eq!(instance.failed_steps, vec!["a"]);
        assert!(instance.completed_steps.is_empty());

        instance.add_step_result("b", serde_json::json!({"status": "ok"}));
        instance.mark_step_failed("b", "boom");

        assert_eq!(instance.completed_steps, vec!["b"]);
        assert_eq!(instance.failed_steps, vec!["a"]);
    }

    #[test]
    fn test_add_step_result_is_idempotent() {
        let def = test_def();
        let mut instance = WorkflowInstance::new(&def, Map::new(), None, None);

        instance.add_step_result("a", serde_json::json!({"n": 1}));
        instance.add_step_result("a", serde_json::json!({"n": 2}));

        assert_eq!(instance.completed_steps, vec!["a"]);
        assert_eq!(instance.step_results["a"]["n"], 2);
    }

    #[test]
    fn test_merge_step_output() {
        let def = test_def();
        let mut instance = WorkflowInstance::new(&def, Map::new(), None, None);

        instance.merge_step_output(&serde_json::json!({
            "context": {"keywords": ["rust"]},
            "output": {"score": 0.9},
            "ignored": true
        }));

        assert_eq!(instance.context["keywords"], serde_json::json!(["rust"]));
        assert_eq!(instance.output_data["score"], serde_json::json!(0.9));
        assert!(!instance.output_data.contains_key("ignored"));
    }

    #[test]
    fn test_progress() {
        let def = test_def();
        let mut instance = WorkflowInstance::new(&def, Map::new(), None, None);
        assert!((instance.progress(2) - 0.0).abs() < f64::EPSILON);

        instance.add_step_result("a", Value::Null);
        assert!((instance.progress(2) - 50.0).abs() < f64::EPSILON);

        instance.add_step_result("b", Value::Null);
        assert!((instance.progress(2) - 100.0).abs() < f64::EPSILON);

        assert!((instance.progress(0) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_initialize() {
        let def = test_def();
        let instance = WorkflowInstance::new(&def, Map::new(), None, None);
        let snapshot = InstanceSnapshot::initialize(&instance, &def);

        assert_eq!(snapshot.total_steps, 2);
        assert_eq!(snapshot.step_states.len(), 2);
        assert_eq!(snapshot.step_states["a"].status, StepStatus::Pending);
        assert_eq!(snapshot.step_states["a"].attempts, 0);
    }

    #[test]
    fn test_snapshot_record_step_tracks_current() {
        let def = test_def();
        let instance = WorkflowInstance::new(&def, Map::new(), None, None);
        let mut snapshot = InstanceSnapshot::initialize(&instance, &def);

        snapshot.record_step("a", StepUpdate::running());
        assert_eq!(snapshot.current_step.as_deref(), Some("a"));
        assert_eq!(snapshot.step_states["a"].attempts, 1);

        snapshot.record_step("a", StepUpdate::completed(serde_json::json!({"ok": true})));
        assert_eq!(snapshot.current_step, None);
        assert_eq!(snapshot.completed_steps, vec!["a"]);
        assert_eq!(snapshot.step_states["a"].attempts, 1);
    }

    #[test]
    fn test_snapshot_from_instance_rebuilds_lists() {
        let def = test_def();
        let mut instance = WorkflowInstance::new(&def, Map::new(), None, None);
        instance.add_step_result("a", serde_json::json!({"ok": true}));
        instance.mark_step_failed("b", "boom");

        let snapshot = InstanceSnapshot::from_instance(&instance, 2);
        assert_eq!(snapshot.completed_steps, vec!["a"]);
        assert_eq!(snapshot.failed_steps, vec!["b"]);
        assert_eq!(snapshot.step_states["a"].status, StepStatus::Completed);
        assert_eq!(snapshot.step_states["b"].status, StepStatus::Failed);
    }
}
