//! Workflow scheduler and lifecycle
//!
//! The engine materialises instances from definitions, walks the
//! topological order with dependency gating and condition checks, drives
//! per-step retries with exponential backoff, and exposes the
//! pause/resume/cancel controls. Every instance-record write happens
//! under the instance mutex in the coordination store, and every event
//! is emitted only after the corresponding durable write.
//!
//! Each running instance is an independent tokio task; on engine crash
//! another process resumes from durable state via
//! [`WorkflowEngine::resume_interrupted`], relying on `completed_steps`
//! and the step locks for at-least-once execution with single-winner
//! completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use maestro_db::{
    CoordinationError, CoordinationStore, InstanceMutexGuard, InstanceStore, LockError,
};
use maestro_domain::{
    DefinitionId, InstanceId, InstanceSnapshot, StepSpec, StepUpdate, WorkflowDefinition,
    WorkflowInstance, WorkflowStatus,
};

use crate::condition::{ConditionEvaluator, ExpressionEvaluator};
use crate::dispatcher::TaskDispatcher;
use crate::events::{EventBus, EventKind, WorkflowEvent};
use crate::executor::{StepError, StepOutcome, StepRunner};
use crate::registry::{DefinitionRegistry, RegistryError};
use crate::validate::{topological_order, validate_definition, ValidationError};

// =============================================================================
// Errors
// =============================================================================

/// Engine-level errors surfaced to callers
#[derive(Debug, Error)]
pub enum EngineError {
    /// No definition matches the name or id
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// The definition exists but was deactivated
    #[error("workflow definition is inactive: {0}")]
    DefinitionInactive(String),

    /// The definition failed structural validation
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] ValidationError),

    /// The submission input was rejected
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No instance with that id
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The requested status change is not allowed
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    /// The instance mutex could not be acquired
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Coordination store failure
    #[error("coordination store error: {0}")]
    Coordination(#[from] CoordinationError),

    /// State store failure; fatal for the affected instance
    #[error("state store error: {0}")]
    State(String),

    /// Registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// =============================================================================
// Status Report
// =============================================================================

/// Point-in-time view of an instance for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub instance_id: InstanceId,
    pub workflow_id: DefinitionId,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
    /// `100 * completed / total`
    pub progress: f64,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker-pool queue steps are dispatched to
    pub queue: String,
    /// Re-read interval while waiting on dependencies or a yielded step
    pub dependency_poll: Duration,
    /// Instance mutex acquisition timeout (also its TTL)
    pub mutex_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: "content_optimization".to_string(),
            dependency_poll: Duration::from_secs(1),
            mutex_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

struct ActiveHandle {
    cancel: watch::Sender<bool>,
}

/// How the main loop ended
enum LoopEnd {
    Completed,
    StepFailed(String),
    /// Pause/cancel already recorded the status and emitted its event
    Halted,
    Fatal(String),
}

/// Why a step run stopped without an outcome
enum Interrupt {
    Cancelled,
    Halted,
    Fatal(EngineError),
}

enum DepOutcome {
    Ready,
    SkippedFailedDependency,
    Halted,
}

enum Settled {
    Completed,
    Failed,
    Halted,
    StillHeld,
}

/// Core workflow execution engine
///
/// Instance loops run on an `Arc`-shared core, so a spawned instance
/// task survives independently of the engine handle that started it.
pub struct WorkflowEngine {
    registry: Arc<DefinitionRegistry>,
    core: Arc<EngineCore>,
}

struct EngineCore {
    instances: Arc<dyn InstanceStore>,
    coordination: Arc<dyn CoordinationStore>,
    events: Arc<EventBus>,
    evaluator: Arc<dyn ConditionEvaluator>,
    runner: StepRunner,
    config: EngineConfig,
    active: Mutex<HashMap<InstanceId, ActiveHandle>>,
}

impl WorkflowEngine {
    /// Create an engine over injected collaborators
    #[must_use]
    pub fn new(
        registry: Arc<DefinitionRegistry>,
        instances: Arc<dyn InstanceStore>,
        coordination: Arc<dyn CoordinationStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        events: Arc<EventBus>,
    ) -> Self {
        Self::with_config(
            registry,
            instances,
            coordination,
            dispatcher,
            events,
            EngineConfig::default(),
        )
    }

    /// Create an engine with explicit configuration
    #[must_use]
    pub fn with_config(
        registry: Arc<DefinitionRegistry>,
        instances: Arc<dyn InstanceStore>,
        coordination: Arc<dyn CoordinationStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let runner = StepRunner::new(
            Arc::clone(&coordination),
            dispatcher,
            config.queue.clone(),
        );
        Self {
            registry,
            core: Arc::new(EngineCore {
                instances,
                coordination,
                events,
                evaluator: Arc::new(ExpressionEvaluator),
                runner,
                config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replace the condition evaluator. Only effective before the first
    /// instance is spawned, while this handle is sole owner of the core.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.evaluator = evaluator;
        }
        self
    }

    /// The engine's event bus, for subscriptions
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.core.events
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a workflow by definition name or id
    pub async fn submit(
        &self,
        name_or_id: &str,
        input: Map<String, Value>,
        triggered_by: Option<String>,
    ) -> Result<WorkflowInstance, EngineError> {
        if name_or_id.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "workflow name or id is required".to_string(),
            ));
        }

        let def = if let Ok(id) = name_or_id.parse::<DefinitionId>() {
            self.registry.get_by_id(&id).await?
        } else {
            self.registry.get(name_or_id, None).await?
        };
        let def = def.ok_or_else(|| EngineError::DefinitionNotFound(name_or_id.to_string()))?;
        if !def.is_active {
            return Err(EngineError::DefinitionInactive(def.name));
        }

        self.start_workflow(def, input, triggered_by, None).await
    }

    /// Start a new instance of a definition
    ///
    /// The definition is cloned into the instance; later registry changes
    /// do not affect it.
    pub async fn start_workflow(
        &self,
        def: WorkflowDefinition,
        input: Map<String, Value>,
        triggered_by: Option<String>,
        parent_instance_id: Option<InstanceId>,
    ) -> Result<WorkflowInstance, EngineError> {
        validate_definition(&def)?;

        let instance = WorkflowInstance::new(&def, input, triggered_by, parent_instance_id);
        self.core
            .instances
            .save(&instance)
            .await
            .map_err(|e| EngineError::State(e.to_string()))?;
        self.core
            .coordination
            .put_state(&InstanceSnapshot::initialize(&instance, &def))
            .await?;

        self.core.events.emit(
            &WorkflowEvent::new(EventKind::WorkflowStarted, instance.id)
                .with_detail("workflow_id", json!(def.id.to_string()))
                .with_detail("workflow_name", json!(def.name)),
        );

        tracing::info!(
            instance_id = %instance.id,
            workflow = %def.name,
            "started workflow instance"
        );

        EngineCore::spawn_instance(&self.core, instance.clone(), def).await;
        Ok(instance)
    }

    /// Re-adopt instances left non-terminal in the coordination store,
    /// e.g. after an engine crash. Returns the adopted instance ids.
    pub async fn resume_interrupted(&self) -> Result<Vec<InstanceId>, EngineError> {
        let mut adopted = Vec::new();

        for instance_id in self.core.coordination.active_instances().await? {
            if self.core.active.lock().await.contains_key(&instance_id) {
                continue;
            }
            let Some(instance) = self
                .core
                .instances
                .get(&instance_id)
                .await
                .map_err(|e| EngineError::State(e.to_string()))?
            else {
                continue;
            };
            if instance.status.is_terminal() || instance.status == WorkflowStatus::Paused {
                continue;
            }
            let Some(def) = self.registry.get_by_id(&instance.workflow_id).await? else {
                tracing::warn!(
                    instance_id = %instance_id,
                    "cannot resume: definition missing"
                );
                continue;
            };

            tracing::info!(instance_id = %instance_id, "resuming interrupted instance");
            EngineCore::spawn_instance(&self.core, instance, def).await;
            adopted.push(instance_id);
        }

        Ok(adopted)
    }

    // =========================================================================
    // Controls
    // =========================================================================

    /// Pause a running instance
    pub async fn pause(&self, instance_id: &InstanceId) -> Result<bool, EngineError> {
        let current = self.core.load(instance_id).await?;
        if current.status != WorkflowStatus::Running {
            return Err(EngineError::IllegalTransition {
                from: current.status,
                to: WorkflowStatus::Paused,
            });
        }

        let mut paused = false;
        self.core
            .update_instance(instance_id, |i| {
                if i.status == WorkflowStatus::Running {
                    i.status = WorkflowStatus::Paused;
                    i.paused_at = Some(Utc::now());
                    paused = true;
                }
            })
            .await?;

        if paused {
            self.core
                .events
                .emit(&WorkflowEvent::new(EventKind::WorkflowPaused, *instance_id));
        }
        Ok(paused)
    }

    /// Resume a paused instance; a fresh scheduling task continues from
    /// the earliest non-terminal step
    pub async fn resume(&self, instance_id: &InstanceId) -> Result<bool, EngineError> {
        let current = self.core.load(instance_id).await?;
        if current.status != WorkflowStatus::Paused {
            return Err(EngineError::IllegalTransition {
                from: current.status,
                to: WorkflowStatus::Running,
            });
        }

        let def = self
            .registry
            .get_by_id(&current.workflow_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(current.workflow_id.to_string()))?;

        let mut resumed = false;
        let updated = self
            .core
            .update_instance(instance_id, |i| {
                if i.status == WorkflowStatus::Paused {
                    i.status = WorkflowStatus::Running;
                    i.paused_at = None;
                    resumed = true;
                }
            })
            .await?;

        if resumed {
            self.core
                .events
                .emit(&WorkflowEvent::new(EventKind::WorkflowResumed, *instance_id));
            EngineCore::spawn_instance(&self.core, updated, def).await;
        }
        Ok(resumed)
    }

    /// Cancel an instance; any in-flight dispatch is revoked and the
    /// loop exits at its next observation point. Returns false when the
    /// instance is already terminal.
    pub async fn cancel(&self, instance_id: &InstanceId) -> Result<bool, EngineError> {
        let current = self.core.load(instance_id).await?;
        if current.status.is_terminal() {
            return Ok(false);
        }

        let mut cancelled = false;
        self.core
            .update_instance(instance_id, |i| {
                if !i.status.is_terminal() {
                    i.status = WorkflowStatus::Cancelled;
                    i.completed_at = Some(Utc::now());
                    i.current_step_id = None;
                    cancelled = true;
                }
            })
            .await?;

        if let Some(handle) = self.core.active.lock().await.get(instance_id) {
            let _ = handle.cancel.send(true);
        }

        if cancelled {
            self.core.events.emit(&WorkflowEvent::new(
                EventKind::WorkflowCancelled,
                *instance_id,
            ));
        }
        Ok(cancelled)
    }

    /// Current status of an instance, always from durable state
    pub async fn status(&self, instance_id: &InstanceId) -> Result<StatusReport, EngineError> {
        let instance = self.core.load(instance_id).await?;

        let total_steps = match self.registry.get_by_id(&instance.workflow_id).await? {
            Some(def) => def.steps.len(),
            None => self
                .core
                .coordination
                .get_state(instance_id)
                .await?
                .map_or(0, |s| s.total_steps),
        };

        Ok(StatusReport {
            instance_id: instance.id,
            workflow_id: instance.workflow_id,
            status: instance.status,
            current_step: instance.current_step_id.clone(),
            progress: instance.progress(total_steps),
            completed_steps: instance.completed_steps.clone(),
            failed_steps: instance.failed_steps.clone(),
            started_at: instance.started_at,
            completed_at: instance.completed_at,
            error: instance.error_message.clone(),
        })
    }

    /// Wait until an instance reaches a terminal status
    pub async fn await_terminal(
        &self,
        instance_id: &InstanceId,
        timeout: Duration,
    ) -> Result<WorkflowInstance, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let instance = self.core.load(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(instance);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::State(format!(
                    "instance {instance_id} still {:?} after {timeout:?}",
                    instance.status
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

// =============================================================================
// Instance Loop
// =============================================================================

impl EngineCore {
    async fn spawn_instance(
        core: &Arc<Self>,
        instance: WorkflowInstance,
        def: WorkflowDefinition,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        core.active
            .lock()
            .await
            .insert(instance.id, ActiveHandle { cancel: cancel_tx });

        let core = Arc::clone(core);
        tokio::spawn(async move {
            let instance_id = instance.id;
            core.run_instance(instance, def, cancel_rx).await;
            core.active.lock().await.remove(&instance_id);
        });
    }

    async fn run_instance(
        &self,
        instance: WorkflowInstance,
        def: WorkflowDefinition,
        mut cancel: watch::Receiver<bool>,
    ) {
        let instance_id = instance.id;
        let end = self.drive(instance, &def, &mut cancel).await;

        match end {
            LoopEnd::Completed => {
                let mut completed = false;
                let result = self
                    .update_instance(&instance_id, |i| {
                        if i.status.is_executing() {
                            i.status = WorkflowStatus::Completed;
                            i.completed_at = Some(Utc::now());
                            i.current_step_id = None;
                            completed = true;
                        }
                    })
                    .await;

                match result {
                    Ok(updated) if completed => {
                        self.events.emit(
                            &WorkflowEvent::new(EventKind::WorkflowCompleted, instance_id)
                                .with_detail(
                                    "output_data",
                                    Value::Object(updated.output_data.clone()),
                                ),
                        );
                        tracing::info!(instance_id = %instance_id, "workflow completed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(instance_id = %instance_id, error = %e, "finalize failed");
                    }
                }
            }
            LoopEnd::StepFailed(step_name) => {
                self.finalize_failed(&instance_id, &format!("Step {step_name} failed"))
                    .await;
            }
            LoopEnd::Fatal(message) => {
                self.finalize_failed(&instance_id, &message).await;
            }
            LoopEnd::Halted => {}
        }
    }

    async fn drive(
        &self,
        mut instance: WorkflowInstance,
        def: &WorkflowDefinition,
        cancel: &mut watch::Receiver<bool>,
    ) -> LoopEnd {
        // Move a fresh or re-adopted instance into the running state
        let start = self
            .update_instance(&instance.id, |i| {
                if matches!(i.status, WorkflowStatus::Pending | WorkflowStatus::Retry) {
                    i.status = WorkflowStatus::Running;
                }
            })
            .await;
        match start {
            Ok(updated) => instance = updated,
            Err(e) => return LoopEnd::Fatal(e.to_string()),
        }

        for step_id in topological_order(def) {
            instance = match self.load(&instance.id).await {
                Ok(i) => i,
                Err(e) => return LoopEnd::Fatal(e.to_string()),
            };
            if !instance.status.is_executing() {
                return LoopEnd::Halted;
            }

            // Already settled on a previous run of this instance
            if instance.is_step_settled(&step_id) {
                continue;
            }

            let Some(step) = def.step(&step_id) else {
                continue;
            };

            if !self.should_execute(step, &instance) {
                tracing::info!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    "skipping step, condition not met"
                );
                continue;
            }

            match self
                .wait_for_dependencies(step, def, &mut instance, cancel)
                .await
            {
                Ok(DepOutcome::Ready) => {}
                Ok(DepOutcome::SkippedFailedDependency) => continue,
                Ok(DepOutcome::Halted) => return LoopEnd::Halted,
                Err(e) => return LoopEnd::Fatal(e.to_string()),
            }

            match self
                .run_step_with_retries(step, def, &mut instance, cancel)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    if !step.allow_failure {
                        return LoopEnd::StepFailed(step.name.clone());
                    }
                }
                Err(Interrupt::Cancelled | Interrupt::Halted) => return LoopEnd::Halted,
                Err(Interrupt::Fatal(e)) => return LoopEnd::Fatal(e.to_string()),
            }
        }

        LoopEnd::Completed
    }

    /// Run a step to a settled outcome, retrying with exponential
    /// backoff per its policy. Returns whether the step completed.
    async fn run_step_with_retries(
        &self,
        step: &StepSpec,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<bool, Interrupt> {
        let policy = &step.retry_policy;
        let initial = Duration::from_secs(policy.delay_seconds);
        let max_delay = Duration::from_secs(policy.max_delay_seconds);
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            randomization_factor: 0.0,
            multiplier: policy.backoff_multiplier,
            max_interval: max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            *instance = self
                .update_instance(&instance.id, |i| {
                    if i.status.is_executing() {
                        i.status = WorkflowStatus::Running;
                        i.current_step_id = Some(step.id.clone());
                    }
                })
                .await
                .map_err(Interrupt::Fatal)?;
            if !instance.status.is_executing() {
                return Err(Interrupt::Halted);
            }
            // A racing engine may have settled the step between the
            // loop-top read and this mutex-guarded one
            if instance.completed_steps.iter().any(|s| s == &step.id) {
                return Ok(true);
            }
            if instance.failed_steps.iter().any(|s| s == &step.id) {
                return Ok(false);
            }

            self.events.emit(
                &WorkflowEvent::new(EventKind::StepStarted, instance.id)
                    .with_step(&step.id)
                    .with_detail("step_name", json!(step.name))
                    .with_detail("attempt", json!(attempt)),
            );

            let outcome = self
                .runner
                .execute(step, instance, def.max_parallel_steps, cancel)
                .await;

            match outcome {
                Ok(StepOutcome::Completed(result)) => {
                    // First committer under the instance mutex wins;
                    // a memoized duplicate stays silent
                    let mut fresh = false;
                    *instance = self
                        .update_instance(&instance.id, |i| {
                            if !i.is_step_settled(&step.id) {
                                i.add_step_result(&step.id, result.clone());
                                i.merge_step_output(&result);
                                fresh = true;
                            }
                            i.current_step_id = None;
                        })
                        .await
                        .map_err(Interrupt::Fatal)?;

                    if fresh {
                        self.events.emit(
                            &WorkflowEvent::new(EventKind::StepCompleted, instance.id)
                                .with_step(&step.id)
                                .with_detail("result", result),
                        );
                    }
                    return Ok(true);
                }

                Ok(StepOutcome::Yielded) => {
                    // Another engine owns this step; the attempt never
                    // dispatched, so it does not count against the policy
                    attempt -= 1;
                    match self.wait_for_settled(step, instance, cancel).await? {
                        Settled::Completed => return Ok(true),
                        Settled::Failed => return Ok(false),
                        Settled::Halted => return Err(Interrupt::Halted),
                        Settled::StillHeld => continue,
                    }
                }

                Err(StepError::Cancelled) => return Err(Interrupt::Cancelled),

                Err(e) => {
                    if attempt < policy.max_attempts {
                        let delay = backoff.next_backoff().unwrap_or(max_delay);
                        tracing::warn!(
                            instance_id = %instance.id,
                            step_id = %step.id,
                            attempt,
                            delay_secs = delay.as_secs_f64(),
                            error = %e,
                            "step failed, retrying"
                        );

                        self.record_snapshot(
                            &instance.id,
                            &step.id,
                            StepUpdate::retrying(e.to_string()),
                        )
                        .await;
                        let _ = self
                            .update_instance(&instance.id, |i| {
                                if i.status == WorkflowStatus::Running {
                                    i.status = WorkflowStatus::Retry;
                                }
                                i.retry_count += 1;
                            })
                            .await;

                        self.events.emit(
                            &WorkflowEvent::new(EventKind::StepRetrying, instance.id)
                                .with_step(&step.id)
                                .with_detail("attempt", json!(attempt))
                                .with_detail("delay", json!(delay.as_secs_f64()))
                                .with_detail("error", json!(e.to_string())),
                        );

                        if !self.sleep_unless_cancelled(delay, cancel).await {
                            return Err(Interrupt::Cancelled);
                        }
                    } else {
                        let mut fresh = false;
                        *instance = self
                            .update_instance(&instance.id, |i| {
                                if !i.is_step_settled(&step.id) {
                                    i.mark_step_failed(&step.id, &e.to_string());
                                    fresh = true;
                                }
                                i.current_step_id = None;
                            })
                            .await
                            .map_err(Interrupt::Fatal)?;

                        if fresh {
                            self.events.emit(
                                &WorkflowEvent::new(EventKind::StepFailed, instance.id)
                                    .with_step(&step.id)
                                    .with_detail("error", json!(e.to_string()))
                                    .with_detail("attempts", json!(attempt)),
                            );
                        }
                        return Ok(false);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Gating
    // =========================================================================

    fn should_execute(&self, step: &StepSpec, instance: &WorkflowInstance) -> bool {
        let Some(expr) = &step.condition else {
            return true;
        };

        match self.evaluator.evaluate(expr, &instance.context) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    condition = %expr,
                    error = %e,
                    "condition evaluation failed, treating as false"
                );
                false
            }
        }
    }

    /// Block until every dependency of `step` is settled
    ///
    /// A dependency that failed terminally without `allow_failure` makes
    /// this step a skipped no-op rather than a workflow failure.
    async fn wait_for_dependencies(
        &self,
        step: &StepSpec,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<DepOutcome, EngineError> {
        loop {
            let failed_required = step.depends_on.iter().find(|dep| {
                instance.failed_steps.iter().any(|f| f == *dep)
                    && def.step(dep).is_none_or(|d| !d.allow_failure)
            });
            if let Some(dep) = failed_required {
                tracing::info!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    failed_dependency = %dep,
                    "skipping step, required dependency failed"
                );
                self.record_snapshot(
                    &instance.id,
                    &step.id,
                    StepUpdate::skipped(format!("dependency {dep} failed")),
                )
                .await;
                return Ok(DepOutcome::SkippedFailedDependency);
            }

            let pending: Vec<&String> = step
                .depends_on
                .iter()
                .filter(|dep| !instance.is_step_settled(dep))
                .collect();
            if pending.is_empty() {
                return Ok(DepOutcome::Ready);
            }

            if !instance.status.is_executing() {
                return Ok(DepOutcome::Halted);
            }
            if !self
                .sleep_unless_cancelled(self.config.dependency_poll, cancel)
                .await
            {
                return Ok(DepOutcome::Halted);
            }

            *instance = self.load(&instance.id).await?;
        }
    }

    /// After yielding a held step lock, wait for the owning engine to
    /// settle the step
    async fn wait_for_settled(
        &self,
        step: &StepSpec,
        instance: &mut WorkflowInstance,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Settled, Interrupt> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(step.timeout_seconds)
            + Duration::from_secs(60);

        loop {
            *instance = self.load(&instance.id).await.map_err(Interrupt::Fatal)?;

            if instance.completed_steps.iter().any(|s| s == &step.id) {
                return Ok(Settled::Completed);
            }
            if instance.failed_steps.iter().any(|s| s == &step.id) {
                return Ok(Settled::Failed);
            }
            if !instance.status.is_executing() {
                return Ok(Settled::Halted);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Settled::StillHeld);
            }
            if !self
                .sleep_unless_cancelled(self.config.dependency_poll, cancel)
                .await
            {
                return Err(Interrupt::Cancelled);
            }
        }
    }

    // =========================================================================
    // Persistence Helpers
    // =========================================================================

    async fn load(&self, instance_id: &InstanceId) -> Result<WorkflowInstance, EngineError> {
        self.instances
            .get(instance_id)
            .await
            .map_err(|e| EngineError::State(e.to_string()))?
            .ok_or(EngineError::InstanceNotFound(*instance_id))
    }

    /// Read-modify-write the durable record under the instance mutex and
    /// refresh the cached snapshot
    async fn update_instance<F>(
        &self,
        instance_id: &InstanceId,
        mutate: F,
    ) -> Result<WorkflowInstance, EngineError>
    where
        F: FnOnce(&mut WorkflowInstance),
    {
        let guard = InstanceMutexGuard::acquire(
            Arc::clone(&self.coordination),
            instance_id,
            self.config.mutex_timeout,
        )
        .await?;

        let result = async {
            let mut instance = self.load(instance_id).await?;
            mutate(&mut instance);
            self.instances
                .update(&instance)
                .await
                .map_err(|e| EngineError::State(e.to_string()))?;

            let mut snapshot = match self.coordination.get_state(instance_id).await? {
                Some(snapshot) => snapshot,
                None => InstanceSnapshot::from_instance(&instance, instance.step_results.len()),
            };
            snapshot.sync_from(&instance);
            self.coordination.put_state(&snapshot).await?;

            Ok(instance)
        }
        .await;

        guard.release().await?;
        result
    }

    /// Best-effort step-state write into the cached snapshot
    async fn record_snapshot(&self, instance_id: &InstanceId, step_id: &str, update: StepUpdate) {
        let result = async {
            if let Some(mut snapshot) = self.coordination.get_state(instance_id).await? {
                snapshot.record_step(step_id, update);
                self.coordination.put_state(&snapshot).await?;
            }
            Ok::<(), CoordinationError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(instance_id = %instance_id, step_id, error = %e, "snapshot write failed");
        }
    }

    async fn finalize_failed(&self, instance_id: &InstanceId, message: &str) {
        let mut failed = false;
        let result = self
            .update_instance(instance_id, |i| {
                if !i.status.is_terminal() {
                    i.status = WorkflowStatus::Failed;
                    i.error_message = Some(message.to_string());
                    i.completed_at = Some(Utc::now());
                    i.current_step_id = None;
                    failed = true;
                }
            })
            .await;

        match result {
            Ok(_) if failed => {
                self.events.emit(
                    &WorkflowEvent::new(EventKind::WorkflowFailed, *instance_id)
                        .with_detail("error", json!(message)),
                );
                tracing::error!(instance_id = %instance_id, error = message, "workflow failed");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(instance_id = %instance_id, error = %e, "failed to record failure");
            }
        }
    }

    /// Sleep for `duration`; false when cancellation interrupted it
    async fn sleep_unless_cancelled(
        &self,
        duration: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        if *cancel.borrow() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            changed = cancel.changed() => {
                // Sender gone means the instance can no longer be
                // cancelled through this channel; keep sleeping
                if changed.is_err() {
                    tokio::time::sleep(duration).await;
                    true
                } else {
                    !*cancel.borrow()
                }
            }
        }
    }
}
