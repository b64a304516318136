//! Per-step execution
//!
//! The runner owns one attempt of one step: acquire the distributed step
//! lock, mark the step running, bundle arguments, dispatch (single task,
//! parallel fan-out, or branching predicate), handle the hard timeout
//! with revocation, record the outcome and always release the lock.
//!
//! Step locks make execution at-least-once but completion single-winner:
//! when the lock is already held by another engine the runner yields
//! instead of double-dispatching.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

use maestro_db::{lock_token, step_lock_key, CoordinationError, CoordinationStore};
use maestro_domain::{
    InstanceSnapshot, StepSpec, StepStatus, StepType, StepUpdate, WorkflowInstance,
};

use crate::dispatcher::{DispatchError, TaskDispatcher, TaskInvocation};

/// Extra TTL granted to the step lock for the trailing state writes
const LOCK_GRACE: Duration = Duration::from_secs(30);

// =============================================================================
// Errors & Outcome
// =============================================================================

/// Errors from one execution attempt; all but `Cancelled` enter the
/// retry logic
#[derive(Debug, Error)]
pub enum StepError {
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("task failed: {0}")]
    Task(String),

    #[error("cancelled")]
    Cancelled,

    #[error("coordination store error: {0}")]
    Coordination(#[from] CoordinationError),
}

/// Outcome of one execution attempt
#[derive(Debug)]
pub enum StepOutcome {
    /// The step ran and produced a result
    Completed(Value),

    /// Another engine holds the step lock; this worker yields
    Yielded,
}

// =============================================================================
// Step Runner
// =============================================================================

/// Executes single step attempts against the worker pool
pub struct StepRunner {
    coordination: Arc<dyn CoordinationStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    queue: String,
}

impl StepRunner {
    /// Create a runner dispatching to the given queue
    #[must_use]
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            coordination,
            dispatcher,
            queue: queue.into(),
        }
    }

    /// Run one attempt of a step
    pub async fn execute(
        &self,
        step: &StepSpec,
        instance: &WorkflowInstance,
        max_parallel: usize,
        cancel: &watch::Receiver<bool>,
    ) -> Result<StepOutcome, StepError> {
        let key = step_lock_key(&instance.id, &step.id);
        let token = lock_token();
        let ttl = Duration::from_secs(step.timeout_seconds) + LOCK_GRACE;

        if !self.coordination.acquire(&key, &token, ttl).await? {
            tracing::info!(
                instance_id = %instance.id,
                step_id = %step.id,
                "step lock held elsewhere, yielding"
            );
            return Ok(StepOutcome::Yielded);
        }

        let result = self
            .run_locked(step, instance, max_parallel, cancel, &key, &token)
            .await;

        if !self.coordination.release(&key, &token).await.unwrap_or(false) {
            tracing::warn!(
                instance_id = %instance.id,
                step_id = %step.id,
                "step lock expired before release"
            );
        }

        result.map(StepOutcome::Completed)
    }

    async fn run_locked(
        &self,
        step: &StepSpec,
        instance: &WorkflowInstance,
        max_parallel: usize,
        cancel: &watch::Receiver<bool>,
        lock_key: &str,
        lock_token: &str,
    ) -> Result<Value, StepError> {
        // Memoization: a previous holder may have finished this step and
        // released the lock before its result reached the durable record
        if let Some(snapshot) = self.coordination.get_state(&instance.id).await? {
            if let Some(state) = snapshot.step_states.get(&step.id) {
                if state.status == StepStatus::Completed {
                    if let Some(result) = &state.result {
                        return Ok(result.clone());
                    }
                }
            }
        }

        self.record_step(instance, &step.id, StepUpdate::running())
            .await?;

        let timeout = Duration::from_secs(step.timeout_seconds);
        let result = match step.step_type {
            StepType::Parallel => {
                self.run_parallel(step, instance, max_parallel, cancel, timeout)
                    .await?
            }
            StepType::Branching => self.run_branching(step, instance, cancel, timeout).await?,
            _ => {
                let args = build_task_args(step, instance);
                self.run_single(&step.task_name, args, timeout, cancel)
                    .await?
            }
        };

        // The dispatch consumed most of the TTL budget; buy room for the
        // trailing state writes
        let _ = self
            .coordination
            .extend(lock_key, lock_token, LOCK_GRACE)
            .await;

        self.record_step(instance, &step.id, StepUpdate::completed(result.clone()))
            .await?;
        Ok(result)
    }

    /// Dispatch one task and await it within the hard timeout
    async fn run_single(
        &self,
        task_name: &str,
        args: Map<String, Value>,
        timeout: Duration,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Value, StepError> {
        if *cancel.borrow() {
            return Err(StepError::Cancelled);
        }

        let invocation = TaskInvocation::new(task_name, args, &self.queue, timeout);
        let handle = self
            .dispatcher
            .dispatch(invocation)
            .await
            .map_err(|e| StepError::Dispatch(e.to_string()))?;

        tokio::select! {
            res = self.dispatcher.await_result(&handle, timeout) => match res {
                Ok(value) => Ok(value),
                Err(DispatchError::Timeout(_)) => {
                    self.dispatcher.revoke(&handle, true).await;
                    Err(StepError::Timeout(timeout))
                }
                Err(DispatchError::TaskFailed(message)) => Err(StepError::Task(message)),
                Err(e) => Err(StepError::Dispatch(e.to_string())),
            },
            () = cancelled(cancel.clone()) => {
                self.dispatcher.revoke(&handle, true).await;
                Err(StepError::Cancelled)
            }
        }
    }

    /// Fan out the sub-tasks of a parallel step and aggregate the results
    ///
    /// Sub-tasks get synthetic step ids `{id}:{i}`; concurrency is bounded
    /// by the definition's `max_parallel_steps`. Results keep sub-task
    /// declaration order.
    async fn run_parallel(
        &self,
        step: &StepSpec,
        instance: &WorkflowInstance,
        max_parallel: usize,
        cancel: &watch::Receiver<bool>,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let sub_tasks = step.parallel_tasks();
        if sub_tasks.is_empty() {
            return Err(StepError::Dispatch(format!(
                "parallel step '{}' defines no sub-tasks",
                step.id
            )));
        }

        let results: Vec<Value> = stream::iter(sub_tasks.into_iter().enumerate().map(
            |(i, sub)| {
                let mut args = builtin_args(instance);
                args.insert(
                    "step_id".to_string(),
                    Value::from(format!("{}:{i}", step.id)),
                );
                for (k, v) in &sub.args {
                    args.insert(k.clone(), v.clone());
                }
                async move { self.run_single(&sub.name, args, timeout, cancel).await }
            },
        ))
        .buffered(max_parallel.max(1))
        .try_collect()
        .await?;

        Ok(serde_json::json!({
            "status": "completed",
            "results": results,
            "completed_at": Utc::now().to_rfc3339(),
        }))
    }

    /// Run the predicate task of a branching step and capture the branch
    /// tag under the reserved `context` key so it merges into the
    /// instance for downstream conditions
    async fn run_branching(
        &self,
        step: &StepSpec,
        instance: &WorkflowInstance,
        cancel: &watch::Receiver<bool>,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let condition_task = step
            .task_args
            .get("condition_task")
            .and_then(Value::as_str)
            .unwrap_or(&step.task_name)
            .to_string();

        let mut args = build_task_args(step, instance);
        args.insert(
            "step_id".to_string(),
            Value::from(format!("{}_condition", step.id)),
        );

        let result = self.run_single(&condition_task, args, timeout, cancel).await?;
        let branch = result
            .get("branch")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        Ok(serde_json::json!({
            "branch": branch,
            "condition_result": result,
            "evaluated_at": Utc::now().to_rfc3339(),
            "context": { "branch": branch },
        }))
    }

    /// Write a step-state change into the cached snapshot, rebuilding it
    /// from the durable record on cache miss
    async fn record_step(
        &self,
        instance: &WorkflowInstance,
        step_id: &str,
        update: StepUpdate,
    ) -> Result<(), CoordinationError> {
        let mut snapshot = match self.coordination.get_state(&instance.id).await? {
            Some(snapshot) => snapshot,
            None => InstanceSnapshot::from_instance(instance, instance.step_results.len()),
        };
        snapshot.record_step(step_id, update);
        self.coordination.put_state(&snapshot).await
    }
}

// =============================================================================
// Argument Bundling
// =============================================================================

/// Built-in argument fields every task receives
fn builtin_args(instance: &WorkflowInstance) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert(
        "workflow_instance_id".to_string(),
        Value::from(instance.id.to_string()),
    );
    args.insert(
        "input_data".to_string(),
        Value::Object(instance.input_data.clone()),
    );
    args.insert("context".to_string(), Value::Object(instance.context.clone()));
    args.insert(
        "step_results".to_string(),
        Value::Object(instance.step_results.clone()),
    );
    args
}

/// Bundle the arguments for a step dispatch
///
/// Merge order is deterministic: built-in fields first
/// (`workflow_instance_id`, `step_id`, `input_data`, `context`,
/// `step_results`), then the step's static `task_args` overlaying on
/// conflict.
#[must_use]
pub fn build_task_args(step: &StepSpec, instance: &WorkflowInstance) -> Map<String, Value> {
    let mut args = builtin_args(instance);
    args.insert("step_id".to_string(), Value::from(step.id.clone()));
    for (k, v) in &step.task_args {
        args.insert(k.clone(), v.clone());
    }
    args
}

/// Resolves when the cancel flag flips to true; pends forever when the
/// sender is gone (an abandoned instance can no longer be cancelled)
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
