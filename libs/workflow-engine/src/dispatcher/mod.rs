//! Task dispatcher abstraction
//!
//! The executor hands steps to an external worker pool through this
//! façade and stays oblivious to the transport. Delivery is
//! at-least-once: a dispatcher may hand the task to the pool more than
//! once on network failure, so tasks must tolerate duplicate delivery.

pub mod local;
pub mod nats;

pub use local::*;
pub use nats::*;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by a dispatcher backend
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No task with that name is registered/routable
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// The dispatcher rejected the submission or the pool is unreachable
    #[error("worker pool unreachable: {0}")]
    Unreachable(String),

    /// The task ran and reported a failure
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The await deadline elapsed before the task completed
    #[error("timed out awaiting task {0}")]
    Timeout(String),

    /// No in-flight task matches the handle
    #[error("no such in-flight task: {0}")]
    HandleNotFound(String),
}

// =============================================================================
// Invocation & Handle
// =============================================================================

/// One task submission
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_name: String,
    pub args: Map<String, Value>,
    pub queue: String,
    /// Hard execution limit enforced by the pool
    pub time_limit: Duration,
    /// Advisory limit surfaced to the task at 90% of the hard limit
    pub soft_time_limit: Duration,
}

impl TaskInvocation {
    /// Create an invocation with the soft limit derived from the hard one
    #[must_use]
    pub fn new(
        task_name: impl Into<String>,
        args: Map<String, Value>,
        queue: impl Into<String>,
        time_limit: Duration,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            queue: queue.into(),
            time_limit,
            soft_time_limit: time_limit.mul_f64(0.9),
        }
    }
}

/// Handle to an in-flight task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub task_name: String,
}

impl TaskHandle {
    /// Create a handle with a fresh task id
    #[must_use]
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_name: task_name.into(),
        }
    }
}

// =============================================================================
// Dispatcher Trait
// =============================================================================

/// Abstract task dispatcher
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue a task with the worker pool
    async fn dispatch(&self, invocation: TaskInvocation) -> Result<TaskHandle, DispatchError>;

    /// Block until the task completes, honoring `timeout`
    ///
    /// Cancel-safe: dropping the returned future leaves the task
    /// revocable through its handle.
    async fn await_result(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<Value, DispatchError>;

    /// Best-effort cancellation of an in-flight task
    async fn revoke(&self, handle: &TaskHandle, terminate: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_limit_is_ninety_percent() {
        let invocation = TaskInvocation::new(
            "tasks.analyze",
            Map::new(),
            "content_optimization",
            Duration::from_secs(100),
        );
        assert_eq!(invocation.soft_time_limit, Duration::from_secs(90));
    }

    #[test]
    fn test_handles_are_unique() {
        let a = TaskHandle::new("tasks.analyze");
        let b = TaskHandle::new("tasks.analyze");
        assert_ne!(a.task_id, b.task_id);
    }
}
