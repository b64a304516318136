//! In-process dispatcher
//!
//! Runs registered async task functions on spawned tokio tasks. This is
//! the development and test backend, and the worker's fallback when no
//! message broker is configured. Semantics match the remote backends:
//! tasks outlive `await_result` timeouts and stay revocable by handle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{DispatchError, TaskDispatcher, TaskHandle, TaskInvocation};

/// Task-level outcome: a JSON result or a failure message
pub type TaskResult = Result<Value, String>;

type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;
type TaskFn = Arc<dyn Fn(Map<String, Value>) -> TaskFuture + Send + Sync>;

/// In-process task dispatcher
#[derive(Default)]
pub struct LocalDispatcher {
    tasks: std::sync::RwLock<HashMap<String, TaskFn>>,
    running: Mutex<HashMap<String, JoinHandle<TaskResult>>>,
}

impl LocalDispatcher {
    /// Create an empty dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task function under a name
    pub fn register<F, Fut>(&self, name: impl Into<String>, task_fn: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let wrapped: TaskFn = Arc::new(move |args| Box::pin(task_fn(args)));
        self.tasks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), wrapped);
    }

    /// Registered task names, for startup logging
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.tasks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    async fn dispatch(&self, invocation: TaskInvocation) -> Result<TaskHandle, DispatchError> {
        let task_fn = self
            .tasks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&invocation.task_name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownTask(invocation.task_name.clone()))?;

        let handle = TaskHandle::new(&invocation.task_name);
        let join = tokio::spawn(task_fn(invocation.args));

        self.running.lock().await.insert(handle.task_id.clone(), join);
        Ok(handle)
    }

    async fn await_result(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let mut join = self
            .running
            .lock()
            .await
            .remove(&handle.task_id)
            .ok_or_else(|| DispatchError::HandleNotFound(handle.task_id.clone()))?;

        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(DispatchError::TaskFailed(message)),
            Ok(Err(join_err)) => {
                if join_err.is_cancelled() {
                    Err(DispatchError::TaskFailed("task revoked".to_string()))
                } else {
                    Err(DispatchError::TaskFailed(join_err.to_string()))
                }
            }
            Err(_) => {
                // Leave the task in flight so revoke can still reach it
                self.running.lock().await.insert(handle.task_id.clone(), join);
                Err(DispatchError::Timeout(handle.task_id.clone()))
            }
        }
    }

    async fn revoke(&self, handle: &TaskHandle, terminate: bool) {
        if let Some(join) = self.running.lock().await.remove(&handle.task_id) {
            if terminate {
                join.abort();
            }
            tracing::debug!(task_id = %handle.task_id, terminate, "revoked task");
        }
    }
}
