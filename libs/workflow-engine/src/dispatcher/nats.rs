//! NATS dispatcher
//!
//! Request/reply over NATS: each task name maps to a subject under the
//! queue prefix and workers subscribe as a queue group, which gives the
//! at-least-once, competing-consumer semantics the engine expects.
//!
//! Wire envelope (JSON):
//! request `{task_id, task_name, args, time_limit_secs, soft_time_limit_secs}`
//! reply   `{status: "ok", result}` or `{status: "error", error}`
//! revoke  `{task_id, terminate}` published to `{queue}.control.revoke`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{DispatchError, TaskDispatcher, TaskHandle, TaskInvocation};

#[derive(Serialize)]
struct TaskEnvelope<'a> {
    task_id: &'a str,
    task_name: &'a str,
    args: &'a Map<String, Value>,
    time_limit_secs: u64,
    soft_time_limit_secs: u64,
}

#[derive(Deserialize)]
struct TaskReply {
    status: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct RevokeEnvelope<'a> {
    task_id: &'a str,
    terminate: bool,
}

struct InFlight {
    join: JoinHandle<Result<Value, DispatchError>>,
    control_subject: String,
}

/// NATS-backed task dispatcher
pub struct NatsDispatcher {
    client: async_nats::Client,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl NatsDispatcher {
    /// Create a dispatcher over a connected client
    #[must_use]
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to a NATS server and create a dispatcher
    pub async fn connect(url: &str) -> Result<Self, async_nats::ConnectError> {
        let client = async_nats::connect(url).await?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl TaskDispatcher for NatsDispatcher {
    async fn dispatch(&self, invocation: TaskInvocation) -> Result<TaskHandle, DispatchError> {
        let handle = TaskHandle::new(&invocation.task_name);
        let subject = format!("{}.{}", invocation.queue, invocation.task_name);
        let control_subject = format!("{}.control.revoke", invocation.queue);

        let envelope = TaskEnvelope {
            task_id: &handle.task_id,
            task_name: &invocation.task_name,
            args: &invocation.args,
            time_limit_secs: invocation.time_limit.as_secs(),
            soft_time_limit_secs: invocation.soft_time_limit.as_secs(),
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| DispatchError::Unreachable(e.to_string()))?;

        let client = self.client.clone();
        let task_id = handle.task_id.clone();
        let join = tokio::spawn(async move {
            let message = client
                .request(subject, payload.into())
                .await
                .map_err(|e| DispatchError::Unreachable(e.to_string()))?;

            let reply: TaskReply = serde_json::from_slice(&message.payload)
                .map_err(|e| DispatchError::TaskFailed(format!("malformed reply: {e}")))?;

            if reply.status == "ok" {
                Ok(reply.result)
            } else {
                Err(DispatchError::TaskFailed(
                    reply.error.unwrap_or_else(|| format!("task {task_id} failed")),
                ))
            }
        });

        self.in_flight.lock().await.insert(
            handle.task_id.clone(),
            InFlight {
                join,
                control_subject,
            },
        );
        Ok(handle)
    }

    async fn await_result(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let mut entry = self
            .in_flight
            .lock()
            .await
            .remove(&handle.task_id)
            .ok_or_else(|| DispatchError::HandleNotFound(handle.task_id.clone()))?;

        match tokio::time::timeout(timeout, &mut entry.join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DispatchError::TaskFailed(join_err.to_string())),
            Err(_) => {
                self.in_flight
                    .lock()
                    .await
                    .insert(handle.task_id.clone(), entry);
                Err(DispatchError::Timeout(handle.task_id.clone()))
            }
        }
    }

    async fn revoke(&self, handle: &TaskHandle, terminate: bool) {
        let Some(entry) = self.in_flight.lock().await.remove(&handle.task_id) else {
            return;
        };
        entry.join.abort();

        let envelope = RevokeEnvelope {
            task_id: &handle.task_id,
            terminate,
        };
        if let Ok(payload) = serde_json::to_vec(&envelope) {
            if let Err(e) = self
                .client
                .publish(entry.control_subject, payload.into())
                .await
            {
                tracing::warn!(task_id = %handle.task_id, error = %e, "revoke publish failed");
            }
        }
    }
}
