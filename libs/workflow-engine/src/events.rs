//! Lifecycle event bus
//!
//! Synchronous in-process publish/subscribe with a fixed vocabulary.
//! Handlers run in registration order after the corresponding durable
//! write; a failing handler is logged and never prevents the others
//! from firing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use maestro_domain::InstanceId;

// =============================================================================
// Event Kinds
// =============================================================================

/// Workflow lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetrying,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowPaused,
    WorkflowResumed,
}

impl EventKind {
    /// The event tag as published to subscribers
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepRetrying => "step.retrying",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::WorkflowPaused => "workflow.paused",
            Self::WorkflowResumed => "workflow.resumed",
        }
    }
}

// =============================================================================
// Event Payload
// =============================================================================

/// A lifecycle event delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub instance_id: InstanceId,
    pub step_id: Option<String>,
    /// Event-specific fields (attempt, delay, error, result, ...)
    pub detail: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Create an instance-scoped event
    #[must_use]
    pub fn new(kind: EventKind, instance_id: InstanceId) -> Self {
        Self {
            kind,
            instance_id,
            step_id: None,
            detail: Map::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Scope the event to a step
    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Attach a detail field
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Handler outcome; errors are logged and isolated
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Subscriber callback
pub type EventHandler = Arc<dyn Fn(&WorkflowEvent) -> HandlerResult + Send + Sync>;

/// Identifier returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct BusInner {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
}

/// Synchronous in-process event bus
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                handlers: HashMap::new(),
            }),
        }
    }

    /// Register a handler for an event kind; invoked in registration order
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&WorkflowEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut removed = false;
        for handlers in inner.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(sub_id, _)| *sub_id != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    /// Deliver an event to every subscriber of its kind
    ///
    /// Delivery is best-effort and synchronous with the state change;
    /// callers emit only after the durable write.
    pub fn emit(&self, event: &WorkflowEvent) {
        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner
                .handlers
                .get(&event.kind)
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            if let Err(e) = handler(event) {
                tracing::error!(
                    event = event.kind.as_str(),
                    instance_id = %event.instance_id,
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_event_tags() {
        assert_eq!(EventKind::WorkflowStarted.as_str(), "workflow.started");
        assert_eq!(EventKind::StepRetrying.as_str(), "step.retrying");
        assert_eq!(EventKind::WorkflowCancelled.as_str(), "workflow.cancelled");
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(EventKind::StepCompleted, move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        bus.emit(&WorkflowEvent::new(
            EventKind::StepCompleted,
            InstanceId::new(),
        ));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let fired = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::WorkflowFailed, |_| Err("boom".into()));
        {
            let fired = Arc::clone(&fired);
            bus.subscribe(EventKind::WorkflowFailed, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        bus.emit(&WorkflowEvent::new(
            EventKind::WorkflowFailed,
            InstanceId::new(),
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let id = {
            let fired = Arc::clone(&fired);
            bus.subscribe(EventKind::StepStarted, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.emit(&WorkflowEvent::new(EventKind::StepStarted, InstanceId::new()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_events_only_reach_matching_kind() {
        let bus = EventBus::new();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = Arc::clone(&fired);
            bus.subscribe(EventKind::StepCompleted, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        bus.emit(&WorkflowEvent::new(EventKind::StepFailed, InstanceId::new()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
