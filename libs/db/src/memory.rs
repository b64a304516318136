//! In-memory store implementations
//!
//! Test fakes with the same semantics as the PostgreSQL and Redis
//! backends, injectable anywhere the store traits are accepted. The
//! coordination fake honours TTLs against a monotonic clock so lock
//! expiry behaviour can be exercised without a Redis server.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use maestro_domain::{
    DefinitionId, InstanceId, InstanceSnapshot, WorkflowDefinition, WorkflowInstance,
    WorkflowStatus,
};

use crate::coordination::{CoordinationError, CoordinationStore};
use crate::definition_store::{
    DefinitionStore, FindDefinitionError, ListDefinitionsError, UpsertDefinitionError,
};
use crate::instance_store::{
    FindInstanceError, InstanceFilter, InstanceStore, ListInstancesError, SaveInstanceError,
    UpdateInstanceError,
};

// =============================================================================
// In-Memory Instance Store
// =============================================================================

/// In-memory instance store for development and testing
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: Mutex<HashMap<InstanceId, WorkflowInstance>>,
}

impl InMemoryInstanceStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), SaveInstanceError> {
        let mut instances = self.instances.lock().await;
        if instances.contains_key(&instance.id) {
            return Err(SaveInstanceError::Duplicate(instance.id));
        }
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<(), UpdateInstanceError> {
        let mut instances = self.instances.lock().await;
        if !instances.contains_key(&instance.id) {
            return Err(UpdateInstanceError::NotFound(instance.id));
        }
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<WorkflowInstance>, FindInstanceError> {
        let instances = self.instances.lock().await;
        Ok(instances.get(id).cloned())
    }

    async fn list(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, ListInstancesError> {
        let instances = self.instances.lock().await;
        let mut matched: Vec<WorkflowInstance> = instances
            .values()
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .filter(|i| {
                filter
                    .triggered_by
                    .as_deref()
                    .is_none_or(|t| i.triggered_by.as_deref() == Some(t))
            })
            .filter(|i| {
                filter
                    .started_after
                    .is_none_or(|after| i.started_at.is_some_and(|s| s >= after))
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            matched.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(matched)
    }
}

// =============================================================================
// In-Memory Definition Store
// =============================================================================

/// In-memory definition store for development and testing
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: Mutex<Vec<WorkflowDefinition>>,
}

impl InMemoryDefinitionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn upsert(&self, def: &WorkflowDefinition) -> Result<(), UpsertDefinitionError> {
        let mut definitions = self.definitions.lock().await;
        if let Some(existing) = definitions
            .iter_mut()
            .find(|d| d.name == def.name && d.version == def.version)
        {
            *existing = def.clone();
        } else {
            definitions.push(def.clone());
        }
        Ok(())
    }

    async fn find_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, FindDefinitionError> {
        let definitions = self.definitions.lock().await;
        let mut candidates: Vec<&WorkflowDefinition> = definitions
            .iter()
            .filter(|d| d.name == name && d.is_active)
            .filter(|d| version.is_none_or(|v| d.version == v))
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(candidates.first().map(|d| (*d).clone()))
    }

    async fn find_by_id(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<WorkflowDefinition>, FindDefinitionError> {
        let definitions = self.definitions.lock().await;
        Ok(definitions.iter().find(|d| d.id == *id).cloned())
    }

    async fn list(
        &self,
        category: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<WorkflowDefinition>, ListDefinitionsError> {
        let definitions = self.definitions.lock().await;
        let mut matched: Vec<WorkflowDefinition> = definitions
            .iter()
            .filter(|d| category.is_none_or(|c| d.category == c))
            .filter(|d| !active_only || d.is_active)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched)
    }

    async fn categories(&self) -> Result<Vec<String>, ListDefinitionsError> {
        let definitions = self.definitions.lock().await;
        let mut categories: Vec<String> = definitions.iter().map(|d| d.category.clone()).collect();
        categories.sort();
        categories.dedup();
        Ok(categories)
    }

    async fn set_active(&self, name: &str, active: bool) -> Result<bool, UpsertDefinitionError> {
        let mut definitions = self.definitions.lock().await;
        let mut found = false;
        for def in definitions.iter_mut().filter(|d| d.name == name) {
            def.is_active = active;
            found = true;
        }
        Ok(found)
    }
}

// =============================================================================
// In-Memory Coordination Store
// =============================================================================

struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// In-memory coordination store with virtual TTL handling
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    states: Mutex<HashMap<InstanceId, InstanceSnapshot>>,
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryCoordinationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn put_state(&self, snapshot: &InstanceSnapshot) -> Result<(), CoordinationError> {
        let mut states = self.states.lock().await;
        states.insert(snapshot.instance_id, snapshot.clone());
        Ok(())
    }

    async fn get_state(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceSnapshot>, CoordinationError> {
        let states = self.states.lock().await;
        Ok(states.get(instance_id).cloned())
    }

    async fn delete_state(&self, instance_id: &InstanceId) -> Result<(), CoordinationError> {
        let mut states = self.states.lock().await;
        states.remove(instance_id);
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        if locks.get(key).is_some_and(|e| e.expires_at > now) {
            return Ok(false);
        }

        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        let owned = locks
            .get(key)
            .is_some_and(|e| e.token == token && e.expires_at > now);
        if owned {
            locks.remove(key);
        }
        Ok(owned)
    }

    async fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        match locks.get_mut(key) {
            Some(entry) if entry.token == token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_instances(&self) -> Result<Vec<InstanceId>, CoordinationError> {
        let states = self.states.lock().await;
        Ok(states
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    WorkflowStatus::Pending | WorkflowStatus::Running | WorkflowStatus::Retry
                )
            })
            .map(|s| s.instance_id)
            .collect())
    }
}
