//! Coordination store trait and key layout
//!
//! Fast shared KV with TTL and atomic set-if-absent / compare-and-delete,
//! used for step locks, the per-instance mutex and hot-path caching of
//! instance state. Lock ownership is fenced by a random token written on
//! acquisition; release and extension verify the token so an expired
//! holder cannot clobber a new owner.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use maestro_domain::{InstanceId, InstanceSnapshot};

/// TTL for cached instance state (24 hours), refreshed on every write
pub const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Keys
// =============================================================================

/// Prefix for cached instance state blobs
pub const STATE_PREFIX: &str = "workflow:state:";

/// Key for the cached state blob of an instance
#[must_use]
pub fn state_key(instance_id: &InstanceId) -> String {
    format!("{STATE_PREFIX}{instance_id}")
}

/// Key for the execution lock of a (instance, step) pair
#[must_use]
pub fn step_lock_key(instance_id: &InstanceId, step_id: &str) -> String {
    format!("workflow:lock:step:{instance_id}:{step_id}")
}

/// Key for the short-held mutex guarding state transitions of an instance
#[must_use]
pub fn instance_lock_key(instance_id: &InstanceId) -> String {
    format!("workflow:lock:{instance_id}")
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("failed to create redis pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("redis operation failed: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =============================================================================
// Trait
// =============================================================================

/// Shared coordination primitives for running instances
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Cache an instance snapshot under [`state_key`], refreshing the TTL
    async fn put_state(&self, snapshot: &InstanceSnapshot) -> Result<(), CoordinationError>;

    /// Read a cached snapshot; `None` on cache miss or expiry
    async fn get_state(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceSnapshot>, CoordinationError>;

    /// Drop the cached snapshot for an instance
    async fn delete_state(&self, instance_id: &InstanceId) -> Result<(), CoordinationError>;

    /// Set-if-absent with TTL. Returns false when the key is already held.
    async fn acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError>;

    /// Compare-and-delete: removes the key only while it still carries
    /// `token`. Returns false when ownership was lost.
    async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError>;

    /// Refresh the TTL of a held key. Returns false when ownership was
    /// lost; the holder must call this before the TTL elapses if it is
    /// still working.
    async fn extend(&self, key: &str, token: &str, ttl: Duration)
        -> Result<bool, CoordinationError>;

    /// Instance ids with a cached state blob in a non-terminal status
    async fn active_instances(&self) -> Result<Vec<InstanceId>, CoordinationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        let id: InstanceId = "wfi_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90".parse().unwrap();

        assert_eq!(
            state_key(&id),
            "workflow:state:wfi_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90"
        );
        assert_eq!(
            step_lock_key(&id, "analyze"),
            "workflow:lock:step:wfi_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90:analyze"
        );
        assert_eq!(
            instance_lock_key(&id),
            "workflow:lock:wfi_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90"
        );
    }
}
