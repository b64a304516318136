//! Redis coordination store
//!
//! Locks use `SET NX EX` with a fencing token; release and extension go
//! through small Lua scripts so the token check and the mutation are one
//! atomic round trip. Cached state uses `SETEX` and expires on its own.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, Script};
use deadpool_redis::{Config, Pool, Runtime};

use maestro_domain::{InstanceId, InstanceSnapshot, WorkflowStatus};

use crate::coordination::{state_key, CoordinationError, CoordinationStore, STATE_PREFIX, STATE_TTL};

const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
";

const EXTEND_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('expire', KEYS[1], ARGV[2])
else
    return 0
end
";

/// Configuration for the Redis connection
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://localhost:6379"),
        }
    }
}

/// Redis-backed coordination store
pub struct RedisCoordinationStore {
    pool: Pool,
    release_script: Script,
    extend_script: Script,
}

impl RedisCoordinationStore {
    /// Create a store with a fresh connection pool
    pub fn connect(config: &RedisConfig) -> Result<Self, CoordinationError> {
        let pool = Config::from_url(&config.url).create_pool(Some(Runtime::Tokio1))?;
        Ok(Self::new(pool))
    }

    /// Create a store over an existing pool
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn put_state(&self, snapshot: &InstanceSnapshot) -> Result<(), CoordinationError> {
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(snapshot)?;

        cmd("SETEX")
            .arg(state_key(&snapshot.instance_id))
            .arg(STATE_TTL.as_secs())
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_state(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceSnapshot>, CoordinationError> {
        let mut conn = self.pool.get().await?;
        let payload: Option<String> = cmd("GET")
            .arg(state_key(instance_id))
            .query_async(&mut conn)
            .await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_state(&self, instance_id: &InstanceId) -> Result<(), CoordinationError> {
        let mut conn = self.pool.get().await?;
        cmd("DEL")
            .arg(state_key(instance_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.pool.get().await?;
        let refreshed: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed > 0)
    }

    async fn active_instances(&self) -> Result<Vec<InstanceId>, CoordinationError> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut active = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{STATE_PREFIX}*"))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let Ok(instance_id) = key.trim_start_matches(STATE_PREFIX).parse::<InstanceId>()
                else {
                    continue;
                };
                if let Some(snapshot) = self.get_state(&instance_id).await? {
                    if matches!(
                        snapshot.status,
                        WorkflowStatus::Pending | WorkflowStatus::Running | WorkflowStatus::Retry
                    ) {
                        active.push(instance_id);
                    }
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(active)
    }
}
