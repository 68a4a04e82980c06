//! Redis-backed pipeline store.
//!
//! Uses a `ConnectionManager`, which reconnects automatically and is cheap to
//! clone, so every command clones it instead of holding a shared connection.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{PipelineStore, StoreOp, Transaction};
use crate::error::StoreError;

/// Pipeline store over a single Redis deployment.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection with other components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PipelineStore for RedisStore {
    async fn list_right_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.rpush(key, value).await?)
    }

    async fn list_left_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lpush(key, value).await?)
    }

    async fn list_left_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lpop(key, None).await?)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(key).await?)
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get(key).await?)
    }

    async fn string_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn key_delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        Ok(conn.del(keys).await?)
    }

    async fn execute(&self, transaction: Transaction) -> Result<Vec<String>, StoreError> {
        if transaction.is_empty() {
            return Ok(Vec::new());
        }

        // MULTI/EXEC; only pops keep their replies, everything else is ignored
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in transaction.ops() {
            match op {
                StoreOp::ListLeftPop { key, count } => {
                    pipe.cmd("LPOP").arg(key).arg(*count);
                }
                StoreOp::StringSet { key, value } => {
                    pipe.set(key, value).ignore();
                }
                StoreOp::KeyDelete { keys } => {
                    pipe.del(keys).ignore();
                }
            }
        }

        let mut conn = self.redis.clone();
        let replies: Vec<redis::Value> = pipe.query_async(&mut conn).await?;

        let mut popped = Vec::new();
        for reply in &replies {
            let values: Option<Vec<String>> = redis::from_redis_value(reply)?;
            popped.extend(values.unwrap_or_default());
        }
        Ok(popped)
    }
}
