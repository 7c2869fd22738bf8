//! Redis-backed store.
//!
//! Uses a [`ConnectionManager`], which reconnects on its own after
//! connection failures. Construction verifies connectivity with a PING so
//! misconfiguration fails fast at startup rather than on the first enqueue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::info;

use super::{ScoredMember, Store, StoreError};

/// Store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Database index appended to the URL when set.
    pub database: Option<u8>,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
        }
    }

    /// Read `QUEUE_STORE_URL` (falling back to `REDIS_URL`, then localhost)
    /// and `QUEUE_STORE_DB` from the environment.
    pub fn from_env() -> Self {
        let url = std::env::var("QUEUE_STORE_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let database = std::env::var("QUEUE_STORE_DB")
            .ok()
            .and_then(|v| v.parse().ok());
        Self { url, database }
    }

    fn connection_url(&self) -> String {
        match self.database {
            Some(db) => format!("{}/{}", self.url.trim_end_matches('/'), db),
            None => self.url.clone(),
        }
    }
}

/// [`Store`] implementation over a managed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the connection with a PING.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config.connection_url();
        info!(url = %url, "connecting to queue store");

        let client = Client::open(url.as_str()).map_err(StoreError::from)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(StoreError::from)?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        info!("queue store connected");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let () = self.conn().lpush(key, value).await?;
        Ok(())
    }

    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let () = self.conn().rpush(key, value).await?;
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().lrange(key, start, stop).await?)
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let () = self.conn().ltrim(key, start, stop).await?;
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        Ok(self.conn().lrem(key, 0, value).await?)
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.conn().llen(key).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        Ok(self.conn().hincr(key, field, delta).await?)
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let removed: u64 = self.conn().hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let () = self.conn().zadd(key, member, score).await?;
        Ok(())
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        match limit {
            Some(count) => Ok(self
                .conn()
                .zrangebyscore_limit(key, min, max, 0, count as isize)
                .await?),
            None => Ok(self.conn().zrangebyscore(key, min, max).await?),
        }
    }

    async fn zset_pop_min(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        Ok(self.conn().zpopmin(key, count as isize).await?)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: u64 = self.conn().zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zset_card(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zset_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        Ok(self.conn().zrembyscore(key, min, max).await?)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let () = self
            .conn()
            .set_ex(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let () = self.conn().del(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_appends_database_index() {
        let config = StoreConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            database: Some(2),
        };
        assert_eq!(config.connection_url(), "redis://127.0.0.1:6379/2");

        let plain = StoreConfig::new("redis://127.0.0.1:6379");
        assert_eq!(plain.connection_url(), "redis://127.0.0.1:6379");
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn connect_and_round_trip() {
        let config = StoreConfig::from_env();
        let store = RedisStore::connect(&config).await.unwrap();

        store.hash_set("conveyor:test", "k", "v").await.unwrap();
        assert_eq!(
            store.hash_get("conveyor:test", "k").await.unwrap(),
            Some("v".to_string())
        );
        store.del("conveyor:test").await.unwrap();
    }
}
