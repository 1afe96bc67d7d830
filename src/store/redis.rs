//! Redis-backed store.
//!
//! Ordinary commands go through a shared `ConnectionManager`, which
//! reconnects automatically. Blocking pops hold their connection for the
//! whole wait, so they use dedicated connections kept in a small idle list
//! instead of stalling the shared one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use tracing::debug;

use super::{KeyType, Namespace, Store, StoreError};

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 8;

/// Store implementation over Redis.
#[derive(Clone)]
pub struct RedisStore {
    client: ::redis::Client,
    redis: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    namespace: Namespace,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `namespace` - Prefix applied to every key
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the connection fails.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!(url = %redis_url, namespace = %namespace, "Connected to Redis");

        Ok(Self {
            client,
            redis,
            blocking: Arc::new(Mutex::new(Vec::new())),
            namespace: Namespace::new(namespace),
        })
    }

    fn key(&self, key: &str) -> String {
        self.namespace.key(key)
    }

    /// Takes an idle blocking connection or opens a new one.
    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        if let Some(conn) = idle {
            return Ok(conn);
        }

        debug!("Opening blocking Redis connection");
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Returns a healthy blocking connection to the idle list.
    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    /// Number of idle blocking connections.
    pub fn idle_blocking(&self) -> usize {
        self.blocking.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.incr::<_, _, i64>(self.key(key), 1).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(self.key(key)).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.key(key), value).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.set_nx::<_, _, bool>(self.key(key), value).await?)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists::<_, bool>(self.key(key)).await?)
    }

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        let mut conn = self.redis.clone();
        let name: String = ::redis::cmd("TYPE")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(KeyType::from_name(&name))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let set: i64 = ::redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn.keys(self.key(pattern)).await?;
        Ok(keys
            .iter()
            .map(|k| self.namespace.strip(k).to_string())
            .collect())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.rpush::<_, _, usize>(self.key(key), value).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lpush::<_, _, usize>(self.key(key), value).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(::redis::cmd("LPOP")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(::redis::cmd("RPOP")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?)
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        if keys.is_empty() {
            return Ok(None);
        }

        let mut conn = self.checkout_blocking().await?;
        let namespaced: Vec<String> = keys.iter().map(|k| self.key(k)).collect();

        // Fractional timeouts need Redis >= 6.0
        let result: Option<(String, String)> = ::redis::cmd("BLPOP")
            .arg(&namespaced)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        self.checkin_blocking(conn);

        Ok(result.map(|(key, value)| (self.namespace.strip(&key).to_string(), value)))
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen::<_, usize>(self.key(key)).await?)
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn
            .lrange::<_, Vec<String>>(self.key(key), start, stop)
            .await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(self.key(key), field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.hget::<_, _, Option<String>>(self.key(key), field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.hdel(self.key(key), field).await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.hlen::<_, usize>(self.key(key)).await?)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.hexists::<_, _, bool>(self.key(key), field).await?)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.hkeys::<_, Vec<String>>(self.key(key)).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(self.key(key), member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.srem(self.key(key), member).await?;
        Ok(removed > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.sismember::<_, _, bool>(self.key(key), member).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.smembers::<_, Vec<String>>(self.key(key)).await?)
    }
}
