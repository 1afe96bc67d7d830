//! Coordination store.
//!
//! All shared state (queues, job sequence, worker registry, daemon pid) lives
//! in a key/value store offering atomic string, counter, list, hash and set
//! primitives plus a multi-key blocking pop.
//!
//! - **RedisStore**: production backend over a Redis connection manager
//! - **MemoryStore**: process-local backend with identical semantics
//!
//! Keys are namespaced by the backend (`<namespace>:<key>`). Keys handed
//! back by the backend (blocking pop, key listing) are un-namespaced.

pub mod codec;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A command was applied to a key holding another type.
    #[error("Wrong type for key '{0}'")]
    WrongType(String),
}

/// Type of the value stored under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    None,
    String,
    List,
    Hash,
    Set,
    Other(String),
}

impl KeyType {
    /// Parses the type name reported by the store.
    pub fn from_name(name: &str) -> Self {
        match name {
            "none" => KeyType::None,
            "string" => KeyType::String,
            "list" => KeyType::List,
            "hash" => KeyType::Hash,
            "set" => KeyType::Set,
            other => KeyType::Other(other.to_string()),
        }
    }
}

/// Async key/value store contract.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically increments a counter and returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Sets the key only if it does not exist. Returns `true` if it was set.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Deletes a key. Returns `true` if it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError>;

    /// Sets a time-to-live. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Lists keys matching a glob pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Pops the head of the first non-empty list in `keys`, blocking up to
    /// `timeout`. A zero timeout blocks indefinitely. Returns the
    /// un-namespaced key and the value, or `None` on timeout.
    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Returns list elements between `start` and `stop` (inclusive,
    /// negative indexes count from the tail).
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn hlen(&self, key: &str) -> Result<usize, StoreError>;

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Adds a set member. Returns `true` if it was not present.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Deletes every key matching a pattern. Returns the number deleted.
    async fn delete_keys(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for key in self.keys(pattern).await? {
            if self.del(&key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Key namespacing shared by the backends.
#[derive(Debug, Clone)]
pub(crate) struct Namespace {
    prefix: String,
}

impl Namespace {
    pub(crate) fn new(namespace: &str) -> Self {
        Self {
            prefix: format!("{}:", namespace),
        }
    }

    pub(crate) fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub(crate) fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }
}
