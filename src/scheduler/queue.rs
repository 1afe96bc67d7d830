//! Named FIFO queues stored as lists.
//!
//! # Queue Structure
//!
//! Each configured queue is one list under `{queue_key}:{name}`. Items are
//! appended at the tail and consumed from the head, so a queue is strictly
//! FIFO; a rolled-back item is pushed back at the head and is the next one
//! consumed.
//!
//! [`Queues`] is the registry of configured queues. Its [`Queues::poll`]
//! blocks on all of them at once and always serves the first non-empty
//! queue in configuration order.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, DEFAULT_QUEUE};
use crate::store::codec;
use crate::store::{KeyType, Store, StoreError};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue name is not part of the configuration.
    #[error("Queue '{0}' is not configured")]
    UnknownQueue(String),

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failed to serialize an item.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// A single FIFO queue.
pub struct Queue {
    name: String,
    key: String,
    store: Arc<dyn Store>,
}

impl Queue {
    /// Opens a queue, discarding whatever non-list value occupies its key.
    pub async fn open(
        store: Arc<dyn Store>,
        key_prefix: &str,
        name: &str,
    ) -> Result<Self, QueueError> {
        let key = format!("{}:{}", key_prefix, name);
        let key_type = store.key_type(&key).await?;
        if !matches!(key_type, KeyType::List | KeyType::None) {
            info!(queue = %name, key = %key, found = ?key_type, "Resetting queue key holding a non-list value");
            store.del(&key).await?;
        }

        Ok(Self {
            name: name.to_string(),
            key,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends an item at the tail. Returns the new length.
    pub async fn push<T: Serialize>(&self, item: &T) -> Result<usize, QueueError> {
        let raw = codec::encode(item)?;
        Ok(self.store.rpush(&self.key, &raw).await?)
    }

    /// Inserts an item at the head. Returns the new length.
    pub async fn unshift<T: Serialize>(&self, item: &T) -> Result<usize, QueueError> {
        let raw = codec::encode(item)?;
        Ok(self.store.lpush(&self.key, &raw).await?)
    }

    /// Removes and returns the head item.
    pub async fn shift<T: DeserializeOwned>(&self) -> Result<Option<T>, QueueError> {
        let raw = self.store.lpop(&self.key).await?;
        Ok(raw.and_then(|raw| codec::decode(&raw)))
    }

    /// Removes and returns the tail item.
    pub async fn pop<T: DeserializeOwned>(&self) -> Result<Option<T>, QueueError> {
        let raw = self.store.rpop(&self.key).await?;
        Ok(raw.and_then(|raw| codec::decode(&raw)))
    }

    /// Removes and returns the head item, waiting up to `timeout`.
    pub async fn blocking_shift<T: DeserializeOwned>(
        &self,
        timeout: Duration,
    ) -> Result<Option<T>, QueueError> {
        let popped = self
            .store
            .blpop(std::slice::from_ref(&self.key), timeout)
            .await?;
        Ok(popped.and_then(|(_, raw)| codec::decode(&raw)))
    }

    /// Returns up to `count` items from the head without removing them.
    pub async fn peek<T: DeserializeOwned>(&self, count: usize) -> Result<Vec<T>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .lrange(&self.key, 0, count as isize - 1)
            .await?;
        Ok(raw.iter().filter_map(|r| codec::decode(r)).collect())
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.llen(&self.key).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Removes every item.
    pub async fn reset(&self) -> Result<(), QueueError> {
        self.store.del(&self.key).await?;
        debug!(queue = %self.name, "Queue reset");
        Ok(())
    }
}

/// An item taken from one of the registered queues.
#[derive(Debug, Clone, PartialEq)]
pub struct Polled<T> {
    /// Name of the queue the item came from.
    pub queue: String,
    pub item: T,
}

/// Registry of the configured queues, in priority order.
pub struct Queues {
    key_prefix: String,
    queues: Vec<Queue>,
    store: Arc<dyn Store>,
}

impl Queues {
    /// Opens every configured queue.
    pub async fn open(store: Arc<dyn Store>, config: &Config) -> Result<Self, QueueError> {
        let mut queues = Vec::with_capacity(config.queues.len());
        for name in &config.queues {
            queues.push(Queue::open(Arc::clone(&store), &config.queue_key, name).await?);
        }

        if !queues.iter().any(|q| q.name() == DEFAULT_QUEUE) {
            return Err(QueueError::UnknownQueue(DEFAULT_QUEUE.to_string()));
        }

        Ok(Self {
            key_prefix: format!("{}:", config.queue_key),
            queues,
            store,
        })
    }

    /// Queue names in priority order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(Queue::name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn find(&self, name: &str) -> Option<&Queue> {
        self.queues.iter().find(|q| q.name() == name)
    }

    /// Looks up a queue, failing for names outside the configuration.
    pub fn get(&self, name: &str) -> Result<&Queue, QueueError> {
        self.find(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    /// The `default` queue.
    pub fn default_queue(&self) -> Result<&Queue, QueueError> {
        self.get(DEFAULT_QUEUE)
    }

    /// Takes the head of the first non-empty queue in priority order,
    /// waiting up to `timeout` when all are empty. An undecodable item is
    /// consumed and reported as `None`.
    pub async fn poll<T: DeserializeOwned>(
        &self,
        timeout: Duration,
    ) -> Result<Option<Polled<T>>, QueueError> {
        let keys: Vec<String> = self.queues.iter().map(|q| q.key().to_string()).collect();
        let Some((key, raw)) = self.store.blpop(&keys, timeout).await? else {
            return Ok(None);
        };

        let queue = self.queue_name(&key).to_string();
        Ok(codec::decode(&raw).map(|item| Polled { queue, item }))
    }

    /// Empties every queue.
    pub async fn reset_all(&self) -> Result<(), QueueError> {
        for queue in &self.queues {
            queue.reset().await?;
        }
        Ok(())
    }

    /// Current depth of every queue, in priority order.
    pub async fn lengths(&self) -> Result<Vec<(String, usize)>, QueueError> {
        let mut lengths = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            lengths.push((queue.name().to_string(), queue.len().await?));
        }
        Ok(lengths)
    }

    fn queue_name<'k>(&self, key: &'k str) -> &'k str {
        key.strip_prefix(self.key_prefix.as_str()).unwrap_or(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        n: u32,
    }

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::default())
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::open(store(), "queue", "default").await.unwrap();
        for n in 1..=3 {
            queue.push(&Item { n }).await.unwrap();
        }

        assert_eq!(queue.len().await.unwrap(), 3);
        for n in 1..=3 {
            assert_eq!(queue.shift::<Item>().await.unwrap(), Some(Item { n }));
        }
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_unshift_is_next() {
        let queue = Queue::open(store(), "queue", "default").await.unwrap();
        queue.push(&Item { n: 1 }).await.unwrap();
        queue.push(&Item { n: 2 }).await.unwrap();
        queue.unshift(&Item { n: 9 }).await.unwrap();

        assert_eq!(
            queue.peek::<Item>(2).await.unwrap(),
            vec![Item { n: 9 }, Item { n: 1 }]
        );
        assert_eq!(queue.pop::<Item>().await.unwrap(), Some(Item { n: 2 }));
        assert_eq!(queue.shift::<Item>().await.unwrap(), Some(Item { n: 9 }));
    }

    #[tokio::test]
    async fn test_open_resets_non_list_key() {
        let store = store();
        store.set("queue:default", "garbage").await.unwrap();

        let queue = Queue::open(Arc::clone(&store), "queue", "default")
            .await
            .unwrap();
        assert_eq!(store.key_type("queue:default").await.unwrap(), KeyType::None);
        queue.push(&Item { n: 1 }).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_keeps_existing_items() {
        let store = store();
        let first = Queue::open(Arc::clone(&store), "queue", "default")
            .await
            .unwrap();
        first.push(&Item { n: 1 }).await.unwrap();

        let again = Queue::open(Arc::clone(&store), "queue", "default")
            .await
            .unwrap();
        assert_eq!(again.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_item_is_none() {
        let store = store();
        let queue = Queue::open(Arc::clone(&store), "queue", "default")
            .await
            .unwrap();
        store.rpush("queue:default", "{broken").await.unwrap();

        assert_eq!(queue.shift::<Item>().await.unwrap(), None);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_poll_priority_order() {
        let store = store();
        let config = Config::default().with_queues(["critical", "default"]);
        let queues = Queues::open(Arc::clone(&store), &config).await.unwrap();

        queues.get("default").unwrap().push(&Item { n: 1 }).await.unwrap();
        queues.get("critical").unwrap().push(&Item { n: 2 }).await.unwrap();
        queues.get("default").unwrap().push(&Item { n: 3 }).await.unwrap();

        let timeout = Duration::from_millis(20);
        let mut order = Vec::new();
        while let Some(polled) = queues.poll::<Item>(timeout).await.unwrap() {
            order.push((polled.queue, polled.item.n));
        }

        assert_eq!(
            order,
            vec![
                ("critical".to_string(), 2),
                ("default".to_string(), 1),
                ("default".to_string(), 3)
            ]
        );
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let config = Config::default().with_queues(["default", "mail"]);
        let queues = Queues::open(store(), &config).await.unwrap();

        assert_eq!(queues.names().collect::<Vec<_>>(), vec!["default", "mail"]);
        assert!(queues.exists("mail"));
        assert!(!queues.exists("reports"));
        assert!(matches!(
            queues.get("reports"),
            Err(QueueError::UnknownQueue(name)) if name == "reports"
        ));
        assert_eq!(queues.default_queue().unwrap().key(), "queue:default");
    }

    #[tokio::test]
    async fn test_reset_all_and_lengths() {
        let config = Config::default().with_queues(["default", "mail"]);
        let queues = Queues::open(store(), &config).await.unwrap();
        queues.get("mail").unwrap().push(&Item { n: 1 }).await.unwrap();

        assert_eq!(
            queues.lengths().await.unwrap(),
            vec![("default".to_string(), 0), ("mail".to_string(), 1)]
        );
        queues.reset_all().await.unwrap();
        assert!(queues.get("mail").unwrap().is_empty().await.unwrap());
    }
}
