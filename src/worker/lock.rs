//! Distributed counting semaphore.
//!
//! The lock is a list of opaque tokens under `{collection_key}:lock`.
//! Acquiring pops a token (blocking up to the lock timeout); releasing
//! pushes one back. A popped token doubles as the id of the worker that
//! holds the slot, so the token pool is also the worker-id allocator.
//!
//! Invariant: `available + live registrations == capacity` once every
//! holder has either released or been reclaimed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;

/// Token-based semaphore stored as a list.
pub struct WorkerLock {
    key: String,
    capacity: usize,
    timeout: Duration,
    store: Arc<dyn Store>,
}

impl WorkerLock {
    /// Creates a handle for the lock of a worker collection. Does not touch
    /// the store; call [`WorkerLock::reset`] to fill the token pool.
    pub fn new(
        store: Arc<dyn Store>,
        collection_key: &str,
        capacity: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            key: format!("{}:lock", collection_key),
            capacity,
            timeout,
            store,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refills the pool with `capacity` fresh tokens.
    pub async fn reset(&self) -> Result<()> {
        self.store.del(&self.key).await?;
        for _ in 0..self.capacity {
            self.store.rpush(&self.key, &new_token()).await?;
        }
        debug!(key = %self.key, capacity = self.capacity, "Worker lock reset");
        Ok(())
    }

    /// Takes a token, waiting up to the lock timeout.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if no token became available in time.
    pub async fn acquire(&self) -> Result<String> {
        let popped = self
            .store
            .blpop(std::slice::from_ref(&self.key), self.timeout)
            .await?;
        match popped {
            Some((_, token)) => Ok(token),
            None => Err(Error::Timeout(format!(
                "no free worker slot after {:?}",
                self.timeout
            ))),
        }
    }

    /// Takes a token and runs `body` with it. If `body` fails the token is
    /// released before the error is returned; on success the caller owns it.
    pub async fn acquire_with<F, Fut, R>(&self, body: F) -> Result<R>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let token = self.acquire().await?;
        match body(token.clone()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(release_err) = self.release(Some(token)).await {
                    error!(key = %self.key, error = %release_err, "Failed to release worker slot");
                }
                Err(e)
            }
        }
    }

    /// Returns a token to the pool; a fresh one when `token` is `None`.
    pub async fn release(&self, token: Option<String>) -> Result<()> {
        let token = token.unwrap_or_else(new_token);
        self.store.rpush(&self.key, &token).await?;
        Ok(())
    }

    /// Removes a token without waiting. `None` when the pool is empty.
    pub async fn get(&self) -> Result<Option<String>> {
        Ok(self.store.rpop(&self.key).await?)
    }

    /// Number of tokens currently available.
    pub async fn size(&self) -> Result<usize> {
        Ok(self.store.llen(&self.key).await?)
    }

    /// Number of slots currently taken.
    pub async fn acquired(&self) -> Result<usize> {
        Ok(self.capacity.saturating_sub(self.size().await?))
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}
