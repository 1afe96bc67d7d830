//! Worker pool.
//!
//! The pool turns registered workers into running tasks. Each spawned
//! worker takes a slot from its collection, runs its body as an independent
//! async task and gives the slot back when the body ends, whether it
//! returned or panicked.
//!
//! # Features
//!
//! - Slot-bounded spawning per worker type
//! - Dead worker reclamation
//! - Graceful shutdown with timeout
//! - Pool statistics tracking

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::callbacks::Hook;
use crate::context::Context;
use crate::error::Result;

use super::collection::{Collection, CollectionSet};
use super::record::Worker;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers spawned since the pool was created.
    pub spawned: u64,
    /// Workers whose body has ended.
    pub finished: u64,
    /// Workers whose body panicked.
    pub panicked: u64,
    /// Dead workers reclaimed by maintenance.
    pub reclaimed: u64,
}

impl PoolStats {
    /// Workers spawned but not yet finished.
    pub fn running(&self) -> u64 {
        self.spawned.saturating_sub(self.finished)
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    spawned: AtomicU64,
    finished: AtomicU64,
    panicked: AtomicU64,
    reclaimed: AtomicU64,
}

impl SharedPoolStats {
    fn to_pool_stats(&self) -> PoolStats {
        PoolStats {
            spawned: self.spawned.load(Ordering::SeqCst),
            finished: self.finished.load(Ordering::SeqCst),
            panicked: self.panicked.load(Ordering::SeqCst),
            reclaimed: self.reclaimed.load(Ordering::SeqCst),
        }
    }
}

/// Spawns and tracks workers of every type on this host.
pub struct WorkerPool {
    ctx: Context,
    set: CollectionSet,
    collections: tokio::sync::Mutex<HashMap<String, Arc<Collection>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    pub async fn new(ctx: &Context) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            set: CollectionSet::open(ctx).await?,
            collections: tokio::sync::Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(SharedPoolStats::default()),
        })
    }

    /// The collection for `worker_type`, registered on first use. The same
    /// instance is returned for the lifetime of the pool so its lock is
    /// initialised once.
    pub async fn collection(&self, worker_type: &str) -> Result<Arc<Collection>> {
        let mut collections = self.collections.lock().await;
        if let Some(collection) = collections.get(worker_type) {
            return Ok(Arc::clone(collection));
        }
        let collection = Arc::new(self.set.create(worker_type).await?);
        collections.insert(worker_type.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    /// Registers a worker of `worker_type` and runs `body` for it on a new
    /// task. The slot is returned when `body` ends.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` if every slot stays taken for the lock timeout and
    /// `Error::Termination` if the process is stopping.
    pub async fn spawn<F, Fut>(&self, worker_type: &str, body: F) -> Result<Arc<Worker>>
    where
        F: FnOnce(Arc<Worker>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let collection = self.collection(worker_type).await?;
        let ctx = self.ctx.clone();
        let stats = Arc::clone(&self.stats);
        let owner = Arc::clone(&collection);

        let worker = collection
            .add(|worker| async move {
                let span = info_span!("worker", id = %worker.id(), kind = %owner.name());
                let task = run_worker(ctx, owner, Arc::clone(&worker), stats, body);
                let handle = tokio::spawn(task.instrument(span));
                self.track(handle);
                Ok::<_, crate::error::Error>(worker)
            })
            .await?;

        self.stats.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(worker)
    }

    /// Every worker registered on this host, across all types.
    pub async fn all(&self) -> Result<Vec<Arc<Worker>>> {
        let mut workers = Vec::new();
        for name in self.set.names().await? {
            let collection = self.collection(&name).await?;
            workers.extend(collection.workers().await?);
        }
        Ok(workers)
    }

    /// Removes workers whose process is gone and returns their slots.
    /// Returns how many were reclaimed.
    pub async fn delete_dead_workers(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for name in self.set.names().await? {
            let collection = self.collection(&name).await?;
            for worker in collection.dead_workers().await? {
                if collection.delete(&worker).await? {
                    warn!(
                        worker_id = %worker.id(),
                        pid = ?worker.pid(),
                        collection = %name,
                        "Reclaimed dead worker"
                    );
                    reclaimed += 1;
                }
            }
        }
        self.stats
            .reclaimed
            .fetch_add(reclaimed as u64, Ordering::SeqCst);
        Ok(reclaimed)
    }

    /// Number of worker tasks still running.
    pub fn active(&self) -> usize {
        let mut handles = self.lock_handles();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats()
    }

    /// Waits for every worker task to finish.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if tasks are still running after
    /// `timeout`; they are aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_handles());
        if handles.is_empty() {
            return Ok(());
        }

        info!(workers = handles.len(), "Waiting for workers to finish");
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task failed during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                Err(PoolError::ShutdownTimeout(timeout).into())
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.lock_handles();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_worker<F, Fut>(
    ctx: Context,
    collection: Arc<Collection>,
    worker: Arc<Worker>,
    stats: Arc<SharedPoolStats>,
    body: F,
) where
    F: FnOnce(Arc<Worker>) -> Fut,
    Fut: Future<Output = ()>,
{
    if let Err(e) = worker.start(ctx.process.pid()).await {
        warn!(error = %e, "Failed to record worker start");
    }
    ctx.callbacks.fire(Hook::WorkerStart);
    debug!("Worker started");

    if AssertUnwindSafe(body(Arc::clone(&worker)))
        .catch_unwind()
        .await
        .is_err()
    {
        stats.panicked.fetch_add(1, Ordering::SeqCst);
        error!("Worker panicked");
    }

    if let Err(e) = collection.delete(&worker).await {
        error!(error = %e, "Failed to deregister worker");
    }
    stats.finished.fetch_add(1, Ordering::SeqCst);
    debug!(processed = worker.processed(), "Worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::process::DEAD_PID;
    use crate::store::{codec, MemoryStore};
    use crate::worker::WorkerRecord;
    use tokio::sync::oneshot;

    async fn pool(concurrency: usize) -> (Context, WorkerPool) {
        let config = Config::default()
            .with_hostname("testhost")
            .with_concurrency(concurrency)
            .with_worker_lock_timeout(Duration::from_millis(30))
            .finalize()
            .unwrap();
        let ctx = Context::new(config, Arc::new(MemoryStore::default()))
            .await
            .unwrap();
        ctx.process.startup();
        let pool = WorkerPool::new(&ctx).await.unwrap();
        (ctx, pool)
    }

    #[tokio::test]
    async fn test_spawn_runs_body_and_releases_slot() {
        let (_ctx, pool) = pool(1).await;
        let (tx, rx) = oneshot::channel();

        let worker = pool
            .spawn("job", move |worker| async move {
                let _ = tx.send(worker.is_started());
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap());

        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        let collection = pool.collection("job").await.unwrap();
        assert!(!collection.include(&worker.id()).await.unwrap());
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 1);

        let stats = pool.stats();
        assert_eq!((stats.spawned, stats.finished, stats.running()), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_spawn_bounded_by_concurrency() {
        let (_ctx, pool) = pool(1).await;
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.spawn("job", move |_worker| async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();

        let err = pool.spawn("job", |_worker| async {}).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(pool.all().await.unwrap().len(), 1);

        release_tx.send(()).unwrap();
        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        pool.spawn("job", |_worker| async {}).await.unwrap();
        pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_body_releases_slot() {
        let (_ctx, pool) = pool(1).await;
        pool.spawn("job", |_worker| async { panic!("boom") })
            .await
            .unwrap();
        pool.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(pool.stats().panicked, 1);
        assert!(pool.all().await.unwrap().is_empty());
        pool.spawn("job", |_worker| async {}).await.unwrap();
        pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_dead_workers() {
        let (_ctx, pool) = pool(2).await;
        let collection = pool.collection("job").await.unwrap();
        let dead = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        dead.start(DEAD_PID).await.unwrap();
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 1);

        assert_eq!(pool.delete_dead_workers().await.unwrap(), 1);
        assert_eq!(pool.delete_dead_workers().await.unwrap(), 0);
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 2);
        assert_eq!(pool.stats().reclaimed, 1);
    }

    #[tokio::test]
    async fn test_reclaim_on_fresh_pool_keeps_capacity() {
        let (ctx, _) = pool(2).await;
        let key = format!("{}:job", ctx.config.workers_host_key());
        ctx.store
            .sadd(&ctx.config.workers_host_key(), "job")
            .await
            .unwrap();
        for id in ["left-1", "left-2"] {
            let mut record = WorkerRecord::new(id, "job", "testhost");
            record.pid = Some(DEAD_PID);
            record.started_at = Some(chrono::Utc::now());
            ctx.store
                .hset(&key, id, &codec::encode(&record).unwrap())
                .await
                .unwrap();
        }

        // a restarted daemon sweeps before its lock was ever used
        let pool = WorkerPool::new(&ctx).await.unwrap();
        assert_eq!(pool.delete_dead_workers().await.unwrap(), 2);

        let collection = pool.collection("job").await.unwrap();
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 2);
        for _ in 0..2 {
            collection
                .add(|w| async move { Ok::<_, Error>(w) })
                .await
                .unwrap();
        }
        let err = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(collection.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_aborts() {
        let (_ctx, pool) = pool(1).await;
        pool.spawn("job", |_worker| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await
        .unwrap();
        assert_eq!(pool.active(), 1);

        let err = pool.shutdown(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::ShutdownTimeout(_))));
    }
}
