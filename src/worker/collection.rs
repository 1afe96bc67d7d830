//! Per-host worker registries.
//!
//! A [`Collection`] holds the workers of one type on one host as a hash
//! `workers:<host>:<type>` mapping worker id to its serialized record, and
//! owns the [`WorkerLock`] that bounds how many of them may exist. A
//! [`CollectionSet`] remembers which collections exist on the host.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::process::Process;
use crate::store::{codec, KeyType, Store};

use super::lock::WorkerLock;
use super::record::{RecordLocation, Worker, WorkerLimits, WorkerRecord};

/// Workers of one type on this host.
pub struct Collection {
    name: String,
    key: String,
    hostname: String,
    capacity: usize,
    lock_timeout: Duration,
    limits: WorkerLimits,
    store: Arc<dyn Store>,
    process: Arc<Process>,
    lock: OnceCell<WorkerLock>,
}

impl Collection {
    /// Opens the collection `name`, discarding a key of the wrong type.
    pub async fn open(ctx: &Context, name: &str) -> Result<Self> {
        let key = format!("{}:{}", ctx.config.workers_host_key(), name);
        match ctx.store.key_type(&key).await? {
            KeyType::None | KeyType::Hash => {}
            other => {
                debug!(key = %key, found = ?other, "Replacing worker collection of wrong type");
                ctx.store.del(&key).await?;
            }
        }

        Ok(Self {
            name: name.to_string(),
            key,
            hostname: ctx.config.hostname.clone(),
            capacity: ctx.config.concurrency,
            lock_timeout: ctx.config.worker_lock_timeout,
            limits: WorkerLimits::from_config(&ctx.config),
            store: Arc::clone(&ctx.store),
            process: Arc::clone(&ctx.process),
            lock: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The collection's slot lock, initialised on first use: the pool is
    /// refilled to capacity, then one token is taken for every worker
    /// already registered.
    pub async fn lock(&self) -> Result<&WorkerLock> {
        self.lock
            .get_or_try_init(|| async {
                let lock = WorkerLock::new(
                    Arc::clone(&self.store),
                    &self.key,
                    self.capacity,
                    self.lock_timeout,
                );
                lock.reset().await?;
                let registered = self.count().await?;
                for _ in 0..registered {
                    lock.get().await?;
                }
                debug!(
                    collection = %self.name,
                    capacity = self.capacity,
                    registered,
                    "Worker lock initialised"
                );
                Ok::<_, Error>(lock)
            })
            .await
    }

    /// Registers a new worker and runs `body` with it.
    ///
    /// The worker id is the token taken from the lock and the record carries
    /// the registering pid, so it can be reclaimed even if it is never
    /// started. If `body` fails the record is removed and the token is
    /// returned exactly once.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` when no slot frees up within the lock timeout and
    /// `Error::Termination` when the process is shutting down.
    pub async fn add<F, Fut, R>(&self, body: F) -> Result<R>
    where
        F: FnOnce(Arc<Worker>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let lock = self.lock().await?;
        lock.acquire_with(|id| async move {
            if !self.process.is_running() {
                return Err(Error::Termination);
            }

            let mut record = WorkerRecord::new(id, self.name.as_str(), self.hostname.as_str());
            record.pid = Some(self.process.pid());
            let worker = Arc::new(self.build(record));
            worker.save().await?;
            debug!(collection = %self.name, worker_id = %worker.id(), "Worker registered");

            match body(Arc::clone(&worker)).await {
                Ok(value) => Ok(value),
                Err(e) => {
                    worker.freeze();
                    if let Err(del_err) = self.store.hdel(&self.key, &worker.id()).await {
                        error!(worker_id = %worker.id(), error = %del_err, "Failed to remove worker record");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    /// Removes a worker and returns its slot. `false` if it was not
    /// registered, in which case no slot is returned.
    pub async fn delete(&self, worker: &Worker) -> Result<bool> {
        // the lock counts registered records when it initialises, so it
        // must see this one before it is removed
        let lock = self.lock().await?;
        worker.freeze();
        let id = worker.id();
        if !self.store.hdel(&self.key, &id).await? {
            debug!(collection = %self.name, worker_id = %id, "Worker was not registered");
            return Ok(false);
        }
        lock.release(None).await?;
        debug!(collection = %self.name, worker_id = %id, "Worker deregistered");
        Ok(true)
    }

    pub async fn include(&self, worker_id: &str) -> Result<bool> {
        Ok(self.store.hexists(&self.key, worker_id).await?)
    }

    /// Loads a registered worker.
    pub async fn find(&self, worker_id: &str) -> Result<Option<Arc<Worker>>> {
        let raw = self.store.hget(&self.key, worker_id).await?;
        Ok(raw
            .as_deref()
            .and_then(codec::decode::<WorkerRecord>)
            .map(|record| Arc::new(self.build(record))))
    }

    /// All registered workers. Unreadable records are skipped.
    pub async fn workers(&self) -> Result<Vec<Arc<Worker>>> {
        let mut workers = Vec::new();
        for id in self.store.hkeys(&self.key).await? {
            if let Some(worker) = self.find(&id).await? {
                workers.push(worker);
            }
        }
        Ok(workers)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.hlen(&self.key).await?)
    }

    /// Registered workers whose recorded process is gone, started or not.
    pub async fn dead_workers(&self) -> Result<Vec<Arc<Worker>>> {
        let workers = self.workers().await?;
        Ok(workers.into_iter().filter(|w| w.is_dead()).collect())
    }

    /// Drops every record and refills the lock if it was initialised.
    pub async fn delete_all(&self) -> Result<()> {
        self.store.del(&self.key).await?;
        if let Some(lock) = self.lock.get() {
            lock.reset().await?;
        }
        Ok(())
    }

    fn build(&self, record: WorkerRecord) -> Worker {
        Worker::new(
            record,
            self.limits,
            Some(RecordLocation {
                store: Arc::clone(&self.store),
                key: self.key.clone(),
            }),
        )
    }
}

/// The set of worker collections on this host.
pub struct CollectionSet {
    key: String,
    ctx: Context,
}

impl CollectionSet {
    /// Opens the set, discarding a key of the wrong type.
    pub async fn open(ctx: &Context) -> Result<Self> {
        let key = ctx.config.workers_host_key();
        match ctx.store.key_type(&key).await? {
            KeyType::None | KeyType::Set => {}
            other => {
                debug!(key = %key, found = ?other, "Replacing collection set of wrong type");
                ctx.store.del(&key).await?;
            }
        }
        Ok(Self {
            key,
            ctx: ctx.clone(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Registers `name` and opens its collection.
    pub async fn create(&self, name: &str) -> Result<Collection> {
        self.ctx.store.sadd(&self.key, name).await?;
        Collection::open(&self.ctx, name).await
    }

    /// Registered collection names, sorted.
    pub async fn names(&self) -> Result<Vec<String>> {
        let mut names = self.ctx.store.smembers(&self.key).await?;
        names.sort();
        Ok(names)
    }

    /// Opens every registered collection.
    pub async fn all(&self) -> Result<Vec<Collection>> {
        let mut collections = Vec::new();
        for name in self.names().await? {
            collections.push(Collection::open(&self.ctx, &name).await?);
        }
        Ok(collections)
    }

    pub async fn include(&self, name: &str) -> Result<bool> {
        Ok(self.ctx.store.sismember(&self.key, name).await?)
    }

    /// Forgets `name`. Its records are left in place.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.ctx.store.srem(&self.key, name).await?)
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.ctx.store.del(&self.key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::process::DEAD_PID;
    use crate::store::MemoryStore;

    async fn context(concurrency: usize) -> Context {
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
        ctx
    }

    #[tokio::test]
    async fn test_add_and_delete_restore_capacity() {
        let ctx = context(2).await;
        let collection = Collection::open(&ctx, "job").await.unwrap();
        assert_eq!(collection.key(), "workers:testhost:job");

        let first = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        let second = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(collection.count().await.unwrap(), 2);
        assert!(collection.include(&first.id()).await.unwrap());

        let lock = collection.lock().await.unwrap();
        assert_eq!(lock.size().await.unwrap(), 0);
        let err = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        assert!(collection.delete(&first).await.unwrap());
        assert!(!collection.delete(&first).await.unwrap());
        assert_eq!(lock.size().await.unwrap(), 1);
        assert_eq!(collection.count().await.unwrap(), 1);
        assert!(first.is_frozen());
    }

    #[tokio::test]
    async fn test_add_failure_releases_once() {
        let ctx = context(1).await;
        let collection = Collection::open(&ctx, "job").await.unwrap();

        let err = collection
            .add(|_w| async { Err::<(), _>(Error::Panicked("body".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Panicked(_)));
        assert_eq!(collection.count().await.unwrap(), 0);
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_refused_while_terminating() {
        let ctx = context(1).await;
        let collection = Collection::open(&ctx, "job").await.unwrap();
        ctx.process.stop();

        let err = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Termination));
        assert_eq!(collection.count().await.unwrap(), 0);
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lock_reconciles_existing_records() {
        let ctx = context(3).await;
        let collection = Collection::open(&ctx, "job").await.unwrap();
        for id in ["a", "b"] {
            let record = WorkerRecord::new(id, "job", "testhost");
            ctx.store
                .hset(collection.key(), id, &codec::encode(&record).unwrap())
                .await
                .unwrap();
        }

        let lock = collection.lock().await.unwrap();
        assert_eq!(lock.size().await.unwrap(), 1);
        assert_eq!(lock.acquired().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dead_workers_and_reclaim() {
        let ctx = context(2).await;
        let collection = Collection::open(&ctx, "job").await.unwrap();

        let dead = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        dead.start(DEAD_PID).await.unwrap();
        let alive = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        alive.start(std::process::id()).await.unwrap();

        let found = collection.dead_workers().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), dead.id());

        assert!(collection.delete(&found[0]).await.unwrap());
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 1);
        assert!(collection.dead_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_never_started_orphan_is_reclaimed() {
        let ctx = context(1).await;
        let collection = Collection::open(&ctx, "job").await.unwrap();
        let mut record = WorkerRecord::new("orphan", "job", "testhost");
        record.pid = Some(DEAD_PID);
        ctx.store
            .hset(collection.key(), "orphan", &codec::encode(&record).unwrap())
            .await
            .unwrap();

        let found = collection.dead_workers().await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].is_started());
        assert!(collection.delete(&found[0]).await.unwrap());
        assert_eq!(collection.lock().await.unwrap().size().await.unwrap(), 1);

        let fresh = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        assert_eq!(fresh.pid(), Some(std::process::id()));
        assert!(!fresh.is_dead());
    }

    #[tokio::test]
    async fn test_find_and_workers() {
        let ctx = context(2).await;
        let collection = Collection::open(&ctx, "job").await.unwrap();
        let worker = collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        worker.start(std::process::id()).await.unwrap();

        let found = collection.find(&worker.id()).await.unwrap().unwrap();
        assert_eq!(found.pid(), Some(std::process::id()));
        assert!(collection.find("nope").await.unwrap().is_none());
        assert_eq!(collection.workers().await.unwrap().len(), 1);

        collection.delete_all().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_collection_set() {
        let ctx = context(1).await;
        ctx.store.set("workers:testhost", "junk").await.unwrap();

        let set = CollectionSet::open(&ctx).await.unwrap();
        assert_eq!(set.key(), "workers:testhost");
        assert!(set.names().await.unwrap().is_empty());

        set.create("job").await.unwrap();
        set.create("mail").await.unwrap();
        assert!(set.include("job").await.unwrap());
        assert_eq!(set.names().await.unwrap(), vec!["job", "mail"]);
        assert_eq!(set.all().await.unwrap().len(), 2);

        assert!(set.delete("mail").await.unwrap());
        assert!(!set.include("mail").await.unwrap());
        set.delete_all().await.unwrap();
        assert!(set.names().await.unwrap().is_empty());
    }
}
