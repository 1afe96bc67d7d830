//! Shared runtime context.
//!
//! Everything the engine needs at run time, bundled behind `Arc`s so it can
//! be cloned cheaply into worker tasks.

use std::sync::Arc;

use tracing::debug;

use crate::callbacks::Callbacks;
use crate::config::Config;
use crate::error::Result;
use crate::middleware::Chain;
use crate::process::{Process, ProcessTools};
use crate::scheduler::{HandlerRegistry, JobRecord, Queues};
use crate::store::{RedisStore, Store};
use crate::worker::middleware::{install_defaults, Execution};

/// Runtime handles shared by producers, the daemon and its workers.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub queues: Arc<Queues>,
    pub process: Arc<Process>,
    pub handlers: Arc<HandlerRegistry>,
    pub callbacks: Arc<Callbacks>,
    /// Interceptors around pushing a new job.
    pub job_middleware: Arc<Chain<JobRecord, JobRecord>>,
    /// Interceptors around executing a job in a worker.
    pub worker_middleware: Arc<Chain<Execution, ()>>,
}

impl Context {
    /// Builds a context over `store` and opens the configured queues. The
    /// default worker middleware is installed.
    pub async fn new(config: Arc<Config>, store: Arc<dyn Store>) -> Result<Self> {
        let queues = Queues::open(Arc::clone(&store), &config).await?;
        let worker_middleware = Chain::new();
        install_defaults(&worker_middleware);

        debug!(
            namespace = %config.namespace,
            hostname = %config.hostname,
            queues = ?queues.names().collect::<Vec<_>>(),
            "Context ready"
        );

        Ok(Self {
            config,
            store,
            queues: Arc::new(queues),
            process: Arc::new(Process::new()),
            handlers: Arc::new(HandlerRegistry::new()),
            callbacks: Arc::new(Callbacks::new()),
            job_middleware: Arc::new(Chain::new()),
            worker_middleware: Arc::new(worker_middleware),
        })
    }

    /// Connects to Redis at `config.redis_url`.
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        let store = RedisStore::connect(&config.redis_url, &config.namespace).await?;
        Self::new(config, Arc::new(store)).await
    }

    /// Process tools with the configured stop timeouts.
    pub fn tools(&self) -> ProcessTools {
        ProcessTools::new(
            self.config.process_term_timeout,
            self.config.process_kill_timeout,
        )
    }
}
