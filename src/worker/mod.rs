//! Workers and the slot accounting that bounds them.
//!
//! ```text
//! workers:<host>               set of collection names
//! workers:<host>:<type>        hash  worker id -> WorkerRecord
//! workers:<host>:<type>:lock   list  free slot tokens
//! ```
//!
//! Spawning a worker takes a token from the lock and uses it as the worker
//! id; deleting the worker pushes a token back. Workers whose process died
//! are found by pid and reclaimed by [`WorkerPool::delete_dead_workers`].

pub mod collection;
pub mod lock;
pub mod middleware;
pub mod pool;
pub mod record;

pub use collection::{Collection, CollectionSet};
pub use lock::WorkerLock;
pub use middleware::{Execution, JobSpan, LogJob, LogWork};
pub use pool::{PoolError, PoolStats, WorkerPool};
pub use record::{Worker, WorkerInfo, WorkerLimits, WorkerRecord, WorkerStatus};

/// Worker type used for job execution.
pub const JOB_WORKER: &str = "job";
