//! workforge: a Redis-backed background job engine.
//!
//! Producers push jobs onto named queues; one daemon per host pulls them in
//! priority order and executes each in a worker slot. A distributed
//! semaphore bounds the number of workers per host and hands out worker
//! ids; dead workers are reclaimed by periodic maintenance.

// Core modules
pub mod callbacks;
pub mod cli;
pub mod config;
pub mod context;
pub mod control;
pub mod daemon;
pub mod error;
pub mod middleware;
pub mod process;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use context::Context;
pub use control::{Control, StatusReport};
pub use daemon::{Daemon, DaemonInfo, RunOutcome};
pub use error::{Error, JobError, Result};
pub use scheduler::{EnqueueOptions, Job, JobRecord};
pub use strategy::{Strategy, StrategyKind};
