//! Error types for workforge operations.
//!
//! Each subsystem owns a focused error enum next to its code:
//! - `ConfigError` (configuration loading and validation)
//! - `StoreError` (coordination store access)
//! - `QueueError` (queue registry and queue items)
//! - `PoolError` (worker pool lifecycle)
//!
//! This module defines the job-level errors and the crate-wide [`Error`]
//! that aggregates all of them.

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::scheduler::queue::QueueError;
pub use crate::store::StoreError;
pub use crate::worker::pool::PoolError;

/// Errors raised while creating, resolving or executing a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Producer-side validation failed (empty handler, unknown queue).
    #[error("Invalid job argument: {0}")]
    InvalidArgument(String),

    /// The job names a handler this process does not know.
    #[error("Handler '{0}' is not registered")]
    HandlerNotFound(String),

    /// Typed access to a job argument failed.
    #[error("Job argument access failed: {0}")]
    Access(String),

    /// The handler returned an error.
    #[error("Job {id} ({handler}) failed: {message}")]
    Execution {
        id: u64,
        handler: String,
        message: String,
    },

    /// The handler panicked.
    #[error("Job {id} ({handler}) panicked")]
    Panicked { id: u64, handler: String },
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A bounded wait (worker token, blocking pop) expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A wait was abandoned because the process is shutting down.
    #[error("Process is terminating")]
    Termination,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A task body panicked outside of job execution.
    #[error("Panic in {0}")]
    Panicked(String),
}

impl Error {
    /// Returns `true` for errors that are part of normal operation and must
    /// not be reported as failures (bounded waits, shutdown).
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Termination)
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
