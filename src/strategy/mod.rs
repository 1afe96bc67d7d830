//! Dispatch strategies.
//!
//! One daemon tick is one [`Strategy::tick`]:
//!
//! ```text
//! payload ──► after_loop callbacks ──► maintenance (once per interval)
//! ```
//!
//! The payload differs per strategy:
//!
//! - [`Single`]: one worker per job
//! - [`Multi`]: a worker keeps pulling jobs until it is stale, the process
//!   stops, or the queues run dry
//!
//! Timeouts and termination inside a payload are expected and only logged
//! at debug level; anything else is logged as unhandled. A tick never fails.

mod multi;
mod single;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::callbacks::Hook;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::scheduler::Job;
use crate::worker::WorkerPool;

pub use multi::Multi;
pub use single::Single;

/// Name of a dispatch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Single,
    Multi,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Single => "single",
            StrategyKind::Multi => "multi",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(StrategyKind::Single),
            "multi" => Ok(StrategyKind::Multi),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// The strategy-specific part of a tick.
#[async_trait]
pub trait Dispatch: Send + Sync {
    fn name(&self) -> &'static str;

    /// Takes at most one job and hands it to a worker.
    async fn payload(&self, strategy: &Strategy) -> Result<()>;
}

/// Drives a [`Dispatch`] with the shared tick logic.
pub struct Strategy {
    ctx: Context,
    pool: WorkerPool,
    dispatch: Box<dyn Dispatch>,
    last_maintenance: Mutex<Option<Instant>>,
}

impl Strategy {
    /// Builds the strategy named by the configuration.
    pub async fn create(ctx: &Context) -> Result<Self> {
        let dispatch: Box<dyn Dispatch> = match ctx.config.strategy {
            StrategyKind::Single => Box::new(Single),
            StrategyKind::Multi => Box::new(Multi),
        };
        Self::with_dispatch(ctx, dispatch).await
    }

    /// Builds a strategy around a custom dispatch. Fires `after_start`.
    pub async fn with_dispatch(ctx: &Context, dispatch: Box<dyn Dispatch>) -> Result<Self> {
        let pool = WorkerPool::new(ctx).await?;
        let strategy = Self {
            ctx: ctx.clone(),
            pool,
            dispatch,
            last_maintenance: Mutex::new(None),
        };
        info!(
            strategy = strategy.name(),
            concurrency = ctx.config.concurrency,
            "Strategy started"
        );
        ctx.callbacks.fire(Hook::AfterStart);
        Ok(strategy)
    }

    pub fn name(&self) -> &'static str {
        self.dispatch.name()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Runs one tick.
    pub async fn tick(&self) {
        match self.dispatch.payload(self).await {
            Ok(()) => {}
            Err(Error::Timeout(reason)) => debug!(%reason, "Dispatch timed out"),
            Err(Error::Termination) => debug!("Dispatch aborted by termination"),
            Err(e) => error!(strategy = self.name(), error = %e, "Unhandled exception"),
        }
        self.ctx.callbacks.fire(Hook::AfterLoop);
        self.maybe_maintenance().await;
    }

    /// Waits up to the queue timeout for the next job.
    pub async fn next_job(&self) -> Result<Option<Job>> {
        Job::next(&self.ctx).await
    }

    /// Runs `dispatch` for `job`, rolling the job back to the head of its
    /// queue if dispatching fails. The error is returned after rollback.
    pub async fn job_care<F, Fut, R>(&self, job: &Job, dispatch: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match dispatch().await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(rollback_err) = job.rollback(&self.ctx).await {
                    error!(job_id = job.id(), error = %rollback_err, "Failed to roll back job");
                }
                Err(e)
            }
        }
    }

    /// Reclaims dead workers now. Returns how many were removed.
    pub async fn maintenance(&self) -> Result<usize> {
        *self.last_maintenance_slot() = Some(Instant::now());
        self.pool.delete_dead_workers().await
    }

    async fn maybe_maintenance(&self) {
        let last = *self.last_maintenance_slot();
        let due = last.map_or(true, |at| at.elapsed() >= self.ctx.config.maintenance_interval);
        if !due {
            return;
        }
        match self.maintenance().await {
            Ok(0) => debug!("Maintenance found no dead workers"),
            Ok(reclaimed) => info!(reclaimed, "Maintenance reclaimed dead workers"),
            Err(e) => error!(error = %e, "Maintenance failed"),
        }
    }

    fn last_maintenance_slot(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Waits for in-flight workers, bounded by the shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.shutdown(self.ctx.config.shutdown_timeout).await
    }
}
