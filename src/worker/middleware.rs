//! Default interceptors around job execution.
//!
//! Installed in this order, outermost first:
//!
//! 1. [`JobSpan`] opens a tracing span carrying the job id and handler
//! 2. [`LogJob`] logs start, finish and failure of the job
//! 3. [`LogWork`] keeps the worker record's counters and status current

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::Result;
use crate::middleware::{Chain, Middleware, Next};
use crate::scheduler::Job;

use super::record::Worker;

/// What the worker middleware chain runs around.
pub struct Execution {
    pub worker: Arc<Worker>,
    pub job: Job,
}

/// Installs the default worker interceptors on `chain`.
pub fn install_defaults(chain: &Chain<Execution, ()>) {
    chain.add::<JobSpan>();
    chain.add::<LogJob>();
    chain.add::<LogWork>();
}

/// Runs the rest of the chain inside a `job` span.
#[derive(Debug, Default)]
pub struct JobSpan;

#[async_trait]
impl Middleware<Execution, ()> for JobSpan {
    async fn call(&self, ctx: &Execution, next: Next<'_, Execution, ()>) -> Result<()> {
        let span = info_span!(
            "job",
            id = ctx.job.id(),
            handler = %ctx.job.handler(),
            worker_id = %ctx.worker.id(),
        );
        next.run(ctx).instrument(span).await
    }
}

/// Logs job start, completion and failure.
#[derive(Debug, Default)]
pub struct LogJob;

#[async_trait]
impl Middleware<Execution, ()> for LogJob {
    async fn call(&self, ctx: &Execution, next: Next<'_, Execution, ()>) -> Result<()> {
        info!(job = %ctx.job, "Executing job");
        let started = Instant::now();
        match next.run(ctx).await {
            Ok(()) => {
                info!(
                    job_id = ctx.job.id(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Finished job"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    job_id = ctx.job.id(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Failed job"
                );
                Err(e)
            }
        }
    }
}

/// Marks the worker busy, then records success or failure.
#[derive(Debug, Default)]
pub struct LogWork;

#[async_trait]
impl Middleware<Execution, ()> for LogWork {
    async fn call(&self, ctx: &Execution, next: Next<'_, Execution, ()>) -> Result<()> {
        if let Err(e) = ctx.worker.working_on(&ctx.job).await {
            warn!(error = %e, "Failed to save worker status");
        }
        let result = next.run(ctx).await;
        let saved = match &result {
            Ok(()) => ctx.worker.success().await,
            Err(_) => ctx.worker.fail().await,
        };
        if let Err(e) = saved {
            warn!(error = %e, "Failed to save worker counters");
        }
        result
    }
}
