use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::context::Context;
use crate::error::Result;
use crate::scheduler::Job;
use crate::worker::{Worker, JOB_WORKER};

use super::{Dispatch, Strategy};

/// Long-lived workers: after its first job a worker keeps pulling jobs
/// until it is stale, the process stops, or no job arrives within the
/// queue timeout. The worker holds its slot the whole time.
#[derive(Debug, Default)]
pub struct Multi;

#[async_trait]
impl Dispatch for Multi {
    fn name(&self) -> &'static str {
        "multi"
    }

    async fn payload(&self, strategy: &Strategy) -> Result<()> {
        let Some(job) = strategy.next_job().await? else {
            return Ok(());
        };

        let ctx = strategy.context().clone();
        let first = job.clone();
        strategy
            .job_care(&job, || async move {
                strategy
                    .pool()
                    .spawn(JOB_WORKER, move |worker| work(ctx, worker, first))
                    .await?;
                Ok(())
            })
            .await
    }
}

async fn work(ctx: Context, worker: Arc<Worker>, first: Job) {
    let mut job = first;
    loop {
        worker.perform(&ctx, job).await;

        if worker.is_stale() {
            debug!(processed = worker.processed(), "Worker is stale");
            break;
        }
        if !ctx.process.is_running() {
            debug!("Process stopping, worker exits");
            break;
        }
        job = match Job::next(&ctx).await {
            Ok(Some(next)) => next,
            Ok(None) => {
                debug!("No more jobs, worker exits");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch next job");
                break;
            }
        };
    }
}
