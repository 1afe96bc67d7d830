use async_trait::async_trait;

use crate::error::Result;
use crate::worker::JOB_WORKER;

use super::{Dispatch, Strategy};

/// One worker per job: the worker executes the job it was spawned for and
/// exits, returning its slot.
#[derive(Debug, Default)]
pub struct Single;

#[async_trait]
impl Dispatch for Single {
    fn name(&self) -> &'static str {
        "single"
    }

    async fn payload(&self, strategy: &Strategy) -> Result<()> {
        let Some(job) = strategy.next_job().await? else {
            return Ok(());
        };

        let ctx = strategy.context().clone();
        let assigned = job.clone();
        strategy
            .job_care(&job, || async move {
                strategy
                    .pool()
                    .spawn(JOB_WORKER, move |worker| async move {
                        worker.perform(&ctx, assigned).await;
                    })
                    .await?;
                Ok(())
            })
            .await
    }
}
