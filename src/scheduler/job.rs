//! Job definitions and lifecycle.
//!
//! A job is a small serialized record naming a handler and its arguments:
//!
//! ```text
//! create ──► queue tail ──► next (priority pop) ──► execute
//!                 ▲                                    │
//!                 └──── rollback (queue head) ◄── dispatch failed
//! ```
//!
//! Ids come from a shared counter and are unique across producers until
//! the counter is reset with [`Job::delete_all`] or [`Job::reset_id`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::DEFAULT_QUEUE;
use crate::context::Context;
use crate::error::{Error, JobError, Result};

use super::handler::HandlerRegistry;

/// The serialized form of a job, as stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique id from the shared sequence.
    pub id: u64,
    /// Name of the handler that performs the job.
    pub handler: String,
    /// Positional arguments passed to the handler.
    #[serde(default)]
    pub args: Vec<Value>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

/// Options for [`Job::create`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Target queue; `default` when unset.
    pub queue: Option<String>,
}

impl EnqueueOptions {
    /// Targets the named queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            queue: Some(name.into()),
        }
    }
}

/// A job taken from a queue, remembering where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    record: JobRecord,
    queue: Option<String>,
}

impl Job {
    /// Wraps a record. `queue` is the queue it was taken from, if any.
    pub fn new(record: JobRecord, queue: Option<String>) -> Self {
        Self { record, queue }
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn handler(&self) -> &str {
        &self.record.handler
    }

    pub fn args(&self) -> &[Value] {
        &self.record.args
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    /// Queue the job was taken from.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Creates a job and appends it to its queue, running the job-creation
    /// middleware around the push.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidArgument` if the handler name is empty or
    /// the queue is not configured.
    pub async fn create(
        ctx: &Context,
        handler: &str,
        args: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<JobRecord> {
        if handler.trim().is_empty() {
            return Err(JobError::InvalidArgument("job handler is not specified".to_string()).into());
        }

        let queue_name = options.queue.as_deref().unwrap_or(DEFAULT_QUEUE);
        let queue = ctx.queues.find(queue_name).ok_or_else(|| {
            JobError::InvalidArgument(format!("invalid queue name '{}'", queue_name))
        })?;

        let record = JobRecord {
            id: Self::next_id(ctx).await?,
            handler: handler.to_string(),
            args,
            created_at: Utc::now(),
        };

        let created = ctx
            .job_middleware
            .invoke(&record, || async {
                queue.push(&record).await?;
                Ok::<_, Error>(record.clone())
            })
            .await?;

        debug!(job_id = created.id, handler = %created.handler, queue = %queue_name, "Job created");
        Ok(created)
    }

    /// Takes the next job from the configured queues in priority order,
    /// waiting up to the queue timeout. `None` when nothing arrived.
    pub async fn next(ctx: &Context) -> Result<Option<Job>> {
        let polled = ctx
            .queues
            .poll::<JobRecord>(ctx.config.queue_timeout)
            .await?;
        Ok(polled.map(|p| Job::new(p.item, Some(p.queue))))
    }

    /// Resolves the handler and performs the job.
    pub async fn execute(&self, handlers: &HandlerRegistry) -> Result<()> {
        let handler = handlers.get(self.handler())?;
        handler
            .perform(self.args())
            .await
            .map_err(|e| JobError::Execution {
                id: self.id(),
                handler: self.handler().to_string(),
                message: format!("{:#}", e),
            })?;
        Ok(())
    }

    /// Puts the job back at the head of the queue it came from.
    pub async fn rollback(&self, ctx: &Context) -> Result<()> {
        let Some(name) = self.queue() else {
            debug!(job_id = self.id(), "Job has no source queue, nothing to roll back");
            return Ok(());
        };
        let queue = ctx.queues.get(name)?;
        queue.unshift(&self.record).await?;
        debug!(job_id = self.id(), queue = %name, "Job rolled back");
        Ok(())
    }

    /// Empties every queue and resets the id counter.
    pub async fn delete_all(ctx: &Context) -> Result<()> {
        ctx.queues.reset_all().await?;
        Self::reset_id(ctx).await
    }

    /// Allocates the next job id.
    pub async fn next_id(ctx: &Context) -> Result<u64> {
        let id = ctx.store.incr(&ctx.config.sequence_key).await?;
        Ok(id.max(0) as u64)
    }

    /// Resets the id counter so the next id is 1.
    pub async fn reset_id(ctx: &Context) -> Result<()> {
        ctx.store.set(&ctx.config.sequence_key, "0").await?;
        Ok(())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} queue={} created_at={} args={}",
            self.id(),
            self.handler(),
            self.queue().unwrap_or("-"),
            self.created_at().to_rfc3339(),
            Value::Array(self.record.args.clone())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scheduler::handler::handler_fn;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn context() -> Context {
        let config = Config::default()
            .with_queues(["critical", "default"])
            .with_queue_timeout(Duration::from_millis(20))
            .finalize()
            .unwrap();
        Context::new(config, Arc::new(MemoryStore::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let ctx = context().await;
        let first = Job::create(&ctx, "Mailer", vec![json!(1)], EnqueueOptions::default())
            .await
            .unwrap();
        let second = Job::create(&ctx, "Mailer", vec![], EnqueueOptions::default())
            .await
            .unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(ctx.queues.get("default").unwrap().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let ctx = context().await;

        let err = Job::create(&ctx, "", vec![], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidArgument(_))));

        let err = Job::create(&ctx, "Mailer", vec![], EnqueueOptions::queue("reports"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reports"));

        // nothing was consumed from the sequence or pushed
        assert_eq!(Job::next_id(&ctx).await.unwrap(), 1);
        assert_eq!(Job::next(&ctx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_follows_queue_priority() {
        let ctx = context().await;
        Job::create(&ctx, "A", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        Job::create(&ctx, "B", vec![], EnqueueOptions::queue("critical"))
            .await
            .unwrap();

        let job = Job::next(&ctx).await.unwrap().unwrap();
        assert_eq!(job.handler(), "B");
        assert_eq!(job.queue(), Some("critical"));
        let job = Job::next(&ctx).await.unwrap().unwrap();
        assert_eq!(job.handler(), "A");
        assert_eq!(job.queue(), Some("default"));
        assert!(Job::next(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_puts_job_at_head() {
        let ctx = context().await;
        for name in ["first", "second", "third"] {
            Job::create(&ctx, name, vec![], EnqueueOptions::default())
                .await
                .unwrap();
        }

        let first = Job::next(&ctx).await.unwrap().unwrap();
        assert_eq!(first.handler(), "first");
        first.rollback(&ctx).await.unwrap();

        let order: Vec<String> = {
            let mut order = Vec::new();
            while let Some(job) = Job::next(&ctx).await.unwrap() {
                order.push(job.handler().to_string());
            }
            order
        };
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_rollback_without_queue_is_noop() {
        let ctx = context().await;
        let record = JobRecord {
            id: 1,
            handler: "A".to_string(),
            args: vec![],
            created_at: Utc::now(),
        };
        Job::new(record, None).rollback(&ctx).await.unwrap();
        assert!(Job::next(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_all_resets_queues_and_sequence() {
        let ctx = context().await;
        Job::create(&ctx, "A", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        Job::create(&ctx, "B", vec![], EnqueueOptions::queue("critical"))
            .await
            .unwrap();

        Job::delete_all(&ctx).await.unwrap();

        assert!(Job::next(&ctx).await.unwrap().is_none());
        let record = Job::create(&ctx, "C", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(record.id, 1);
    }

    #[tokio::test]
    async fn test_execute_resolves_handler() {
        let ctx = context().await;
        ctx.handlers.register(
            "Fails",
            handler_fn(|_args| async { Err::<(), _>(anyhow::anyhow!("smtp down")) }),
        );
        ctx.handlers
            .register("Works", handler_fn(|_args| async { Ok::<(), anyhow::Error>(()) }));

        let record = |handler: &str| JobRecord {
            id: 9,
            handler: handler.to_string(),
            args: vec![json!("x")],
            created_at: Utc::now(),
        };

        Job::new(record("Works"), None)
            .execute(&ctx.handlers)
            .await
            .unwrap();

        let err = Job::new(record("Fails"), None)
            .execute(&ctx.handlers)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Job(JobError::Execution { id: 9, ref message, .. }) if message.contains("smtp down")
        ));

        let err = Job::new(record("Missing"), None)
            .execute(&ctx.handlers)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::HandlerNotFound(_))));
    }

    #[test]
    fn test_display() {
        let record = JobRecord {
            id: 4,
            handler: "Mailer".to_string(),
            args: vec![json!("a@b.c")],
            created_at: Utc::now(),
        };
        let text = Job::new(record, Some("default".to_string())).to_string();
        assert!(text.starts_with("#4 Mailer queue=default"));
        assert!(text.contains("a@b.c"));
    }
}
