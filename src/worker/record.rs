//! Worker records and live worker handles.
//!
//! A [`WorkerRecord`] is the registry entry for one worker; a [`Worker`]
//! wraps it with the staleness limits and the registry location so counter
//! updates are persisted as they happen. Once a worker is removed from its
//! collection it is frozen and further saves are ignored.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, JobError, Result};
use crate::process;
use crate::scheduler::Job;
use crate::store::{codec, Store};

use super::middleware::Execution;

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => f.write_str("idle"),
            WorkerStatus::Busy => f.write_str("busy"),
        }
    }
}

/// Registry entry for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Slot token taken from the collection lock.
    pub id: String,
    /// Collection (worker type) the worker belongs to.
    #[serde(rename = "type")]
    pub worker_type: String,
    /// Pid of the process hosting the worker, once started.
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Description of the job in progress.
    pub job: Option<String>,
    pub job_started_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn new(
        id: impl Into<String>,
        worker_type: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            worker_type: worker_type.into(),
            pid: None,
            status: WorkerStatus::Idle,
            hostname: hostname.into(),
            created_at: Utc::now(),
            started_at: None,
            processed: 0,
            completed: 0,
            failed: 0,
            job: None,
            job_started_at: None,
        }
    }

    /// Marks the worker busy with `job`.
    pub fn working_on(&mut self, job: &Job) {
        self.status = WorkerStatus::Busy;
        self.job = Some(job.to_string());
        self.job_started_at = Some(Utc::now());
    }

    /// Records a successful job.
    pub fn success(&mut self) {
        self.finished();
        self.completed += 1;
    }

    /// Records a failed job.
    pub fn fail(&mut self) {
        self.finished();
        self.failed += 1;
    }

    fn finished(&mut self) {
        self.status = WorkerStatus::Idle;
        self.job = None;
        self.job_started_at = None;
        self.processed += 1;
    }
}

/// Staleness limits of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
    /// Jobs after which the worker is stale.
    pub jobs_limit: u64,
    /// Age after which the worker is stale.
    pub live_time: Duration,
}

impl WorkerLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            jobs_limit: config.worker_jobs_limit,
            live_time: config.worker_live_time,
        }
    }
}

/// Location of a worker's record in the store.
#[derive(Clone)]
pub(crate) struct RecordLocation {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) key: String,
}

/// Snapshot of a worker for status reports.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub record: WorkerRecord,
    /// `not started`, `dead`, `idle` or `busy`.
    pub status: String,
}

impl WorkerInfo {
    /// Report lines as `(label, value)` pairs.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let r = &self.record;
        let opt_time = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        vec![
            ("id", r.id.clone()),
            ("type", r.worker_type.clone()),
            ("pid", r.pid.map(|p| p.to_string()).unwrap_or_default()),
            ("status", self.status.clone()),
            ("hostname", r.hostname.clone()),
            ("created_at", r.created_at.to_rfc3339()),
            ("started_at", opt_time(r.started_at)),
            ("processed", r.processed.to_string()),
            ("completed", r.completed.to_string()),
            ("failed", r.failed.to_string()),
            ("job", r.job.clone().unwrap_or_default()),
            ("job_started_at", opt_time(r.job_started_at)),
        ]
    }
}

/// A worker and its persisted record.
pub struct Worker {
    record: Mutex<WorkerRecord>,
    limits: WorkerLimits,
    location: Option<RecordLocation>,
    frozen: AtomicBool,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("record", &*self.lock_record())
            .field("limits", &self.limits)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl Worker {
    pub(crate) fn new(
        record: WorkerRecord,
        limits: WorkerLimits,
        location: Option<RecordLocation>,
    ) -> Self {
        Self {
            record: Mutex::new(record),
            limits,
            location,
            frozen: AtomicBool::new(false),
        }
    }

    /// A worker that is not attached to any registry. Saves are no-ops.
    pub fn detached(record: WorkerRecord, limits: WorkerLimits) -> Self {
        Self::new(record, limits, None)
    }

    fn lock_record(&self) -> MutexGuard<'_, WorkerRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> String {
        self.lock_record().id.clone()
    }

    pub fn worker_type(&self) -> String {
        self.lock_record().worker_type.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_record().pid
    }

    pub fn processed(&self) -> u64 {
        self.lock_record().processed
    }

    /// Copy of the current record.
    pub fn record(&self) -> WorkerRecord {
        self.lock_record().clone()
    }

    /// Marks the worker as started in process `pid`.
    pub async fn start(&self, pid: u32) -> Result<bool> {
        self.update(|r| {
            r.pid = Some(pid);
            r.started_at = Some(Utc::now());
        })
        .await
    }

    pub async fn working_on(&self, job: &Job) -> Result<bool> {
        self.update(|r| r.working_on(job)).await
    }

    pub async fn success(&self) -> Result<bool> {
        self.update(WorkerRecord::success).await
    }

    pub async fn fail(&self) -> Result<bool> {
        self.update(WorkerRecord::fail).await
    }

    async fn update<F: FnOnce(&mut WorkerRecord)>(&self, f: F) -> Result<bool> {
        {
            let mut record = self.lock_record();
            f(&mut record);
        }
        self.save().await
    }

    /// Persists the record. Returns `false` when detached or frozen.
    pub async fn save(&self) -> Result<bool> {
        let Some(location) = &self.location else {
            return Ok(false);
        };
        if self.is_frozen() {
            return Ok(false);
        }
        let (id, raw) = {
            let record = self.lock_record();
            (record.id.clone(), codec::encode(&*record)?)
        };
        location.store.hset(&location.key, &id, &raw).await?;
        Ok(true)
    }

    /// Stops persisting changes.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Started means a pid and a start time were recorded.
    pub fn is_started(&self) -> bool {
        let record = self.lock_record();
        record.pid.is_some() && record.started_at.is_some()
    }

    /// Started and its process exists.
    pub fn is_alive(&self) -> bool {
        self.is_started() && self.pid().is_some_and(process::exists)
    }

    /// Has a recorded pid whose process is gone. A record registered by a
    /// process that died before starting it counts as dead.
    pub fn is_dead(&self) -> bool {
        self.pid().is_some_and(|pid| !process::exists(pid))
    }

    /// Time since start; zero before start.
    pub fn age(&self) -> Duration {
        self.lock_record()
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Stale once it processed `jobs_limit` jobs or lived `live_time`.
    pub fn is_stale(&self) -> bool {
        self.processed() >= self.limits.jobs_limit || self.age() >= self.limits.live_time
    }

    pub fn status_message(&self) -> String {
        if self.is_dead() {
            "dead".to_string()
        } else if !self.is_started() {
            "not started".to_string()
        } else {
            self.lock_record().status.to_string()
        }
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            record: self.record(),
            status: self.status_message(),
        }
    }

    /// Runs `job` through the worker middleware chain. Handler errors and
    /// panics are contained and reported as `false`.
    pub async fn perform(self: &Arc<Self>, ctx: &Context, job: Job) -> bool {
        let execution = Execution {
            worker: Arc::clone(self),
            job,
        };
        let handlers = Arc::clone(&ctx.handlers);

        let outcome = ctx
            .worker_middleware
            .invoke(&execution, || async {
                let job = &execution.job;
                match AssertUnwindSafe(job.execute(&handlers)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(Error::from(JobError::Panicked {
                        id: job.id(),
                        handler: job.handler().to_string(),
                    })),
                }
            })
            .await;

        match outcome {
            Ok(()) => true,
            Err(e) => {
                debug!(worker_id = %execution.worker.id(), job_id = execution.job.id(), error = %e, "Job did not complete");
                false
            }
        }
    }
}
