//! Administrative operations: start, stop and inspect the daemon and its
//! workers on this host.

use std::fmt;
use std::path::Path;

use tracing::info;

use crate::context::Context;
use crate::daemon::{self, Daemon, DaemonInfo, RunOutcome};
use crate::error::Result;
use crate::process::{self, ProcessTools};
use crate::worker::{WorkerInfo, WorkerPool};

/// Human-readable host status.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub daemon: DaemonInfo,
    /// Queue name and length, in priority order.
    pub queues: Vec<(String, usize)>,
    pub workers: Vec<WorkerInfo>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Daemon:")?;
        for (key, value) in self.daemon.fields() {
            writeln!(f, "  {}: {}", key, value)?;
        }
        writeln!(f, "Queues:")?;
        for (name, len) in &self.queues {
            writeln!(f, "  {}: {}", name, len)?;
        }
        for worker in &self.workers {
            writeln!(f, "Worker:")?;
            for (key, value) in worker.fields() {
                writeln!(f, "  {}: {}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Administrative handle.
pub struct Control {
    ctx: Context,
    daemon: Daemon,
    tools: ProcessTools,
}

impl Control {
    pub fn new(ctx: &Context) -> Self {
        Self {
            daemon: Daemon::new(ctx),
            tools: ctx.tools(),
            ctx: ctx.clone(),
        }
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    /// Starts a background daemon running `args`. `None` if a live daemon
    /// is already registered.
    pub async fn start(&self, args: &[String], log_file: Option<&Path>) -> Result<Option<u32>> {
        if self.daemon_running().await? {
            return Ok(None);
        }
        daemon::run_in_background(args, log_file).map(Some)
    }

    /// Runs the daemon in the foreground.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.daemon.run().await
    }

    /// Stops the daemon, then any worker processes still registered.
    /// Returns the pids that did not exit.
    pub async fn stop(&self, force: bool) -> Result<Vec<u32>> {
        let mut remaining = Vec::new();
        if let Some(pid) = self.daemon.pid().await? {
            if !self.daemon_stop(force).await? {
                remaining.push(pid);
            }
        }
        for pid in self.workers_stop(force).await? {
            if !remaining.contains(&pid) {
                remaining.push(pid);
            }
        }
        Ok(remaining)
    }

    /// Stops everything, then starts a new background daemon.
    pub async fn restart(
        &self,
        force: bool,
        args: &[String],
        log_file: Option<&Path>,
    ) -> Result<Option<u32>> {
        let remaining = self.stop(force).await?;
        if !remaining.is_empty() {
            info!(pids = ?remaining, "Processes still running after stop");
        }
        self.start(args, log_file).await
    }

    /// Signals the registered daemon. Returns `true` once it has exited,
    /// `false` if none was running or it did not exit in time.
    pub async fn daemon_stop(&self, force: bool) -> Result<bool> {
        let Some(pid) = self.daemon.pid().await? else {
            info!("There is no daemon running");
            return Ok(false);
        };
        if !process::exists(pid) {
            info!(pid, "There is no daemon running");
            return Ok(false);
        }
        info!(pid, force, "Trying to stop daemon with pid {}", pid);
        Ok(self.signal(pid, force).await)
    }

    /// Signals one worker process.
    pub async fn worker_stop(&self, pid: u32, force: bool) -> bool {
        info!(pid, force, "Trying to stop worker with pid {}", pid);
        self.signal(pid, force).await
    }

    /// Signals every live worker process. Returns the pids that did not
    /// exit.
    pub async fn workers_stop(&self, force: bool) -> Result<Vec<u32>> {
        let own = self.ctx.process.pid();
        let pids: Vec<u32> = self
            .worker_pids()
            .await?
            .into_iter()
            .filter(|pid| *pid != own && process::exists(*pid))
            .collect();
        if pids.is_empty() {
            info!("Active workers not found.");
            return Ok(Vec::new());
        }
        info!(pids = ?pids, force, "Trying to stop workers");
        let stopped = self.tools.stop_all(&pids, force).await;
        Ok(pids.into_iter().filter(|pid| !stopped.contains(pid)).collect())
    }

    /// Distinct pids of registered workers.
    pub async fn worker_pids(&self) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for info in self.workers_info().await? {
            if let Some(pid) = info.record.pid {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
        Ok(pids)
    }

    pub async fn workers_info(&self) -> Result<Vec<WorkerInfo>> {
        let pool = WorkerPool::new(&self.ctx).await?;
        Ok(pool.all().await?.iter().map(|w| w.info()).collect())
    }

    pub async fn report(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            daemon: self.daemon.info().await?,
            queues: self.ctx.queues.lengths().await?,
            workers: self.workers_info().await?,
        })
    }

    async fn daemon_running(&self) -> Result<bool> {
        match self.daemon.pid().await? {
            Some(pid) if process::exists(pid) => {
                info!(pid, "Another daemon with pid {} is already running", pid);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn signal(&self, pid: u32, force: bool) -> bool {
        if pid == self.ctx.process.pid() {
            info!(pid, "Refusing to signal own process");
            return false;
        }
        if force {
            self.tools.stop_forced(pid).await
        } else {
            self.tools.stop(pid).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::process::DEAD_PID;
    use crate::scheduler::{EnqueueOptions, Job};
    use crate::store::MemoryStore;
    use crate::worker::JOB_WORKER;
    use std::sync::Arc;

    async fn context() -> Context {
        let config = Config::default()
            .with_hostname("testhost")
            .with_queues(["critical", "default"])
            .finalize()
            .unwrap();
        let ctx = Context::new(config, Arc::new(MemoryStore::default()))
            .await
            .unwrap();
        ctx.process.startup();
        ctx
    }

    #[tokio::test]
    async fn test_report_text() {
        let ctx = context().await;
        Job::create(&ctx, "echo", vec![], EnqueueOptions::queue("critical"))
            .await
            .unwrap();
        let pool = WorkerPool::new(&ctx).await.unwrap();
        let worker = pool
            .collection(JOB_WORKER)
            .await
            .unwrap()
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();
        worker.start(std::process::id()).await.unwrap();

        let control = Control::new(&ctx);
        let report = control.report().await.unwrap();
        assert_eq!(
            report.queues,
            vec![("critical".to_string(), 1), ("default".to_string(), 0)]
        );
        assert_eq!(report.workers.len(), 1);

        let text = report.to_string();
        assert!(text.starts_with("Daemon:\n  pid: \n  hostname: testhost\n"));
        assert!(text.contains("Queues:\n  critical: 1\n  default: 0\nWorker:\n"));
        assert!(text.contains(&format!("  id: {}\n", worker.id())));
        assert!(text.contains("  status: idle\n"));
    }

    #[tokio::test]
    async fn test_worker_pids_are_unique() {
        let ctx = context().await;
        let pool = WorkerPool::new(&ctx).await.unwrap();
        let collection = pool.collection(JOB_WORKER).await.unwrap();
        for _ in 0..2 {
            let worker = collection
                .add(|w| async move { Ok::<_, Error>(w) })
                .await
                .unwrap();
            worker.start(DEAD_PID).await.unwrap();
        }
        collection
            .add(|w| async move { Ok::<_, Error>(w) })
            .await
            .unwrap();

        let control = Control::new(&ctx);
        let mut pids = control.worker_pids().await.unwrap();
        pids.sort_unstable();
        let mut expected = vec![DEAD_PID, std::process::id()];
        expected.sort_unstable();
        assert_eq!(pids, expected);
        // dead and own pids are never signalled
        assert!(control.workers_stop(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_daemon() {
        let ctx = context().await;
        let control = Control::new(&ctx);
        assert!(!control.daemon_stop(false).await.unwrap());
        assert!(control.stop(true).await.unwrap().is_empty());
        assert!(!control.worker_stop(std::process::id(), false).await);
    }

    #[tokio::test]
    async fn test_start_refused_while_daemon_alive() {
        let ctx = context().await;
        ctx.store
            .set("daemon:testhost", &std::process::id().to_string())
            .await
            .unwrap();
        let control = Control::new(&ctx);
        assert_eq!(control.start(&[], None).await.unwrap(), None);
        assert_eq!(
            control.run().await.unwrap(),
            RunOutcome::AlreadyRunning(std::process::id())
        );
    }
}
