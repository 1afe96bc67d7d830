//! Per-host daemon.
//!
//! At most one daemon runs per host. The running daemon's pid is stored
//! under `daemon:<hostname>`; a registration whose process is gone is
//! cleared on the next start.
//!
//! ```text
//! unregistered ──► registering ──► running ──► stopped
//!                      │                          │
//!                      └── live daemon found      └── pid released
//! ```

use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::callbacks::Hook;
use crate::context::Context;
use crate::error::Result;
use crate::process;
use crate::store::Store;
use crate::strategy::{Strategy, StrategyKind};

/// Outcome of [`Daemon::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The main loop ran and exited after a stop request.
    Completed,
    /// Another live daemon holds the registration.
    AlreadyRunning(u32),
    /// The main loop ended with an error or a panic.
    Aborted,
}

/// The stored daemon pid.
struct DaemonPid {
    store: Arc<dyn Store>,
    key: String,
}

impl DaemonPid {
    async fn get(&self) -> Result<Option<u32>> {
        let raw = self.store.get(&self.key).await?;
        Ok(raw
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|pid| *pid > 0))
    }

    /// Stores `pid` unless a pid is already stored.
    async fn register(&self, pid: u32) -> Result<bool> {
        let set = self.store.set_nx(&self.key, &pid.to_string()).await?;
        if set {
            debug!(pid, "Daemon pid registered");
        }
        Ok(set)
    }

    async fn unregister(&self) -> Result<()> {
        self.store.del(&self.key).await?;
        debug!("Daemon pid deleted");
        Ok(())
    }

    /// Deletes the registration if it still holds `pid`.
    async fn release(&self, pid: u32) -> Result<()> {
        if self.get().await? == Some(pid) {
            self.unregister().await?;
        }
        Ok(())
    }
}

/// Snapshot of the daemon for status reports.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonInfo {
    pub pid: Option<u32>,
    pub hostname: String,
    pub version: &'static str,
    /// `started (alive)`, `started (dead)` or `not started`.
    pub status: String,
    pub strategy: StrategyKind,
    pub concurrency: usize,
}

impl DaemonInfo {
    /// Report lines as `(label, value)` pairs.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("pid", self.pid.map(|p| p.to_string()).unwrap_or_default()),
            ("hostname", self.hostname.clone()),
            ("version", self.version.to_string()),
            ("status", self.status.clone()),
            ("strategy", self.strategy.to_string()),
            ("concurrency", self.concurrency.to_string()),
        ]
    }
}

impl fmt::Display for DaemonInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields()
            .into_iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// The per-host control loop.
pub struct Daemon {
    ctx: Context,
    pid: DaemonPid,
}

impl Daemon {
    pub fn new(ctx: &Context) -> Self {
        Self {
            pid: DaemonPid {
                store: Arc::clone(&ctx.store),
                key: ctx.config.daemon_pid_key(),
            },
            ctx: ctx.clone(),
        }
    }

    /// Pid of the registered daemon, if any.
    pub async fn pid(&self) -> Result<Option<u32>> {
        self.pid.get().await
    }

    pub async fn is_started(&self) -> Result<bool> {
        Ok(self.pid().await?.is_some())
    }

    pub async fn is_alive(&self) -> Result<bool> {
        Ok(self.pid().await?.is_some_and(process::exists))
    }

    pub async fn is_dead(&self) -> Result<bool> {
        Ok(self.pid().await?.is_some_and(|pid| !process::exists(pid)))
    }

    pub async fn info(&self) -> Result<DaemonInfo> {
        let pid = self.pid().await?;
        let status = match pid {
            Some(pid) if process::exists(pid) => "started (alive)",
            Some(_) => "started (dead)",
            None => "not started",
        };
        Ok(DaemonInfo {
            pid,
            hostname: self.ctx.config.hostname.clone(),
            version: env!("CARGO_PKG_VERSION"),
            status: status.to_string(),
            strategy: self.ctx.config.strategy,
            concurrency: self.ctx.config.concurrency,
        })
    }

    /// Runs the daemon in this process until it is stopped.
    ///
    /// Returns without side effects if a live daemon is already registered.
    /// Errors and panics inside the main loop are logged, never propagated,
    /// and the registration is always released.
    pub async fn run(&self) -> Result<RunOutcome> {
        if let Some(pid) = self.pid().await? {
            if process::exists(pid) {
                info!(pid, "Another daemon with pid {} is already running", pid);
                return Ok(RunOutcome::AlreadyRunning(pid));
            }
            warn!(pid, "Dead daemon detected: process with pid {} not found", pid);
            self.pid.unregister().await?;
        }

        let own = self.ctx.process.pid();
        if !self.pid.register(own).await? {
            let other = self.pid().await?.unwrap_or_default();
            info!(pid = other, "Another daemon registered first");
            return Ok(RunOutcome::AlreadyRunning(other));
        }

        let outcome = match AssertUnwindSafe(self.main_loop()).catch_unwind().await {
            Ok(Ok(())) => RunOutcome::Completed,
            Ok(Err(e)) => {
                error!(error = %e, "Unhandled exception");
                error!("Abnormal termination.");
                RunOutcome::Aborted
            }
            Err(_) => {
                error!("Unhandled panic in daemon");
                error!("Abnormal termination.");
                RunOutcome::Aborted
            }
        };

        if let Err(e) = self.pid.release(own).await {
            error!(error = %e, "Failed to release daemon pid");
        }
        info!(pid = own, "Daemon stopped");
        Ok(outcome)
    }

    async fn main_loop(&self) -> Result<()> {
        let process = &self.ctx.process;
        process.startup();
        let signals = process.trap_signals()?;

        let strategy = Strategy::create(&self.ctx).await?;
        let info = self.info().await?;
        info!(daemon = %info, "Daemon started");

        debug!("Enter main loop");
        while process.is_running() {
            strategy.tick().await;
            tokio::time::sleep(self.ctx.config.main_loop_delay).await;
        }
        debug!("Exit main loop");

        self.ctx.callbacks.fire(Hook::BeforeExit);
        if let Err(e) = strategy.shutdown().await {
            warn!(error = %e, "Workers did not finish in time");
        }
        drop(signals);
        Ok(())
    }
}

/// Starts this executable with `args` as a detached background process and
/// returns its pid. Output goes to `log_file` when given.
pub fn run_in_background(args: &[String], log_file: Option<&Path>) -> Result<u32> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command.args(args).stdin(Stdio::null()).process_group(0);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            command.stdout(file.try_clone()?).stderr(file);
        }
        None => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    let child = command.spawn()?;
    info!(pid = child.id(), "Daemon started in background");
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::process::DEAD_PID;
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn context() -> Context {
        let config = Config::default()
            .with_hostname("testhost")
            .with_queue_timeout(Duration::from_millis(20))
            .with_main_loop_delay(Duration::from_millis(1))
            .finalize()
            .unwrap();
        Context::new(config, Arc::new(MemoryStore::default()))
            .await
            .unwrap()
    }

    fn stop_after_first_tick(ctx: &Context) {
        let process = Arc::clone(&ctx.process);
        ctx.callbacks.define(Hook::AfterLoop, move || {
            process.stop();
            Ok(())
        });
    }

    #[tokio::test]
    async fn test_run_is_idempotent_with_live_daemon() {
        let ctx = context().await;
        let own = std::process::id();
        ctx.store
            .set("daemon:testhost", &own.to_string())
            .await
            .unwrap();

        let daemon = Daemon::new(&ctx);
        assert_eq!(daemon.run().await.unwrap(), RunOutcome::AlreadyRunning(own));
        assert_eq!(daemon.pid().await.unwrap(), Some(own));
        assert!(!ctx.process.is_running());
    }

    #[tokio::test]
    async fn test_run_clears_dead_registration_and_releases_pid() {
        let ctx = context().await;
        ctx.store
            .set("daemon:testhost", &DEAD_PID.to_string())
            .await
            .unwrap();
        let daemon = Daemon::new(&ctx);
        assert!(daemon.is_dead().await.unwrap());

        let exits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        ctx.callbacks.define(Hook::BeforeExit, move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        stop_after_first_tick(&ctx);

        assert_eq!(daemon.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(daemon.pid().await.unwrap(), None);
        assert_eq!(exits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_main_loop_still_releases_pid() {
        let ctx = context().await;
        ctx.callbacks
            .define(Hook::AfterStart, || panic!("broken callback"));

        let daemon = Daemon::new(&ctx);
        assert_eq!(daemon.run().await.unwrap(), RunOutcome::Aborted);
        assert_eq!(daemon.pid().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_info() {
        let ctx = context().await;
        let daemon = Daemon::new(&ctx);
        let info = daemon.info().await.unwrap();
        assert_eq!(info.status, "not started");
        assert_eq!(info.pid, None);
        assert_eq!(info.strategy, StrategyKind::Single);
        assert!(info.to_string().contains("hostname: testhost"));

        ctx.store
            .set("daemon:testhost", &std::process::id().to_string())
            .await
            .unwrap();
        assert_eq!(daemon.info().await.unwrap().status, "started (alive)");
        assert!(daemon.is_alive().await.unwrap());
    }
}
