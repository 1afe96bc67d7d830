//! Process state and OS process control.
//!
//! [`Process`] is the running flag every blocking wait consults: once it is
//! cleared (signal or explicit stop) loops wind down and token waits abort
//! with `Error::Termination`.
//!
//! [`ProcessTools`] inspects and stops other processes by pid, escalating
//! from SIGTERM to SIGKILL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between liveness checks while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Returns this machine's host name, falling back to `localhost`.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Returns `true` if a process with this pid exists.
pub fn exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        // the process exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Running state of the current process.
#[derive(Debug, Default)]
pub struct Process {
    running: AtomicBool,
}

impl Process {
    /// Creates a process state that is not yet running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pid of the current process.
    pub fn pid(&self) -> u32 {
        std::process::id()
    }

    /// Marks the process as running.
    pub fn startup(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Requests termination. Loops observe it at their next check.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(pid = self.pid(), "Process termination requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Installs TERM/INT (stop) and HUP (log only) handlers.
    ///
    /// Handlers stay active until the returned guard is dropped.
    pub fn trap_signals(self: &Arc<Self>) -> std::io::Result<SignalGuard> {
        let mut term = unix_signal(SignalKind::terminate())?;
        let mut int = unix_signal(SignalKind::interrupt())?;
        let mut hup = unix_signal(SignalKind::hangup())?;
        let process = Arc::clone(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = term.recv() => {
                        info!("SIGTERM received");
                        process.stop();
                    }
                    Some(()) = int.recv() => {
                        info!("SIGINT received");
                        process.stop();
                    }
                    Some(()) = hup.recv() => {
                        info!("SIGHUP received");
                    }
                    else => break,
                }
            }
        });

        debug!("Signal handlers installed");
        Ok(SignalGuard { handle })
    }
}

/// Keeps signal handlers active while alive.
#[derive(Debug)]
pub struct SignalGuard {
    handle: JoinHandle<()>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.abort();
        debug!("Signal handlers released");
    }
}

/// Stops other processes by pid.
#[derive(Debug, Clone)]
pub struct ProcessTools {
    term_timeout: Duration,
    kill_timeout: Duration,
}

impl ProcessTools {
    pub fn new(term_timeout: Duration, kill_timeout: Duration) -> Self {
        Self {
            term_timeout,
            kill_timeout,
        }
    }

    /// Returns `true` if the process exists.
    pub fn exists(&self, pid: u32) -> bool {
        exists(pid)
    }

    /// Sends SIGTERM and waits up to the term timeout for the process to
    /// exit. Returns `true` once it is gone.
    pub async fn term(&self, pid: u32) -> bool {
        self.signal_and_wait(pid, Signal::SIGTERM, self.term_timeout)
            .await
    }

    /// Sends SIGKILL and waits up to the kill timeout.
    pub async fn kill(&self, pid: u32) -> bool {
        self.signal_and_wait(pid, Signal::SIGKILL, self.kill_timeout)
            .await
    }

    /// Graceful stop.
    pub async fn stop(&self, pid: u32) -> bool {
        self.term(pid).await
    }

    /// Graceful stop, escalating to SIGKILL if the process survives.
    pub async fn stop_forced(&self, pid: u32) -> bool {
        if self.term(pid).await {
            return true;
        }
        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        self.kill(pid).await
    }

    /// Stops many processes concurrently. Returns the pids that exited.
    pub async fn stop_all(&self, pids: &[u32], force: bool) -> Vec<u32> {
        let results = join_all(pids.iter().map(|&pid| async move {
            let stopped = if force {
                self.stop_forced(pid).await
            } else {
                self.stop(pid).await
            };
            (pid, stopped)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(pid, stopped)| stopped.then_some(pid))
            .collect()
    }

    async fn signal_and_wait(&self, pid: u32, sig: Signal, timeout: Duration) -> bool {
        if !exists(pid) {
            return true;
        }
        let Ok(raw) = i32::try_from(pid) else {
            return true;
        };

        info!(pid, signal = ?sig, "Sending signal");
        if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
            if e == Errno::ESRCH {
                return true;
            }
            warn!(pid, signal = ?sig, error = %e, "Failed to send signal");
            return false;
        }

        let started = Instant::now();
        while started.elapsed() < timeout {
            if !exists(pid) {
                info!(pid, "Process exited");
                return true;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        let gone = !exists(pid);
        if !gone {
            warn!(pid, timeout_ms = timeout.as_millis() as u64, "Process did not exit in time");
        }
        gone
    }
}

/// Above any real pid_max, so never a live process.
#[cfg(test)]
pub(crate) const DEAD_PID: u32 = 999_999_999;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exists() {
        assert!(exists(std::process::id()));
        assert!(!exists(DEAD_PID));
        assert!(!exists(0));
        assert!(!exists(u32::MAX));
    }

    #[test]
    fn test_running_flag() {
        let process = Process::new();
        assert!(!process.is_running());
        process.startup();
        assert!(process.is_running());
        process.stop();
        assert!(!process.is_running());
        // stopping twice is harmless
        process.stop();
        assert!(!process.is_running());
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!hostname().is_empty());
    }

    #[tokio::test]
    async fn test_stop_missing_process() {
        let tools = ProcessTools::new(Duration::from_millis(50), Duration::from_millis(50));
        assert!(tools.stop(DEAD_PID).await);
        assert_eq!(tools.stop_all(&[DEAD_PID], true).await, vec![DEAD_PID]);
    }

    #[tokio::test]
    async fn test_term_child_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(exists(pid));

        // reap in the background so the pid disappears once signalled
        let reaper = tokio::spawn(async move { child.wait().await });

        let tools = ProcessTools::new(Duration::from_secs(5), Duration::from_secs(5));
        assert!(tools.stop_forced(pid).await);
        reaper.await.unwrap().unwrap();
        assert!(!exists(pid));
    }

    #[tokio::test]
    async fn test_hangup_keeps_process_running() {
        let process = Arc::new(Process::new());
        process.startup();
        let guard = process.trap_signals().unwrap();

        signal::kill(Pid::from_raw(std::process::id() as i32), Signal::SIGHUP).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(process.is_running());

        drop(guard);
    }

    #[tokio::test]
    async fn test_terminate_and_interrupt_stop_process() {
        for sig in [Signal::SIGTERM, Signal::SIGINT] {
            let process = Arc::new(Process::new());
            process.startup();
            let guard = process.trap_signals().unwrap();

            signal::kill(Pid::from_raw(std::process::id() as i32), sig).unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            while process.is_running() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(!process.is_running(), "{:?} should stop the process", sig);

            drop(guard);
        }
    }
}
