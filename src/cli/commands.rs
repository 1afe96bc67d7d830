//! CLI command definitions for workforge.
//!
//! Every command loads the layered configuration, connects to Redis and
//! registers the built-in handlers before dispatching.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::context::Context;
use crate::control::Control;
use crate::daemon::RunOutcome;
use crate::scheduler::{register_builtin, EnqueueOptions, Job};

/// Distributed background job engine.
#[derive(Parser)]
#[command(name = "workforge")]
#[command(about = "Run and administer a Redis-backed background job daemon")]
#[command(version)]
#[command(
    long_about = "workforge runs one daemon per host that pulls jobs from Redis queues and executes them in bounded worker slots.\n\nExample usage:\n  workforge daemon start\n  workforge enqueue echo '\"hello\"' --queue default\n  workforge daemon status"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "WORKFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the
    /// configured level.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Log filter when `RUST_LOG` is unset: the flag, then the configured
    /// level, then `info`.
    pub fn log_filter(&self) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        Config::load(self.config.as_deref())
            .map(|c| c.log_level)
            .unwrap_or_else(|_| "info".to_string())
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Control the per-host daemon.
    Daemon(DaemonArgs),

    /// Control worker processes.
    Worker(WorkerArgs),

    /// Create a job.
    Enqueue(EnqueueArgs),

    /// Inspect or empty the queues.
    Queues(QueuesArgs),
}

/// Arguments for `workforge daemon`.
#[derive(Parser, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommand,
}

/// Daemon subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground.
    Run,

    /// Start the daemon in the background.
    Start {
        /// File receiving the background daemon's log output.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Stop the daemon and its workers.
    Stop {
        /// Escalate to SIGKILL if SIGTERM is ignored.
        #[arg(short, long)]
        force: bool,
    },

    /// Stop, then start in the background.
    Restart {
        /// Escalate to SIGKILL if SIGTERM is ignored.
        #[arg(short, long)]
        force: bool,

        /// File receiving the background daemon's log output.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Print daemon, queue and worker status.
    Status,
}

/// Arguments for `workforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerCommand,
}

/// Worker subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum WorkerCommand {
    /// Stop the worker process with this pid.
    Stop {
        pid: u32,

        /// Escalate to SIGKILL if SIGTERM is ignored.
        #[arg(short, long)]
        force: bool,
    },
}

/// Arguments for `workforge enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Handler name.
    pub handler: String,

    /// Job arguments. Each is parsed as JSON, falling back to a string.
    pub args: Vec<String>,

    /// Target queue.
    #[arg(short, long)]
    pub queue: Option<String>,
}

/// Arguments for `workforge queues`.
#[derive(Parser, Debug)]
pub struct QueuesArgs {
    #[command(subcommand)]
    pub command: QueuesCommand,
}

/// Queue subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum QueuesCommand {
    /// Print every queue with its length.
    List,

    /// Empty every queue and reset job ids.
    Reset,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?.finalize()?;
    let ctx = Context::connect(Arc::clone(&config)).await?;
    register_builtin(&ctx.handlers);

    match cli.command {
        Commands::Daemon(args) => {
            run_daemon_command(&ctx, args.command, &cli.config, &cli.log_level).await
        }
        Commands::Worker(args) => run_worker_command(&ctx, args.command).await,
        Commands::Enqueue(args) => run_enqueue_command(&ctx, args).await,
        Commands::Queues(args) => run_queues_command(&ctx, args.command).await,
    }
}

// ============================================================================
// Daemon Commands
// ============================================================================

async fn run_daemon_command(
    ctx: &Context,
    command: DaemonCommand,
    config_path: &Option<PathBuf>,
    log_level: &Option<String>,
) -> anyhow::Result<()> {
    let control = Control::new(ctx);
    let background = background_args(config_path.as_deref(), log_level.as_deref());

    match command {
        DaemonCommand::Run => match control.run().await? {
            RunOutcome::Completed => info!("Daemon exited"),
            RunOutcome::AlreadyRunning(pid) => {
                println!("Another daemon with pid {} is already running", pid)
            }
            RunOutcome::Aborted => anyhow::bail!("Daemon terminated abnormally"),
        },
        DaemonCommand::Start { log_file } => {
            match control.start(&background, log_file.as_deref()).await? {
                Some(pid) => println!("Daemon started with pid {}", pid),
                None => println!("Daemon is already running"),
            }
        }
        DaemonCommand::Stop { force } => {
            report_remaining(&control.stop(force).await?);
        }
        DaemonCommand::Restart { force, log_file } => {
            match control
                .restart(force, &background, log_file.as_deref())
                .await?
            {
                Some(pid) => println!("Daemon restarted with pid {}", pid),
                None => println!("Daemon is still running, not restarted"),
            }
        }
        DaemonCommand::Status => {
            print!("{}", control.report().await?);
        }
    }
    Ok(())
}

/// Arguments for the detached `daemon run` child.
fn background_args(config: Option<&Path>, log_level: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(path) = config {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    if let Some(level) = log_level {
        args.push("--log-level".to_string());
        args.push(level.to_string());
    }
    args.push("daemon".to_string());
    args.push("run".to_string());
    args
}

fn report_remaining(remaining: &[u32]) {
    if remaining.is_empty() {
        println!("Stopped");
    } else {
        let pids: Vec<String> = remaining.iter().map(u32::to_string).collect();
        println!("Still running: {}", pids.join(", "));
    }
}

// ============================================================================
// Worker Commands
// ============================================================================

async fn run_worker_command(ctx: &Context, command: WorkerCommand) -> anyhow::Result<()> {
    let control = Control::new(ctx);
    match command {
        WorkerCommand::Stop { pid, force } => {
            if control.worker_stop(pid, force).await {
                println!("Worker {} stopped", pid);
            } else {
                anyhow::bail!("Worker {} did not stop", pid);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Job Commands
// ============================================================================

async fn run_enqueue_command(ctx: &Context, args: EnqueueArgs) -> anyhow::Result<()> {
    let job_args: Vec<Value> = args.args.iter().map(|raw| parse_arg(raw)).collect();
    let options = EnqueueOptions { queue: args.queue };
    let record = Job::create(ctx, &args.handler, job_args, options).await?;
    println!("Enqueued job #{} ({})", record.id, record.handler);
    Ok(())
}

/// Parses a job argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_queues_command(ctx: &Context, command: QueuesCommand) -> anyhow::Result<()> {
    match command {
        QueuesCommand::List => {
            for (name, len) in ctx.queues.lengths().await? {
                println!("{}: {}", name, len);
            }
        }
        QueuesCommand::Reset => {
            Job::delete_all(ctx).await?;
            println!("Queues reset");
        }
    }
    Ok(())
}
