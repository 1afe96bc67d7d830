//! Command-line interface for workforge.
//!
//! Provides commands for running and stopping the daemon, stopping
//! workers, enqueueing jobs and inspecting queues.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
