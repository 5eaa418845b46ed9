//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// vedispatch node - VE task dispatcher
#[derive(Parser, Debug)]
#[command(name = "dispatch-node")]
#[command(about = "vedispatch node - VE task dispatcher")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Node ID (auto-generated if not provided)
    #[arg(long)]
    pub node_id: Option<String>,

    /// Seconds to wait for tasks to stop on shutdown
    #[arg(long)]
    pub shutdown_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile the backup disks of a VE with a new configuration
    Reconcile(ReconcileArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ReconcileArgs {
    /// VE configuration currently in effect
    #[arg(long)]
    pub from: PathBuf,

    /// VE configuration to move to
    #[arg(long)]
    pub to: PathBuf,

    /// Print the event plan without applying it
    #[arg(long)]
    pub plan: bool,

    /// Apply as a configuration edit: live changes wait until the VE runs
    #[arg(long)]
    pub edit: bool,

    /// Write the resulting configuration, with attached devices, to this file
    #[arg(long)]
    pub output: Option<PathBuf>,
}
