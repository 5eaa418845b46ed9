//! # vedispatch Node
//!
//! Drives the dispatcher task framework from the command line. The node
//! runs backup-device reconciliations of a VE as real tasks: registered in
//! the task manager, cancellable with Ctrl-C, answered through the node's
//! own client session.
//!
//! ## Usage
//! ```bash
//! dispatch-node --config /etc/vedispatch/node.yaml reconcile --from old.yaml --to new.yaml
//! dispatch-node reconcile --from old.yaml --to new.yaml --plan
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod reconcile;
mod session;

use cli::{Args, Command};
use config::{Config, LogFormat, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration; logging depends on it
    let (config, source) = match &args.config {
        Some(config_path) => {
            let cfg = Config::load(config_path)?;
            (cfg.with_cli_overrides(&args), Some(config_path.as_str()))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (cfg.with_cli_overrides(&args), Some(DEFAULT_CONFIG_PATH)),
            Err(_) => (Config::default_with_cli(&args), None),
        },
    };

    // Initialize logging
    match config.logging.format {
        LogFormat::Plain => dispatch_common::init_logging(&args.log_level)?,
        LogFormat::Json => dispatch_common::init_logging_json(&args.log_level)?,
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting vedispatch node"
    );
    match source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No config file found, using CLI arguments and defaults"),
    }

    match &args.command {
        Command::Reconcile(reconcile_args) => {
            let code = reconcile::run(&config, reconcile_args).await?;
            if code.is_failed() {
                error!(code = %code, "Reconciliation failed");
                return Err(anyhow::anyhow!("reconciliation failed: {code}"));
            }
            info!("Reconciliation complete");
        }
    }

    Ok(())
}
