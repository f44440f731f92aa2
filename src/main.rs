//! harbord - macOS container manager
//!
//! Runs Linux containers inside per-container lightweight virtual
//! machines. Without a subcommand this process is the API daemon; the
//! `sandbox start` subcommand runs one per-container helper, spawned by
//! the host service manager.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use harbor_daemon::config;

mod cmd;

#[derive(Parser)]
#[command(name = "harbord")]
#[command(about = "macOS container manager with per-container lightweight VMs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "harbord.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long, env = config::ENV_DEBUG)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("harbor_daemon={},harbord={}", log_level, log_level).into()),
        )
        .init();

    info!("harbord v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Sandbox(cmd::SandboxCommands::Start(args))) => {
            if let Err(e) = cmd::sandbox::run(args).await {
                error!("sandbox error: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("daemon error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
