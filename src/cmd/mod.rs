//! Command dispatch for the harbord binary

pub mod root;
pub mod sandbox;

use clap::Subcommand;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Per-container sandbox helper operations
    #[command(subcommand)]
    Sandbox(SandboxCommands),
}

#[derive(Debug, Subcommand)]
pub enum SandboxCommands {
    /// Serve one container's sandbox from its bundle
    Start(sandbox::StartArgs),
}
