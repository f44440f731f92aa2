//! Sandbox helper entry point
//!
//! One helper process per container: load the bundle, build the sandbox,
//! serve its control surface on the bundle socket, and exit when a
//! shutdown grace period elapses or the host tears the process down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use harbor_daemon::config;
use harbor_daemon::network::{NetworkService, NullPacketFilter};
use harbor_daemon::orchestrator::Bundle;
use harbor_daemon::protocol;
use harbor_daemon::sandbox::{Sandbox, SandboxServer};
use harbor_daemon::services::ENV_SERVICE_LABEL;
use harbor_daemon::vm;

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Bundle directory for this container
    #[arg(long)]
    pub root: PathBuf,

    /// Container id; must match the bundle's configuration
    #[arg(long)]
    pub uuid: String,

    /// Enable debug logging for this helper
    #[arg(long)]
    pub debug: bool,
}

pub async fn run(args: StartArgs) -> Result<()> {
    debugger_wait(&args.root);

    info!(
        "sandbox helper starting (root: {}, debug: {})",
        args.root.display(),
        args.debug
    );

    let containers_root = args
        .root
        .parent()
        .context("bundle path has no parent directory")?;
    let bundle = Bundle::at(containers_root, &args.uuid);
    let container_config = bundle.load_config().context("failed to load bundle")?;
    if container_config.id != args.uuid {
        bail!(
            "bundle belongs to {}, not {}",
            container_config.id,
            args.uuid
        );
    }

    let app = config::get();
    let networks = Arc::new(NetworkService::open(
        app.system.network_root(),
        &app.network.default_network,
        &app.network.subnet,
    )?);
    let factory = vm::platform_factory(&container_config.runtime_handler)?;

    let socket_path = bundle.control_socket();
    let sandbox = Sandbox::new(
        container_config,
        bundle,
        factory,
        networks,
        Arc::new(NullPacketFilter),
    );
    let exit = sandbox.exit_handle();

    let listener = protocol::bind(&socket_path)?;
    info!(
        "sandbox {} serving on {}",
        args.uuid,
        socket_path.display()
    );

    let serve_token = CancellationToken::new();
    let server = SandboxServer::new(sandbox);
    tokio::select! {
        _ = protocol::serve(listener, server, serve_token.clone()) => {}
        _ = exit.cancelled() => {
            info!("sandbox {} shut down", args.uuid);
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("sandbox {} interrupted", args.uuid);
        }
    }
    serve_token.cancel();
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

/// Spin until a debugger releases us when this helper's label matches
/// `CONTAINER_DEBUG_LAUNCHD_LABEL`.
fn debugger_wait(root: &std::path::Path) {
    let Ok(wanted) = std::env::var(config::ENV_DEBUG_LAUNCHD_LABEL) else {
        return;
    };
    let label = std::env::var(ENV_SERVICE_LABEL).unwrap_or_default();
    if label != wanted {
        return;
    }
    let release = root.join("debug-continue");
    warn!(
        "helper {} waiting for debugger; touch {} to continue",
        label,
        release.display()
    );
    while !release.exists() {
        std::thread::sleep(Duration::from_secs(1));
    }
    let _ = std::fs::remove_file(&release);
}
