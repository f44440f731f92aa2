//! Main daemon command - starts the API daemon

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use harbor_daemon::config::{self, Configuration};
use harbor_daemon::image::LocalImageStore;
use harbor_daemon::listener::{ApiServer, AppState};
use harbor_daemon::network::NetworkService;
use harbor_daemon::orchestrator::{
    Orchestrator, OrchestratorConfig, RuntimeHandler, RuntimeRegistry,
};
use harbor_daemon::protocol;
use harbor_daemon::services::ProcessServiceManager;
use harbor_daemon::volume::VolumeService;

/// Image whose snapshot provides the guest init filesystem.
const DEFAULT_INIT_IMAGE: &str = "harbor/init:latest";

/// Run the API daemon until interrupted.
pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from {}", config_path);
    let loaded = Configuration::load(config_path)?;
    let config = config::install(loaded);

    info!("  app root: {}", config.system.app_root.display());
    info!("  service prefix: {}", config.services.label_prefix);

    let images = Arc::new(LocalImageStore::open(config.system.image_root())?);
    let volumes = Arc::new(VolumeService::open(config.system.volume_root())?);
    let networks = Arc::new(NetworkService::open(
        config.system.network_root(),
        &config.network.default_network,
        &config.network.subnet,
    )?);
    let services = Arc::new(ProcessServiceManager::open(config.system.service_root())?);

    let runtimes = RuntimeRegistry::new();
    runtimes.register(RuntimeHandler {
        name: "vz".to_string(),
        init_image: DEFAULT_INIT_IMAGE.to_string(),
    });

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            containers_root: config.system.container_root(),
            helper_executable: std::env::current_exe()?,
            label_prefix: config.services.label_prefix.clone(),
        },
        images.clone(),
        volumes.clone(),
        services,
        runtimes,
    );

    // Bring prior containers back as registered-but-stopped.
    orchestrator.restore().await?;
    info!("tracking {} container(s)", orchestrator.list().len());

    let server = ApiServer::new(AppState {
        orchestrator,
        images,
        volumes,
        networks,
        app_root: config.system.app_root.clone(),
        default_subnet: config.network.subnet.clone(),
    });

    let socket_path = config.system.api_socket();
    let listener = protocol::bind(&socket_path)?;
    info!("listening on {}", socket_path.display());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received shutdown signal");
            signal_token.cancel();
        }
    });

    protocol::serve(listener, server, shutdown).await;
    let _ = std::fs::remove_file(&socket_path);
    info!("daemon stopped");
    Ok(())
}
