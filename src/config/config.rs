//! Configuration structures and loading

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable enabling debug logging everywhere.
pub const ENV_DEBUG: &str = "CONTAINER_DEBUG";

/// Environment variable naming a helper label that should spin in a
/// debugger-wait loop right after spawn.
pub const ENV_DEBUG_LAUNCHD_LABEL: &str = "CONTAINER_DEBUG_LAUNCHD_LABEL";

/// Environment variable overriding the app-data root (used by tests).
pub const ENV_APP_ROOT: &str = "CONTAINER_APP_ROOT";

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Filesystem roots
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Service-manager registration settings
    #[serde(default)]
    pub services: ServiceConfiguration,

    /// Network defaults
    #[serde(default)]
    pub network: NetworkConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        let mut config: Configuration = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("failed to read config file: {}", path))?;
            toml::from_str(&content).with_context(|| "failed to parse configuration")?
        } else {
            Configuration::default()
        };

        if std::env::var(ENV_DEBUG).is_ok() {
            config.debug = true;
        }
        config.system.resolve();

        std::fs::create_dir_all(&config.system.app_root)?;
        std::fs::create_dir_all(config.system.container_root())?;
        std::fs::create_dir_all(config.system.volume_root())?;
        std::fs::create_dir_all(config.system.network_root())?;
        std::fs::create_dir_all(config.system.image_root())?;
        std::fs::create_dir_all(config.system.service_root())?;

        Ok(config)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            system: SystemConfiguration::default(),
            services: ServiceConfiguration::default(),
            network: NetworkConfiguration::default(),
        }
    }
}

/// Filesystem layout under one app-data root.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// App-data root; every persisted artifact lives beneath it
    #[serde(default = "default_app_root")]
    pub app_root: PathBuf,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            app_root: default_app_root(),
        }
    }
}

impl SystemConfiguration {
    fn resolve(&mut self) {
        if let Ok(root) = std::env::var(ENV_APP_ROOT) {
            self.app_root = PathBuf::from(root);
        }
    }

    pub fn container_root(&self) -> PathBuf {
        self.app_root.join("containers")
    }

    pub fn volume_root(&self) -> PathBuf {
        self.app_root.join("volumes")
    }

    pub fn network_root(&self) -> PathBuf {
        self.app_root.join("networks")
    }

    pub fn image_root(&self) -> PathBuf {
        self.app_root.join("images")
    }

    pub fn service_root(&self) -> PathBuf {
        self.app_root.join("services")
    }

    /// The daemon's own control socket.
    pub fn api_socket(&self) -> PathBuf {
        self.app_root.join("harbord.sock")
    }
}

fn default_app_root() -> PathBuf {
    if let Ok(root) = std::env::var(ENV_APP_ROOT) {
        return PathBuf::from(root);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join("Library")
        .join("Application Support")
        .join("harbor")
}

/// Host service-manager registration settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfiguration {
    /// Label prefix helper registrations use: `<prefix>.<handler>.<id>`
    #[serde(default = "default_service_prefix")]
    pub label_prefix: String,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            label_prefix: default_service_prefix(),
        }
    }
}

fn default_service_prefix() -> String {
    "com.harbor.sandbox".to_string()
}

/// Network defaults applied when a container does not name a network.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfiguration {
    #[serde(default = "default_network_name")]
    pub default_network: String,

    /// Subnet the built-in allocator hands addresses from
    #[serde(default = "default_subnet")]
    pub subnet: String,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            default_network: default_network_name(),
            subnet: default_subnet(),
        }
    }
}

fn default_network_name() -> String {
    "default".to_string()
}

fn default_subnet() -> String {
    "192.168.64.0/24".to_string()
}

static GLOBAL: OnceLock<Configuration> = OnceLock::new();

/// Install the process-wide configuration. May be called once; later calls
/// are ignored so tests can pre-seed it.
pub fn install(config: Configuration) -> &'static Configuration {
    GLOBAL.get_or_init(|| config)
}

/// The process-wide configuration, defaulted from the environment when the
/// entry point has not installed one (helper processes, tests).
pub fn get() -> &'static Configuration {
    GLOBAL.get_or_init(|| {
        let mut config = Configuration::default();
        config.system.resolve();
        config.debug = std::env::var(ENV_DEBUG).is_ok();
        config
    })
}
