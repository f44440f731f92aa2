//! Container configuration and snapshot types
//!
//! `ContainerConfiguration` is immutable after create; everything the
//! orchestrator or a sandbox helper needs to (re)build a container is
//! serialized into the bundle's `config.json` in this shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pattern a container id must match: `[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}`.
pub fn validate_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    if id.len() > 128 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Immutable per-container configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfiguration {
    /// Unique id across the orchestrator
    pub id: String,

    /// Image reference the rootfs was cloned from
    pub image: ImageDescriptor,

    /// Guest platform
    pub platform: Platform,

    /// CPU and memory sizing
    #[serde(default)]
    pub resources: Resources,

    /// The first in-guest process; its id equals the container id
    pub init_process: ProcessConfiguration,

    /// Filesystem mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// Host-visible published TCP/UDP ports
    #[serde(default)]
    pub published_ports: Vec<PublishedPort>,

    /// Host-visible published UNIX sockets
    #[serde(default)]
    pub published_sockets: Vec<PublishedSocket>,

    /// Ordered network attachment requests
    #[serde(default)]
    pub networks: Vec<AttachmentConfiguration>,

    /// Guest resolver configuration
    #[serde(default)]
    pub dns: DnsConfiguration,

    /// Guest sysctls applied at boot
    #[serde(default)]
    pub sysctls: HashMap<String, String>,

    /// Name of the helper plugin serving this container
    #[serde(default = "default_runtime_handler")]
    pub runtime_handler: String,

    /// Expose nested virtualization to the guest
    #[serde(default)]
    pub virtualization: bool,

    /// Enable Rosetta translation for x86_64 binaries
    #[serde(default)]
    pub rosetta: bool,

    /// Forward the host SSH authentication socket into the guest
    #[serde(default)]
    pub ssh: bool,
}

pub fn default_runtime_handler() -> String {
    "vz".to_string()
}

impl ContainerConfiguration {
    /// All hostnames this configuration claims, in attachment order.
    pub fn hostnames(&self) -> Vec<&str> {
        self.networks
            .iter()
            .filter_map(|n| n.hostname.as_deref())
            .collect()
    }
}

/// Reference plus content descriptor for the container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    /// Normalized reference, e.g. `docker.io/library/alpine:latest`
    pub reference: String,

    /// Content digest of the manifest this container was created from
    #[serde(default)]
    pub digest: Option<String>,
}

/// Guest platform selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn linux(architecture: &str) -> Self {
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// VM sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub cpus: u32,
    pub memory_in_bytes: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_in_bytes: 1 << 30,
        }
    }
}

/// Configuration for one guest process (init or exec).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfiguration {
    pub executable: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub environment: Vec<String>,

    #[serde(default = "default_cwd")]
    pub working_directory: String,

    #[serde(default)]
    pub user: User,

    #[serde(default)]
    pub rlimits: Vec<Rlimit>,

    /// Allocate a tty for the process
    #[serde(default)]
    pub terminal: bool,

    #[serde(default)]
    pub supplemental_groups: Vec<u32>,
}

fn default_cwd() -> String {
    "/".to_string()
}

/// Guest identity a process runs as.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rlimit {
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

/// A filesystem attachment into the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub kind: MountKind,

    /// Host-side source; meaning depends on `kind`
    #[serde(default)]
    pub source: String,

    /// Guest-side destination path
    pub destination: String,

    #[serde(default)]
    pub options: Vec<String>,

    /// Options applied at attach time rather than persisted in the image
    #[serde(default)]
    pub runtime_options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountKind {
    Tmpfs,
    VirtiofsShare,
    BlockImage,
    UnixSocketHost,
    Volume,
}

/// One published host-port range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPort {
    pub host_address: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: PortProtocol,
    /// Number of consecutive ports published, at least 1
    #[serde(default = "default_port_count")]
    pub count: u16,
}

fn default_port_count() -> u16 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// A UNIX socket relayed between host and guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedSocket {
    pub host_path: String,
    pub container_path: String,
    #[serde(default = "default_socket_mode")]
    pub permissions: u32,
    #[serde(default)]
    pub direction: SocketDirection,
}

fn default_socket_mode() -> u32 {
    0o600
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SocketDirection {
    /// Host listens, guest connects
    #[default]
    Into,
    /// Guest listens, host connects
    OutOf,
}

/// Request for one interface on one named network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentConfiguration {
    pub network: String,

    /// Hostname claimed on that network; unique across the orchestrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Fixed MAC address, colon-separated; allocated by the driver if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Guest resolver settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfiguration {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub search_domains: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Lifecycle status reported by `list` and `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Stopped,
    Running,
    Stopping,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopping => write!(f, "stopping"),
            ContainerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A resolved network attachment: the driver's answer to an
/// `AttachmentConfiguration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub network: String,
    pub hostname: String,
    /// CIDR form, e.g. `192.168.64.3/24`
    pub address: String,
    pub gateway: String,
    pub mac_address: String,
}

impl Attachment {
    /// The bare IP address without the prefix length.
    pub fn ip(&self) -> &str {
        self.address.split('/').next().unwrap_or(&self.address)
    }
}

/// Mutable point-in-time view of one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSnapshot {
    pub configuration: ContainerConfiguration,
    pub status: ContainerStatus,
    #[serde(default)]
    pub networks: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_date: Option<DateTime<Utc>>,
}

impl ContainerSnapshot {
    pub fn stopped(configuration: ContainerConfiguration) -> Self {
        Self {
            configuration,
            status: ContainerStatus::Stopped,
            networks: Vec::new(),
            started_date: None,
        }
    }
}

/// Terminal exit of a guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatus {
    pub code: i32,
    pub exited_at: DateTime<Utc>,
}

impl ExitStatus {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            exited_at: Utc::now(),
        }
    }

    /// The code recorded when a process is torn down by SIGKILL.
    pub const SIGKILL_CODE: i32 = 137;

    /// The code recorded when a wait handler fails instead of resolving.
    pub const WAIT_FAILED_CODE: i32 = 255;
}

/// Guest resource counters returned by `stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_time_nanos: u64,
    pub networks: Vec<AttachmentStats>,
    pub uptime_millis: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentStats {
    pub network: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}
