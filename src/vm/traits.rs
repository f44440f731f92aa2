//! Virtual machine backend trait definitions
//!
//! The hypervisor itself is an external collaborator. The sandbox drives it
//! through this narrow interface: construct from a configuration, create,
//! start, then per-process wait/kill/exec/resize plus vsock dialing.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    ContainerStats, DnsConfiguration, ExitStatus, MountKind, ProcessConfiguration,
};

/// Everything a backend needs to define one VM.
#[derive(Debug, Clone)]
pub struct VmConfiguration {
    /// Directory holding the kernel bits
    pub kernel: PathBuf,

    /// Init filesystem (directory or block image)
    pub initfs: PathBuf,

    /// Root filesystem block image
    pub rootfs: PathBuf,

    pub cpus: u32,
    pub memory_in_bytes: u64,

    /// Resolved guest interfaces, in attachment order
    pub interfaces: Vec<InterfaceConfiguration>,

    /// Host↔guest UNIX-socket relays
    pub sockets: Vec<SocketAttachment>,

    /// Additional filesystem attachments beyond the rootfs
    pub mounts: Vec<GuestMount>,

    /// The init process definition
    pub process: ProcessConfiguration,

    pub dns: DnsConfiguration,

    /// Rendered `/etc/hosts` content
    pub hosts: String,

    /// Guest sysctls applied before init runs
    pub sysctls: HashMap<String, String>,

    /// Path the guest console/boot messages are appended to
    pub boot_log: PathBuf,

    pub nested_virtualization: bool,
    pub rosetta: bool,
}

/// One guest network interface.
#[derive(Debug, Clone)]
pub struct InterfaceConfiguration {
    /// CIDR address, e.g. `192.168.64.3/24`
    pub address: String,
    pub gateway: String,
    pub mac_address: String,
}

/// A UNIX socket relayed across the VM boundary.
#[derive(Debug, Clone)]
pub struct SocketAttachment {
    pub host_path: PathBuf,
    pub guest_path: String,
    pub permissions: u32,
    /// True when the host side listens and the guest connects
    pub host_listens: bool,
}

/// A non-rootfs filesystem attachment.
#[derive(Debug, Clone)]
pub struct GuestMount {
    pub kind: MountKind,
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
}

/// Standard stream handles for a guest process. The backend consumes the
/// descriptors; absent handles leave the stream connected to /dev/null.
#[derive(Debug, Default)]
pub struct GuestStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Terminal dimensions for `resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub columns: u16,
    pub rows: u16,
}

/// Constructs VM instances for one runtime handler.
#[async_trait]
pub trait VirtualMachineFactory: Send + Sync {
    /// Instantiate a VM from its configuration. The machine is defined but
    /// holds no hypervisor resources until `create` runs.
    async fn build(&self, config: VmConfiguration) -> Result<Arc<dyn VirtualMachine>>;

    fn supports_nested_virtualization(&self) -> bool {
        false
    }

    fn supports_rosetta(&self) -> bool {
        false
    }
}

/// One running (or prepared) virtual machine and its guest agent.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// Allocate hypervisor resources and boot to the guest agent.
    async fn create(&self) -> Result<()>;

    /// Start the init workload. `id` is the container id; `stdio` carries
    /// the descriptors guest output is written to.
    async fn start(&self, id: &str, stdio: GuestStdio) -> Result<()>;

    /// Create and start an exec process inside the guest.
    async fn exec(&self, id: &str, config: ProcessConfiguration, stdio: GuestStdio) -> Result<()>;

    /// Block until the addressed process exits.
    async fn wait(&self, id: &str) -> Result<ExitStatus>;

    /// Deliver a signal to the addressed process.
    async fn kill(&self, id: &str, signal: i32) -> Result<()>;

    /// Resize the addressed process's terminal.
    async fn resize(&self, id: &str, size: TerminalSize) -> Result<()>;

    /// Open a byte stream to the guest vsock port, returning the host end.
    async fn dial_vsock(&self, port: u32) -> Result<OwnedFd>;

    /// Read guest resource counters.
    async fn stats(&self) -> Result<ContainerStats>;

    /// Power the machine off. Idempotent.
    async fn stop(&self) -> Result<()>;
}
