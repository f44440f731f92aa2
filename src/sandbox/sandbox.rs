//! The sandbox state machine

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::forward::ForwarderPool;
use crate::monitor::ExitMonitor;
use crate::monitor::WaiterRegistry;
use crate::network::{NetworkService, PacketFilter};
use crate::orchestrator::Bundle;
use crate::system::{LifecycleLock, StreamPool};
use crate::types::{
    Attachment, ContainerConfiguration, ContainerSnapshot, ContainerStats, ExitStatus,
    MountKind, ProcessConfiguration, SocketDirection,
};
use crate::vm::{
    GuestMount, GuestStdio, InterfaceConfiguration, SocketAttachment, TerminalSize,
    VirtualMachine, VirtualMachineFactory, VmConfiguration,
};

use super::hosts;
use super::logio;
use super::state::SandboxState;

/// Grace period between accepting `shutdown` and process exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Standard stream handles a caller attaches to a process.
#[derive(Debug, Default)]
pub struct SandboxStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Options for a graceful stop.
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Signal delivered to init first
    pub signal: i32,
    /// How long to wait before escalating to SIGKILL
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            signal: libc::SIGTERM,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Created,
    Running,
    Stopped(i32),
}

struct ProcessEntry {
    config: ProcessConfiguration,
    stdio: Option<SandboxStdio>,
    state: ProcessState,
}

/// One container's sandbox: the VM, its attachments, its forwarders, the
/// init process, and named exec processes.
pub struct Sandbox {
    config: ContainerConfiguration,
    bundle: Bundle,
    factory: Arc<dyn VirtualMachineFactory>,
    networks: Arc<NetworkService>,
    filter: Arc<dyn PacketFilter>,

    state: RwLock<SandboxState>,
    lock: LifecycleLock,
    vm: RwLock<Option<Arc<dyn VirtualMachine>>>,
    processes: Mutex<HashMap<String, ProcessEntry>>,
    monitor: Arc<ExitMonitor>,
    waiters: WaiterRegistry,
    forwarders: tokio::sync::Mutex<Option<ForwarderPool>>,
    attachments: RwLock<Vec<Attachment>>,
    streams: StreamPool,
    started: RwLock<Option<DateTime<Utc>>>,
    exit_signal: CancellationToken,
}

impl Sandbox {
    pub fn new(
        config: ContainerConfiguration,
        bundle: Bundle,
        factory: Arc<dyn VirtualMachineFactory>,
        networks: Arc<NetworkService>,
        filter: Arc<dyn PacketFilter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bundle,
            factory,
            networks,
            filter,
            state: RwLock::new(SandboxState::Created),
            lock: LifecycleLock::new(),
            vm: RwLock::new(None),
            processes: Mutex::new(HashMap::new()),
            monitor: Arc::new(ExitMonitor::new()),
            waiters: WaiterRegistry::new(),
            forwarders: tokio::sync::Mutex::new(None),
            attachments: RwLock::new(Vec::new()),
            streams: StreamPool::new(),
            started: RwLock::new(None),
            exit_signal: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Read-only state inspection; callers must tolerate observing a
    /// transient state, no lock is taken.
    pub fn state(&self) -> SandboxState {
        *self.state.read()
    }

    /// Fires once a `shutdown` grace period elapses; the helper process
    /// exits on it.
    pub fn exit_handle(&self) -> CancellationToken {
        self.exit_signal.clone()
    }

    /// Live stream of workload output for attached clients.
    pub fn output_streams(&self) -> &StreamPool {
        &self.streams
    }

    fn set_state(&self, next: SandboxState) {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            *state = next;
            previous
        };
        if previous != next {
            info!("sandbox {}: {} -> {}", self.config.id, previous, next);
        }
    }

    fn vm_handle(&self) -> Result<Arc<dyn VirtualMachine>> {
        self.vm
            .read()
            .clone()
            .ok_or_else(|| Error::invalid_state("sandbox has no virtual machine"))
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Build and create the VM, allocate attachments, start the port
    /// forwarders, and move to `booted`. A failure fully unwinds: every
    /// allocation is released and the state stays `created`.
    pub async fn bootstrap(self: &Arc<Self>, stdio: SandboxStdio) -> Result<Vec<Attachment>> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("lifecycle lock", e))?;

        if self.state() != SandboxState::Created {
            return Err(Error::invalid_state(format!(
                "cannot bootstrap from state {}",
                self.state()
            )));
        }

        match self.bootstrap_locked(stdio).await {
            Ok(attachments) => {
                self.set_state(SandboxState::Booted);
                Ok(attachments)
            }
            Err(err) => {
                warn!("bootstrap of {} failed: {}", self.config.id, err);
                self.processes.lock().remove(&self.config.id);
                self.cleanup().await;
                Err(err)
            }
        }
    }

    async fn bootstrap_locked(self: &Arc<Self>, stdio: SandboxStdio) -> Result<Vec<Attachment>> {
        if self.config.virtualization && !self.factory.supports_nested_virtualization() {
            return Err(Error::unsupported(
                "the runtime handler does not support nested virtualization",
            ));
        }
        if self.config.rosetta && !self.factory.supports_rosetta() {
            return Err(Error::unsupported(
                "the runtime handler does not support rosetta",
            ));
        }

        // Allocate each attachment in order; partial allocations are
        // visible to cleanup if a later one fails.
        for request in &self.config.networks {
            let driver = self.networks.get(&request.network)?;
            let hostname = request
                .hostname
                .clone()
                .unwrap_or_else(|| self.config.id.clone());
            let attachment = driver
                .allocate(&hostname, request.mac_address.as_deref())
                .await?;
            self.attachments.write().push(attachment);
        }
        let attachments = self.attachments.read().clone();

        let dns = hosts::derive_dns(&self.config.dns, &attachments);
        let hosts_file = hosts::render_hosts(&self.config.id, &attachments);

        let interfaces = attachments
            .iter()
            .map(|a| InterfaceConfiguration {
                address: a.address.clone(),
                gateway: a.gateway.clone(),
                mac_address: a.mac_address.clone(),
            })
            .collect();

        let mut sockets: Vec<SocketAttachment> = self
            .config
            .published_sockets
            .iter()
            .map(|s| SocketAttachment {
                host_path: s.host_path.clone().into(),
                guest_path: s.container_path.clone(),
                permissions: s.permissions,
                host_listens: s.direction == SocketDirection::OutOf,
            })
            .collect();
        if self.config.ssh {
            if let Ok(auth_sock) = std::env::var("SSH_AUTH_SOCK") {
                sockets.push(SocketAttachment {
                    host_path: auth_sock.into(),
                    guest_path: "/run/host-services/ssh-auth.sock".to_string(),
                    permissions: 0o600,
                    host_listens: false,
                });
            }
        }

        let volume_root = crate::config::get().system.volume_root();
        let mounts = self
            .config
            .mounts
            .iter()
            .map(|m| {
                // Volume mounts resolve to their block image at attach time.
                let source = match m.kind {
                    MountKind::Volume => volume_root
                        .join(&m.source)
                        .join("volume.img")
                        .display()
                        .to_string(),
                    _ => m.source.clone(),
                };
                GuestMount {
                    kind: m.kind,
                    source,
                    destination: m.destination.clone(),
                    options: m
                        .options
                        .iter()
                        .chain(m.runtime_options.iter())
                        .cloned()
                        .collect(),
                }
            })
            .collect();

        let vm_config = VmConfiguration {
            kernel: self.bundle.kernel_dir(),
            initfs: self.bundle.initfs_path(),
            rootfs: self.bundle.rootfs_path(),
            cpus: self.config.resources.cpus,
            memory_in_bytes: self.config.resources.memory_in_bytes,
            interfaces,
            sockets,
            mounts,
            process: self.config.init_process.clone(),
            dns,
            hosts: hosts_file,
            sysctls: self.config.sysctls.clone(),
            boot_log: self.bundle.boot_log(),
            nested_virtualization: self.config.virtualization,
            rosetta: self.config.rosetta,
        };

        let vm = self.factory.build(vm_config).await?;
        vm.create().await?;
        *self.vm.write() = Some(vm);

        let weak = Arc::downgrade(self);
        self.monitor.register_process(
            &self.config.id,
            Box::new(move |_id, status| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    if let Some(sandbox) = weak.upgrade() {
                        sandbox.handle_init_exit(status).await;
                    }
                })
            }),
        )?;

        let pool = if self.config.published_ports.is_empty() {
            ForwarderPool::idle(Arc::clone(&self.filter), &self.config.id)
        } else {
            let guest_ip: IpAddr = attachments
                .first()
                .ok_or_else(|| {
                    Error::invalid_argument(
                        "published ports require at least one network attachment",
                    )
                })?
                .ip()
                .parse()
                .map_err(|_| Error::internal("driver returned an unparseable address"))?;
            ForwarderPool::start(
                &self.config.published_ports,
                guest_ip,
                Arc::clone(&self.filter),
                &self.config.id,
            )
            .await?
        };
        *self.forwarders.lock().await = Some(pool);

        self.processes.lock().insert(
            self.config.id.clone(),
            ProcessEntry {
                config: self.config.init_process.clone(),
                stdio: Some(stdio),
                state: ProcessState::Created,
            },
        );

        Ok(attachments)
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Start init (from `booted`) or a previously created exec process
    /// (from `running`). Returns the resolved attachments for init.
    pub async fn start_process(self: &Arc<Self>, id: &str) -> Result<Vec<Attachment>> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("lifecycle lock", e))?;

        if id == self.config.id {
            self.start_init().await
        } else {
            self.start_exec(id).await?;
            Ok(Vec::new())
        }
    }

    async fn start_init(self: &Arc<Self>) -> Result<Vec<Attachment>> {
        if self.state() != SandboxState::Booted {
            return Err(Error::invalid_state(format!(
                "cannot start init from state {}",
                self.state()
            )));
        }
        let vm = self.vm_handle()?;
        let id = self.config.id.clone();

        let stdio = self
            .processes
            .lock()
            .get_mut(&id)
            .and_then(|entry| entry.stdio.take())
            .unwrap_or_default();

        // Fan workload output out to the log file, the attached caller,
        // and live subscribers.
        let stdout = logio::start_pump(&self.bundle.stdio_log(), stdio.stdout, self.streams.clone())?;
        let stderr = logio::start_pump(&self.bundle.stdio_log(), stdio.stderr, self.streams.clone())?;
        let guest_stdio = GuestStdio {
            stdin: stdio.stdin,
            stdout: Some(stdout),
            stderr: Some(stderr),
        };

        vm.start(&id, guest_stdio).await?;

        let wait_vm = Arc::clone(&vm);
        let wait_id = id.clone();
        self.monitor
            .track(&id, async move { wait_vm.wait(&wait_id).await })?;

        if let Some(entry) = self.processes.lock().get_mut(&id) {
            entry.state = ProcessState::Running;
        }
        *self.started.write() = Some(Utc::now());
        self.set_state(SandboxState::Running);
        Ok(self.attachments.read().clone())
    }

    async fn start_exec(self: &Arc<Self>, id: &str) -> Result<()> {
        if self.state() != SandboxState::Running {
            return Err(Error::invalid_state(format!(
                "cannot start process {} from state {}",
                id,
                self.state()
            )));
        }
        let vm = self.vm_handle()?;

        let (config, stdio) = {
            let mut processes = self.processes.lock();
            let entry = processes
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("no process {} in this sandbox", id)))?;
            if entry.state != ProcessState::Created {
                return Err(Error::invalid_state(format!(
                    "process {} was already started",
                    id
                )));
            }
            (entry.config.clone(), entry.stdio.take().unwrap_or_default())
        };

        let guest_stdio = GuestStdio {
            stdin: stdio.stdin,
            stdout: stdio.stdout,
            stderr: stdio.stderr,
        };
        vm.exec(id, config, guest_stdio).await?;

        let wait_vm = Arc::clone(&vm);
        let wait_id = id.to_string();
        self.monitor
            .track(id, async move { wait_vm.wait(&wait_id).await })?;

        if let Some(entry) = self.processes.lock().get_mut(id) {
            entry.state = ProcessState::Running;
        }
        Ok(())
    }

    /// Record a new exec process as created and stash its stdio.
    pub async fn create_process(
        self: &Arc<Self>,
        id: &str,
        config: ProcessConfiguration,
        stdio: SandboxStdio,
    ) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("lifecycle lock", e))?;

        match self.state() {
            SandboxState::Booted | SandboxState::Running => {}
            other => {
                return Err(Error::invalid_state(format!(
                    "cannot create a process from state {}",
                    other
                )))
            }
        }

        {
            let mut processes = self.processes.lock();
            if processes.contains_key(id) {
                return Err(Error::exists(format!(
                    "process id {} is already in use",
                    id
                )));
            }
            processes.insert(
                id.to_string(),
                ProcessEntry {
                    config,
                    stdio: Some(stdio),
                    state: ProcessState::Created,
                },
            );
        }

        let weak = Arc::downgrade(self);
        self.monitor.register_process(
            id,
            Box::new(move |exec_id, status| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    if let Some(sandbox) = weak.upgrade() {
                        sandbox.handle_exec_exit(&exec_id, status);
                    }
                })
            }),
        )?;
        Ok(())
    }

    /// Exec exits only affect their own process entry; container state is
    /// untouched.
    fn handle_exec_exit(&self, id: &str, status: ExitStatus) {
        debug!("exec {} in {} exited: {}", id, self.config.id, status.code);
        if let Some(entry) = self.processes.lock().get_mut(id) {
            entry.state = ProcessState::Stopped(status.code);
        }
        self.waiters.resolve(id, status);
    }

    /// Init exit outside of a graceful stop: power off, clean up, record
    /// the real exit code.
    async fn handle_init_exit(self: Arc<Self>, status: ExitStatus) {
        let _guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match self.state() {
            SandboxState::Stopped(_) | SandboxState::Stopping => return,
            _ => {}
        }

        info!(
            "init of {} exited with code {}",
            self.config.id, status.code
        );
        if let Ok(vm) = self.vm_handle() {
            if let Err(e) = vm.stop().await {
                warn!("vm stop for {} failed: {}", self.config.id, e);
            }
        }
        self.cleanup().await;
        if let Some(entry) = self.processes.lock().get_mut(&self.config.id) {
            entry.state = ProcessState::Stopped(status.code);
        }
        self.set_state(SandboxState::Stopped(status.code));
        self.waiters.resolve(&self.config.id, status);
    }

    // ========================================================================
    // Signals, resize, dial, wait
    // ========================================================================

    pub async fn kill(&self, id: &str, signal: i32) -> Result<()> {
        if self.state() != SandboxState::Running {
            return Err(Error::invalid_state(format!(
                "cannot signal processes from state {}",
                self.state()
            )));
        }
        if !self.processes.lock().contains_key(id) {
            return Err(Error::not_found(format!("no process {} in this sandbox", id)));
        }
        self.vm_handle()?.kill(id, signal).await
    }

    pub async fn resize(&self, id: &str, columns: u16, rows: u16) -> Result<()> {
        if self.state() != SandboxState::Running {
            return Err(Error::invalid_state(format!(
                "cannot resize terminals from state {}",
                self.state()
            )));
        }
        if !self.processes.lock().contains_key(id) {
            return Err(Error::not_found(format!("no process {} in this sandbox", id)));
        }
        self.vm_handle()?
            .resize(id, TerminalSize { columns, rows })
            .await
    }

    /// Open a byte stream to a guest vsock port.
    pub async fn dial(&self, port: u32) -> Result<OwnedFd> {
        match self.state() {
            SandboxState::Running | SandboxState::Booted => {}
            other => {
                return Err(Error::invalid_state(format!(
                    "cannot dial from state {}",
                    other
                )))
            }
        }
        if port == 0 {
            return Err(Error::invalid_argument("vsock port 0 is not dialable"));
        }
        self.vm_handle()?.dial_vsock(port).await
    }

    /// Recorded exit code for a process that has already stopped.
    pub fn process_exit_code(&self, id: &str) -> Option<i32> {
        match self.processes.lock().get(id).map(|entry| entry.state) {
            Some(ProcessState::Stopped(code)) => Some(code),
            _ => None,
        }
    }

    /// Block until the addressed process exits; exits are cached, so late
    /// waiters return immediately.
    pub async fn wait(&self, id: &str) -> Result<ExitStatus> {
        let known = {
            let processes = self.processes.lock();
            processes.contains_key(id)
        };
        if !known && self.waiters.cached(id).is_none() {
            return Err(Error::not_found(format!("no process {} in this sandbox", id)));
        }
        Ok(self.waiters.wait(id).await)
    }

    // ========================================================================
    // Stop and shutdown
    // ========================================================================

    /// Graceful stop: race init exit against signal-then-SIGKILL, power the
    /// VM off, clean up, and record `stopped(137)`. A stop from any state
    /// other than `running`/`booted` is a no-op.
    pub async fn stop(self: &Arc<Self>, options: StopOptions) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("lifecycle lock", e))?;

        let was_running = match self.state() {
            SandboxState::Running => true,
            SandboxState::Booted => false,
            _ => return Ok(()),
        };
        self.set_state(SandboxState::Stopping);

        let vm = self.vm_handle()?;
        let id = self.config.id.clone();

        if was_running {
            let waiting = vm.wait(&id);
            let escalating = async {
                if let Err(e) = vm.kill(&id, options.signal).await {
                    warn!("stop signal to {} failed: {}", id, e);
                }
                tokio::time::sleep(options.timeout).await;
                if let Err(e) = vm.kill(&id, libc::SIGKILL).await {
                    warn!("sigkill to {} failed: {}", id, e);
                }
            };
            tokio::select! {
                _ = waiting => debug!("init of {} exited during stop", id),
                _ = escalating => debug!("stop of {} escalated to sigkill", id),
            }
        }

        if let Err(e) = vm.stop().await {
            warn!("vm stop for {} failed: {}", id, e);
        }
        self.cleanup().await;

        let status = ExitStatus::new(ExitStatus::SIGKILL_CODE);
        if let Some(entry) = self.processes.lock().get_mut(&id) {
            entry.state = ProcessState::Stopped(status.code);
        }
        self.set_state(SandboxState::Stopped(status.code));
        self.waiters.resolve(&id, status);
        Ok(())
    }

    /// Accept a shutdown from `created`, `stopping`, or `stopped`; the
    /// helper process exits after a short grace period.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("lifecycle lock", e))?;

        match self.state() {
            SandboxState::Created | SandboxState::Stopping | SandboxState::Stopped(_) => {}
            other => {
                return Err(Error::invalid_state(format!(
                    "cannot shut down from state {}",
                    other
                )))
            }
        }
        self.set_state(SandboxState::ShuttingDown);

        let exit_signal = self.exit_signal.clone();
        let id = self.config.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            info!("sandbox {} exiting after shutdown grace", id);
            exit_signal.cancel();
        });
        Ok(())
    }

    /// Release everything bootstrap acquired: forwarders, attachments,
    /// monitor registrations, and the VM handle.
    async fn cleanup(&self) {
        if let Some(pool) = self.forwarders.lock().await.take() {
            pool.close().await;
        }
        let attachments: Vec<Attachment> = std::mem::take(&mut *self.attachments.write());
        for attachment in attachments {
            match self.networks.get(&attachment.network) {
                Ok(driver) => {
                    if let Err(e) = driver.deallocate(&attachment.hostname).await {
                        warn!(
                            "failed to release {} on {}: {}",
                            attachment.hostname, attachment.network, e
                        );
                    }
                }
                Err(e) => warn!("network lookup during cleanup failed: {}", e),
            }
        }
        self.monitor.stop_tracking(&self.config.id);
        *self.vm.write() = None;
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            configuration: self.config.clone(),
            status: self.state().status(),
            networks: self.attachments.read().clone(),
            started_date: *self.started.read(),
        }
    }

    /// Read handles to the container's log files, creating them when the
    /// container has not produced output yet.
    pub fn logs(&self) -> Result<(OwnedFd, OwnedFd)> {
        for path in [self.bundle.stdio_log(), self.bundle.boot_log()] {
            if !path.exists() {
                std::fs::write(&path, b"")?;
            }
        }
        Ok((
            logio::open_log(&self.bundle.stdio_log())?,
            logio::open_log(&self.bundle.boot_log())?,
        ))
    }

    pub async fn stats(&self) -> Result<ContainerStats> {
        if self.state() != SandboxState::Running {
            return Err(Error::invalid_state(format!(
                "cannot read stats from state {}",
                self.state()
            )));
        }
        let mut stats = self.vm_handle()?.stats().await?;
        if let Some(started) = *self.started.read() {
            stats.uptime_millis = (Utc::now() - started).num_milliseconds();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::network::NullPacketFilter;
    use crate::orchestrator::CreateOptions;
    use crate::types::{
        AttachmentConfiguration, ContainerStatus, ImageDescriptor, Platform, PortProtocol,
        PublishedPort, User,
    };
    use crate::vm::fake::FakeVmFactory;
    use std::io::Read;

    struct Fixture {
        _root: tempfile::TempDir,
        sandbox: Arc<Sandbox>,
        factory: Arc<FakeVmFactory>,
        networks: Arc<NetworkService>,
    }

    fn config(id: &str) -> ContainerConfiguration {
        ContainerConfiguration {
            id: id.to_string(),
            image: ImageDescriptor {
                reference: "docker.io/library/alpine:latest".into(),
                digest: None,
            },
            platform: Platform::linux("arm64"),
            resources: Default::default(),
            init_process: ProcessConfiguration {
                executable: "/bin/sh".into(),
                arguments: vec!["-c".into(), "echo hi".into()],
                environment: Vec::new(),
                working_directory: "/".into(),
                user: User::default(),
                rlimits: Vec::new(),
                terminal: false,
                supplemental_groups: Vec::new(),
            },
            mounts: Vec::new(),
            published_ports: Vec::new(),
            published_sockets: Vec::new(),
            networks: vec![AttachmentConfiguration {
                network: "default".into(),
                hostname: Some(format!("{}-host", id)),
                mac_address: None,
            }],
            dns: Default::default(),
            sysctls: Default::default(),
            runtime_handler: "vz".into(),
            virtualization: false,
            rosetta: false,
            ssh: false,
        }
    }

    fn fixture_with(config: ContainerConfiguration) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let containers = root.path().join("containers");
        let bundle = Bundle::create(&containers, &config, &CreateOptions::default(), |staging| {
            std::fs::write(staging.rootfs_path(), b"rootfs")?;
            std::fs::write(staging.initfs_path(), b"initfs")?;
            Ok(())
        })
        .unwrap();
        let networks = Arc::new(
            NetworkService::open(root.path().join("networks"), "default", "192.168.64.0/24")
                .unwrap(),
        );
        let factory = FakeVmFactory::new();
        let sandbox = Sandbox::new(
            config,
            bundle,
            factory.clone(),
            Arc::clone(&networks),
            Arc::new(NullPacketFilter),
        );
        Fixture {
            _root: root,
            sandbox,
            factory,
            networks,
        }
    }

    fn fixture(id: &str) -> Fixture {
        fixture_with(config(id))
    }

    #[tokio::test]
    async fn test_bootstrap_then_start_runs_init() {
        let f = fixture("c1");
        let attachments = f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        assert_eq!(f.sandbox.state(), SandboxState::Booted);
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].hostname, "c1-host");

        let reported = f.sandbox.start_process("c1").await.unwrap();
        assert_eq!(f.sandbox.state(), SandboxState::Running);
        assert_eq!(reported.len(), 1);
        assert!(f.sandbox.snapshot().started_date.is_some());

        let vm = f.factory.last_machine().unwrap();
        assert!(vm.created.load(std::sync::atomic::Ordering::SeqCst));
        assert!(vm.has_process("c1"));
        let hosts = &vm.config.hosts;
        assert!(hosts.contains("c1-host"));
        assert_eq!(vm.config.dns.nameservers, vec!["192.168.64.1"]);
    }

    #[tokio::test]
    async fn test_bootstrap_rejected_when_not_created() {
        let f = fixture("c1");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        let err = f
            .sandbox
            .bootstrap(SandboxStdio::default())
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidState));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_unwinds_allocations() {
        let f = fixture("c1");
        f.factory
            .fail_build
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = f
            .sandbox
            .bootstrap(SandboxStdio::default())
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Internal));
        assert_eq!(f.sandbox.state(), SandboxState::Created);

        // The hostname allocation was released, so it can be taken again.
        let driver = f.networks.get("default").unwrap();
        driver.allocate("c1-host", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_exit_transitions_to_stopped_with_real_code() {
        let f = fixture("c1");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        f.sandbox.start_process("c1").await.unwrap();

        let vm = f.factory.last_machine().unwrap();
        vm.finish("c1", 3);

        let status = f.sandbox.wait("c1").await.unwrap();
        assert_eq!(status.code, 3);

        // The exit handler needs the lifecycle lock after wait resolves.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.sandbox.state(), SandboxState::Stopped(3));
        assert!(vm.powered_off.load(std::sync::atomic::Ordering::SeqCst));

        // Post-exit waiters get the cached code immediately.
        assert_eq!(f.sandbox.wait("c1").await.unwrap().code, 3);
    }

    #[tokio::test]
    async fn test_graceful_stop_records_137() {
        let f = fixture("c1");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        f.sandbox.start_process("c1").await.unwrap();

        f.sandbox
            .stop(StopOptions {
                signal: libc::SIGTERM,
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();

        assert_eq!(f.sandbox.state(), SandboxState::Stopped(137));
        let vm = f.factory.last_machine().unwrap();
        assert!(vm.powered_off.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(vm.signals_for("c1"), vec![libc::SIGTERM]);
        assert_eq!(f.sandbox.wait("c1").await.unwrap().code, 137);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture("c1");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        f.sandbox.start_process("c1").await.unwrap();

        f.sandbox.stop(StopOptions::default()).await.unwrap();
        assert_eq!(f.sandbox.state(), SandboxState::Stopped(137));

        // Second stop is a no-op and preserves the first code.
        f.sandbox.stop(StopOptions::default()).await.unwrap();
        assert_eq!(f.sandbox.state(), SandboxState::Stopped(137));
    }

    #[tokio::test]
    async fn test_exec_lifecycle() {
        let f = fixture("c1");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        f.sandbox.start_process("c1").await.unwrap();

        let exec_config = ProcessConfiguration {
            executable: "/bin/sh".into(),
            arguments: Vec::new(),
            environment: Vec::new(),
            working_directory: "/".into(),
            user: User::default(),
            rlimits: Vec::new(),
            terminal: true,
            supplemental_groups: Vec::new(),
        };
        f.sandbox
            .create_process("e1", exec_config.clone(), SandboxStdio::default())
            .await
            .unwrap();

        // Duplicate ids are rejected, including the init id.
        let err = f
            .sandbox
            .create_process("e1", exec_config.clone(), SandboxStdio::default())
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Exists));
        let err = f
            .sandbox
            .create_process("c1", exec_config, SandboxStdio::default())
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Exists));

        f.sandbox.start_process("e1").await.unwrap();
        f.sandbox.resize("e1", 80, 24).await.unwrap();
        f.sandbox.kill("e1", libc::SIGTERM).await.unwrap();

        let status = f.sandbox.wait("e1").await.unwrap();
        assert_eq!(status.code, 128 + libc::SIGTERM);
        assert_eq!(f.sandbox.process_exit_code("e1"), Some(128 + libc::SIGTERM));

        // Exec exit leaves the container running.
        assert_eq!(f.sandbox.state(), SandboxState::Running);
        assert_eq!(f.sandbox.process_exit_code("c1"), None);
        let vm = f.factory.last_machine().unwrap();
        assert_eq!(
            vm.resizes_for("e1"),
            vec![TerminalSize {
                columns: 80,
                rows: 24
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_process_operations() {
        let f = fixture("c1");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        f.sandbox.start_process("c1").await.unwrap();

        assert!(f
            .sandbox
            .kill("ghost", libc::SIGTERM)
            .await
            .unwrap_err()
            .is_kind(ErrorKind::NotFound));
        assert!(f
            .sandbox
            .resize("ghost", 1, 1)
            .await
            .unwrap_err()
            .is_kind(ErrorKind::NotFound));
        assert!(f
            .sandbox
            .wait("ghost")
            .await
            .unwrap_err()
            .is_kind(ErrorKind::NotFound));
        assert!(f
            .sandbox
            .start_process("ghost")
            .await
            .unwrap_err()
            .is_kind(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_dial_validations() {
        let f = fixture("c1");
        let err = f.sandbox.dial(1024).await.unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidState));

        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        let err = f.sandbox.dial(0).await.unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));

        let fd = f.sandbox.dial(1024).await.unwrap();
        drop(fd);
    }

    #[tokio::test]
    async fn test_shutdown_state_rules() {
        let f = fixture("c1");

        // Accepted from created.
        f.sandbox.shutdown().await.unwrap();
        assert_eq!(f.sandbox.state(), SandboxState::ShuttingDown);

        // Rejected from booted and running.
        let f = fixture("c2");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        assert!(f
            .sandbox
            .shutdown()
            .await
            .unwrap_err()
            .is_kind(ErrorKind::InvalidState));
        f.sandbox.start_process("c2").await.unwrap();
        assert!(f
            .sandbox
            .shutdown()
            .await
            .unwrap_err()
            .is_kind(ErrorKind::InvalidState));

        // Accepted again once stopped.
        f.sandbox.stop(StopOptions::default()).await.unwrap();
        f.sandbox.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stdio_fans_out_to_caller_and_log() {
        let f = fixture("c1");
        let (caller_read, caller_write) = std::io::pipe().unwrap();
        f.sandbox
            .bootstrap(SandboxStdio {
                stdin: None,
                stdout: Some(OwnedFd::from(caller_write)),
                stderr: None,
            })
            .await
            .unwrap();
        f.sandbox.start_process("c1").await.unwrap();

        let vm = f.factory.last_machine().unwrap();
        vm.write_stdout("c1", b"hi\n");

        let mut caller = std::fs::File::from(OwnedFd::from(caller_read));
        let mut seen = String::new();
        caller.read_to_string(&mut seen).unwrap();
        assert_eq!(seen, "hi\n");

        let (stdio_log, _boot_log) = f.sandbox.logs().unwrap();
        let mut log = std::fs::File::from(stdio_log);
        let mut logged = String::new();
        log.read_to_string(&mut logged).unwrap();
        assert_eq!(logged, "hi\n");
    }

    #[tokio::test]
    async fn test_forwarders_cover_range_and_close_on_stop() {
        // Guest upstream is irrelevant here; we only assert bind/unbind.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut cfg = config("c1");
        cfg.published_ports = vec![PublishedPort {
            host_address: "127.0.0.1".into(),
            host_port,
            container_port: 8080,
            protocol: PortProtocol::Tcp,
            count: 1,
        }];
        let f = fixture_with(cfg);

        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        // The host port is now bound.
        assert!(tokio::net::TcpListener::bind(("127.0.0.1", host_port))
            .await
            .is_err());

        f.sandbox.start_process("c1").await.unwrap();
        f.sandbox.stop(StopOptions::default()).await.unwrap();

        // Closed with the container.
        assert!(tokio::net::TcpListener::bind(("127.0.0.1", host_port))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_stats_only_while_running() {
        let f = fixture("c1");
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        assert!(f
            .sandbox
            .stats()
            .await
            .unwrap_err()
            .is_kind(ErrorKind::InvalidState));

        f.sandbox.start_process("c1").await.unwrap();
        let stats = f.sandbox.stats().await.unwrap();
        assert!(stats.memory_limit_bytes > 0);
    }

    #[tokio::test]
    async fn test_snapshot_reports_status() {
        let f = fixture("c1");
        assert_eq!(f.sandbox.snapshot().status, ContainerStatus::Stopped);
        f.sandbox.bootstrap(SandboxStdio::default()).await.unwrap();
        f.sandbox.start_process("c1").await.unwrap();
        assert_eq!(f.sandbox.snapshot().status, ContainerStatus::Running);
    }
}
