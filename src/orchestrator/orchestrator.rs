//! The containers orchestrator

use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::monitor::ExitMonitor;
use crate::monitor::WaiterRegistry;
use crate::protocol::{ControlClient, MessageBag, Route};
use crate::sandbox::SandboxStdio;
use crate::services::ServiceManager;
use crate::system::LifecycleLock;
use crate::types::{
    validate_id, Attachment, ContainerConfiguration, ContainerSnapshot, ContainerStats,
    ContainerStatus, ExitStatus, MountKind, ProcessConfiguration,
};
use crate::volume::VolumeService;

use super::bundle::{clone_filesystem, Bundle, CreateOptions};
use super::runtime::RuntimeRegistry;

/// How long `delete --force` gives init before SIGKILL lands.
const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrator wiring that is fixed at startup.
pub struct OrchestratorConfig {
    pub containers_root: PathBuf,
    /// The binary helpers are spawned from (this daemon, in sandbox mode)
    pub helper_executable: PathBuf,
    /// Service labels take the form `<prefix>.<runtime-handler>.<id>`
    pub label_prefix: String,
}

struct ContainerEntry {
    snapshot: ContainerSnapshot,
    options: CreateOptions,
    client: Option<Arc<ControlClient>>,
    exited: bool,
}

/// Directory of containers: persistent bundles, helper registrations, and
/// proxied control calls.
///
/// The `entries` map is mutated only under the orchestrator lock; reads
/// take point-in-time snapshots without locking.
pub struct Orchestrator {
    config: OrchestratorConfig,
    entries: DashMap<String, ContainerEntry>,
    lock: LifecycleLock,
    monitor: Arc<ExitMonitor>,
    waiters: WaiterRegistry,
    images: Arc<dyn ImageStore>,
    volumes: Arc<VolumeService>,
    services: Arc<dyn ServiceManager>,
    runtimes: RuntimeRegistry,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        images: Arc<dyn ImageStore>,
        volumes: Arc<VolumeService>,
        services: Arc<dyn ServiceManager>,
        runtimes: RuntimeRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: DashMap::new(),
            lock: LifecycleLock::new(),
            monitor: Arc::new(ExitMonitor::new()),
            waiters: WaiterRegistry::new(),
            images,
            volumes,
            services,
            runtimes,
        })
    }

    fn label_for(&self, handler: &str, id: &str) -> String {
        format!("{}.{}.{}", self.config.label_prefix, handler, id)
    }

    fn helper_args(&self, bundle: &Bundle, id: &str) -> Vec<String> {
        vec![
            "sandbox".to_string(),
            "start".to_string(),
            "--root".to_string(),
            bundle.path().display().to_string(),
            "--uuid".to_string(),
            id.to_string(),
            "--debug".to_string(),
        ]
    }

    fn bundle(&self, id: &str) -> Bundle {
        Bundle::at(&self.config.containers_root, id)
    }

    // ========================================================================
    // Boot-time restore
    // ========================================================================

    /// Scan `containers/` and rebuild each snapshot as `stopped`,
    /// re-registering its helper. Corrupt bundles are deleted and logged;
    /// they never block boot.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("orchestrator lock", e))?;

        std::fs::create_dir_all(&self.config.containers_root)?;

        let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.config.containers_root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type()?.is_dir() || name.starts_with('.') {
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::internal("restore semaphore closed"))?;
            let bundle = Bundle::at(&self.config.containers_root, &name);
            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                match (bundle.load_config(), bundle.load_options()) {
                    (Ok(config), Ok(options)) if config.id == name => {
                        Some((config, options))
                    }
                    _ => {
                        error!("removing corrupt bundle {}", bundle.path().display());
                        let _ = bundle.delete();
                        None
                    }
                }
            }));
        }

        let mut restored = 0usize;
        for task in tasks {
            let Ok(Some((config, options))) = task.await else {
                continue;
            };
            let id = config.id.clone();
            let handler = config.runtime_handler.clone();
            let bundle = self.bundle(&id);
            self.entries.insert(
                id.clone(),
                ContainerEntry {
                    snapshot: ContainerSnapshot::stopped(config),
                    options,
                    client: None,
                    exited: false,
                },
            );
            let label = self.label_for(&handler, &id);
            let args = self.helper_args(&bundle, &id);
            if let Err(e) = self
                .services
                .register(&label, &self.config.helper_executable, &args, &[])
                .await
            {
                // A helper that survived the daemon is already registered.
                debug!("helper {} not re-registered: {}", label, e);
            }
            restored += 1;
        }
        info!("restored {} container(s)", restored);
        Ok(())
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Snapshots only; no cross-process calls.
    pub fn list(&self) -> Vec<ContainerSnapshot> {
        let mut snapshots: Vec<ContainerSnapshot> = self
            .entries
            .iter()
            .map(|entry| entry.value().snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.configuration.id.cmp(&b.configuration.id));
        snapshots
    }

    /// Run `op` against a point-in-time snapshot list under the
    /// orchestrator lock, so creation cannot race a prune or delete scan.
    pub async fn with_container_list<F, R>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&[ContainerSnapshot]) -> Result<R>,
    {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("orchestrator lock", e))?;
        let snapshots = self.list();
        op(&snapshots)
    }

    pub fn snapshot(&self, id: &str) -> Result<ContainerSnapshot> {
        self.entries
            .get(id)
            .map(|entry| entry.value().snapshot.clone())
            .ok_or_else(|| Error::not_found(format!("container {} does not exist", id)))
    }

    /// Whether any container mounts the named volume.
    pub fn volume_in_use(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| {
            entry
                .value()
                .snapshot
                .configuration
                .mounts
                .iter()
                .any(|m| m.kind == MountKind::Volume && m.source == name)
        })
    }

    /// Whether any container attaches to the named network.
    pub fn network_in_use(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| {
            entry
                .value()
                .snapshot
                .configuration
                .networks
                .iter()
                .any(|n| n.network == name)
        })
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Validate, materialize the bundle, and register the helper. Any
    /// failure unwinds the bundle directory completely.
    pub async fn create(
        &self,
        config: ContainerConfiguration,
        kernel: &Path,
        options: CreateOptions,
    ) -> Result<ContainerSnapshot> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("orchestrator lock", e))?;

        let id = config.id.clone();
        if !validate_id(&id) {
            return Err(Error::invalid_argument(format!(
                "container id {} is not valid",
                id
            )));
        }
        if self.entries.contains_key(&id) {
            return Err(Error::exists(format!("container {} already exists", id)));
        }

        let mut claimed: Vec<&str> = config.hostnames();
        claimed.sort_unstable();
        if claimed.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::exists(format!(
                "configuration for {} claims the same hostname twice",
                id
            )));
        }
        for entry in self.entries.iter() {
            for taken in entry.value().snapshot.configuration.hostnames() {
                if claimed.contains(&taken) {
                    return Err(Error::exists(format!(
                        "hostname {} is held by container {}",
                        taken,
                        entry.key()
                    )));
                }
            }
        }

        let runtime = self.runtimes.get(&config.runtime_handler)?;
        let initfs = self
            .images
            .get_create_snapshot(&runtime.init_image, &config.platform)
            .await?;
        let rootfs = self
            .images
            .get_create_snapshot(&config.image.reference, &config.platform)
            .await?;

        // Volume mounts must resolve before anything is persisted.
        for mount in &config.mounts {
            if mount.kind == MountKind::Volume {
                self.volumes.source_for(&mount.source).map_err(|e| {
                    Error::wrap(format!("volume mount {} cannot resolve", mount.source), e)
                })?;
            }
        }

        let kernel = kernel.to_path_buf();
        let bundle = Bundle::create(
            &self.config.containers_root,
            &config,
            &options,
            move |staging| {
                if kernel.is_dir() {
                    clone_filesystem(&kernel, &staging.kernel_dir())?;
                } else {
                    clone_filesystem(&kernel, &staging.kernel_dir().join("vmlinux"))?;
                }
                clone_filesystem(&initfs.path, &staging.initfs_path())?;
                clone_filesystem(&rootfs.path, &staging.rootfs_path())?;
                Ok(())
            },
        )?;

        let unwind = scopeguard::guard(bundle.clone(), |bundle| {
            let _ = bundle.delete();
        });

        let label = self.label_for(&config.runtime_handler, &id);
        let args = self.helper_args(&bundle, &id);
        self.services
            .register(&label, &self.config.helper_executable, &args, &[])
            .await?;

        let snapshot = ContainerSnapshot::stopped(config);
        self.entries.insert(
            id.clone(),
            ContainerEntry {
                snapshot: snapshot.clone(),
                options,
                client: None,
                exited: false,
            },
        );

        scopeguard::ScopeGuard::into_inner(unwind);
        info!("created container {}", id);
        Ok(snapshot)
    }

    // ========================================================================
    // Bootstrap and start
    // ========================================================================

    /// Open the helper's control channel, bootstrap the sandbox, and hook
    /// the container into the exit monitor. Errors run the container
    /// cleanup path.
    pub async fn bootstrap(self: &Arc<Self>, id: &str, stdio: SandboxStdio) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("orchestrator lock", e))?;

        if !self.entries.contains_key(id) {
            return Err(Error::not_found(format!("container {} does not exist", id)));
        }

        match self.bootstrap_locked(id, stdio).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("bootstrap of {} failed: {}", id, err);
                self.handle_exit_locked(id, ExitStatus::new(ExitStatus::WAIT_FAILED_CODE))
                    .await;
                Err(err)
            }
        }
    }

    async fn bootstrap_locked(self: &Arc<Self>, id: &str, stdio: SandboxStdio) -> Result<()> {
        let bundle = self.bundle(id);
        let client = Arc::new(self.connect(&bundle).await?);

        let mut bag = MessageBag::new();
        let mut fds: Vec<OwnedFd> = Vec::new();
        for (key, fd) in [
            ("stdin", stdio.stdin),
            ("stdout", stdio.stdout),
            ("stderr", stdio.stderr),
        ] {
            if let Some(fd) = fd {
                bag.set_handle(key, fds.len() as u32);
                fds.push(fd);
            }
        }
        let borrowed: Vec<_> = fds.iter().map(|fd| fd.as_fd()).collect();
        client
            .request(Route::ContainerBootstrap, bag, &borrowed)
            .await?;

        let weak: Weak<Orchestrator> = Arc::downgrade(self);
        let handler_id = id.to_string();
        self.monitor.register_process(
            id,
            Box::new(move |_id, status| {
                let weak = Weak::clone(&weak);
                let handler_id = handler_id.clone();
                Box::pin(async move {
                    let Some(orchestrator) = weak.upgrade() else {
                        return;
                    };
                    let Ok(_guard) = orchestrator.lock.acquire().await else {
                        return;
                    };
                    orchestrator.handle_exit_locked(&handler_id, status).await;
                })
            }),
        )?;

        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.client = Some(client);
            entry.exited = false;
        }
        // A previous run's cached exit code must not satisfy new waiters.
        self.waiters.forget(id);
        Ok(())
    }

    async fn connect(&self, bundle: &Bundle) -> Result<ControlClient> {
        let path = bundle.control_socket();
        let backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_elapsed_time(Some(Duration::from_secs(10)))
            .build();
        backoff::future::retry(backoff, || async {
            ControlClient::connect(&path)
                .await
                .map_err(backoff::Error::transient)
        })
        .await
        .map_err(|e| Error::wrap("helper control channel did not come up", e))
    }

    fn client(&self, id: &str) -> Result<Arc<ControlClient>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| Error::not_found(format!("container {} does not exist", id)))?;
        entry.value().client.clone().ok_or_else(|| {
            Error::invalid_state(format!("container {} is not bootstrapped", id))
        })
    }

    /// Start init (no-op when already running) or a created exec process.
    pub async fn start_process(self: &Arc<Self>, id: &str, process_id: &str) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("orchestrator lock", e))?;

        {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| Error::not_found(format!("container {} does not exist", id)))?;
            if process_id == id && entry.value().snapshot.status == ContainerStatus::Running {
                return Ok(());
            }
        }
        let client = self.client(id)?;

        let mut bag = MessageBag::new();
        bag.set_string("processId", process_id);
        let (reply, _) = client.request(Route::ContainerStartProcess, bag, &[]).await?;

        if process_id == id {
            // Container-wide wait: the monitor supervises the helper's
            // long-poll and returns the init exit code.
            let wait_client = Arc::clone(&client);
            let wait_id = id.to_string();
            self.monitor.track(id, async move {
                let mut bag = MessageBag::new();
                bag.set_string("processId", &wait_id);
                let (reply, _) = wait_client
                    .request_unbounded(Route::ContainerWait, bag)
                    .await?;
                Ok(ExitStatus {
                    code: reply.i64("code")? as i32,
                    exited_at: Utc::now(),
                })
            })?;

            let attachments: Vec<Attachment> = reply.json("attachments")?;
            if let Some(mut entry) = self.entries.get_mut(id) {
                entry.snapshot.status = ContainerStatus::Running;
                entry.snapshot.networks = attachments;
                entry.snapshot.started_date = Some(Utc::now());
            }
            info!("container {} is running", id);
        }
        Ok(())
    }

    // ========================================================================
    // Proxied process operations
    // ========================================================================

    pub async fn create_process(
        &self,
        id: &str,
        process_id: &str,
        config: ProcessConfiguration,
        stdio: SandboxStdio,
    ) -> Result<()> {
        let client = self.client(id)?;
        let mut bag = MessageBag::new();
        bag.set_string("processId", process_id);
        bag.set_json("config", &config)?;
        let mut fds: Vec<OwnedFd> = Vec::new();
        for (key, fd) in [
            ("stdin", stdio.stdin),
            ("stdout", stdio.stdout),
            ("stderr", stdio.stderr),
        ] {
            if let Some(fd) = fd {
                bag.set_handle(key, fds.len() as u32);
                fds.push(fd);
            }
        }
        let borrowed: Vec<_> = fds.iter().map(|fd| fd.as_fd()).collect();
        client
            .request(Route::ContainerCreateProcess, bag, &borrowed)
            .await?;
        Ok(())
    }

    pub async fn kill(&self, id: &str, process_id: &str, signal: i32) -> Result<()> {
        let client = self.client(id)?;
        let mut bag = MessageBag::new();
        bag.set_string("processId", process_id);
        bag.set_i64("signal", signal as i64);
        client.request(Route::ContainerKill, bag, &[]).await?;
        Ok(())
    }

    pub async fn resize(&self, id: &str, process_id: &str, columns: u16, rows: u16) -> Result<()> {
        let client = self.client(id)?;
        let mut bag = MessageBag::new();
        bag.set_string("processId", process_id);
        bag.set_u64("columns", columns as u64);
        bag.set_u64("rows", rows as u64);
        client.request(Route::ContainerResize, bag, &[]).await?;
        Ok(())
    }

    pub async fn dial(&self, id: &str, port: u32) -> Result<OwnedFd> {
        let client = self.client(id)?;
        let mut bag = MessageBag::new();
        bag.set_u64("port", port as u64);
        let (reply, mut fds) = client.request(Route::ContainerDial, bag, &[]).await?;
        let index = reply.handle("stream")?;
        if index >= fds.len() {
            return Err(Error::internal("dial reply carried no stream descriptor"));
        }
        Ok(fds.swap_remove(index))
    }

    /// Read handles for the container's logs: forwarded to the helper when
    /// it is up, read straight from the bundle once it is gone.
    pub async fn logs(&self, id: &str) -> Result<(OwnedFd, OwnedFd)> {
        let client = match self.client(id) {
            Ok(client) => client,
            Err(err) if err.is_kind(crate::error::ErrorKind::InvalidState) => {
                let bundle = self.bundle(id);
                let open = |path: std::path::PathBuf| -> Result<OwnedFd> {
                    if !path.exists() {
                        std::fs::write(&path, b"")?;
                    }
                    let file = std::fs::OpenOptions::new().read(true).open(&path)?;
                    Ok(OwnedFd::from(file))
                };
                return Ok((open(bundle.stdio_log())?, open(bundle.boot_log())?));
            }
            Err(err) => return Err(err),
        };
        let (reply, fds) = client
            .request(Route::ContainerLogs, MessageBag::new(), &[])
            .await?;
        let stdio_index = reply.handle("stdio")?;
        let boot_index = reply.handle("boot")?;
        let mut fds: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        let stdio = fds
            .get_mut(stdio_index)
            .and_then(|slot| slot.take())
            .ok_or_else(|| Error::internal("logs reply missing stdio descriptor"))?;
        let boot = fds
            .get_mut(boot_index)
            .and_then(|slot| slot.take())
            .ok_or_else(|| Error::internal("logs reply missing boot descriptor"))?;
        Ok((stdio, boot))
    }

    pub async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let client = self.client(id)?;
        let (reply, _) = client
            .request(Route::ContainerStats, MessageBag::new(), &[])
            .await?;
        reply.json("stats")
    }

    /// Wait for a process exit. Container-wide waits served from the
    /// orchestrator's cache once the container has exited.
    pub async fn wait(&self, id: &str, process_id: &str) -> Result<ExitStatus> {
        if process_id == id {
            if let Some(cached) = self.waiters.cached(id) {
                return Ok(cached);
            }
        }
        let client = match self.client(id) {
            Ok(client) => client,
            Err(err) => {
                // The helper is gone; a completed container still answers.
                if process_id == id {
                    if let Some(cached) = self.waiters.cached(id) {
                        return Ok(cached);
                    }
                }
                return Err(err);
            }
        };
        let mut bag = MessageBag::new();
        bag.set_string("processId", process_id);
        let (reply, _) = client.request_unbounded(Route::ContainerWait, bag).await?;
        Ok(ExitStatus {
            code: reply.i64("code")? as i32,
            exited_at: Utc::now(),
        })
    }

    // ========================================================================
    // Stop, exit handling, delete
    // ========================================================================

    /// Graceful stop; idempotent. After a successful stop the common exit
    /// handler runs here too, so auto-remove fires even when the exit
    /// signal races the control reply.
    pub async fn stop(self: &Arc<Self>, id: &str, signal: i32, timeout: Duration) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("orchestrator lock", e))?;

        let client = {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| Error::not_found(format!("container {} does not exist", id)))?;
            entry.value().client.clone()
        };
        let Some(client) = client else {
            return Ok(()); // already stopped
        };

        let mut bag = MessageBag::new();
        bag.set_i64("signal", signal as i64);
        bag.set_u64("timeoutSeconds", timeout.as_secs());
        client.request(Route::ContainerStop, bag, &[]).await?;

        self.handle_exit_locked(id, ExitStatus::new(ExitStatus::SIGKILL_CODE))
            .await;
        Ok(())
    }

    /// The container-level exit handler. Idempotent per container run:
    /// stops monitor tracking, shuts the helper down, marks the snapshot
    /// stopped, resolves container-wide waiters, and honours auto-remove.
    async fn handle_exit_locked(self: &Arc<Self>, id: &str, status: ExitStatus) {
        let (client, auto_remove) = {
            let Some(mut entry) = self.entries.get_mut(id) else {
                return;
            };
            let entry = entry.value_mut();
            if entry.exited && entry.client.is_none() {
                return;
            }
            entry.exited = true;
            entry.snapshot.status = ContainerStatus::Stopped;
            (entry.client.take(), entry.options.auto_remove)
        };

        info!("container {} exited with code {}", id, status.code);
        self.monitor.stop_tracking(id);
        if let Some(client) = client {
            if let Err(e) = client
                .request(Route::ContainerShutdown, MessageBag::new(), &[])
                .await
            {
                debug!("shutdown of helper for {} failed: {}", id, e);
            }
        }
        self.waiters.resolve(id, status);

        if auto_remove {
            if let Err(e) = self.remove_container_locked(id).await {
                warn!("auto-remove of {} failed: {}", id, e);
            }
        }
    }

    /// Delete a container. A running container needs `force`, which sends
    /// SIGKILL with a short timeout first; `stopping` is rejected.
    pub async fn delete(self: &Arc<Self>, id: &str, force: bool) -> Result<()> {
        let _guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| Error::wrap("orchestrator lock", e))?;

        let (status, client) = {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| Error::not_found(format!("container {} does not exist", id)))?;
            (
                entry.value().snapshot.status,
                entry.value().client.clone(),
            )
        };

        match status {
            ContainerStatus::Stopping => {
                return Err(Error::invalid_state(format!(
                    "container {} is stopping; retry once it has stopped",
                    id
                )));
            }
            ContainerStatus::Running if !force => {
                return Err(Error::invalid_state(format!(
                    "container {} is running; use force to delete it",
                    id
                )));
            }
            ContainerStatus::Running => {
                if let Some(client) = &client {
                    let mut bag = MessageBag::new();
                    bag.set_i64("signal", libc::SIGKILL as i64);
                    bag.set_u64("timeoutSeconds", FORCE_STOP_TIMEOUT.as_secs());
                    client.request(Route::ContainerStop, bag, &[]).await?;
                }
                self.handle_exit_locked(id, ExitStatus::new(ExitStatus::SIGKILL_CODE))
                    .await;
            }
            _ => {
                if let Some(client) = &client {
                    let _ = client
                        .request(Route::ContainerShutdown, MessageBag::new(), &[])
                        .await;
                }
            }
        }

        self.remove_container_locked(id).await
    }

    /// Deregister the helper, drop the map entry, release anonymous
    /// volumes, and delete the bundle last.
    async fn remove_container_locked(&self, id: &str) -> Result<()> {
        let Some((_, entry)) = self.entries.remove(id) else {
            return Ok(());
        };
        let config = &entry.snapshot.configuration;

        let label = self.label_for(&config.runtime_handler, id);
        if let Err(e) = self.services.deregister(&label).await {
            warn!("deregistering {} failed: {}", label, e);
        }

        for mount in &config.mounts {
            if mount.kind == MountKind::Volume {
                if let Ok(volume) = self.volumes.inspect(&mount.source) {
                    if volume.is_anonymous {
                        let _ = self.volumes.delete(&mount.source, false);
                    }
                }
            }
        }

        self.bundle(id).delete()?;
        info!("deleted container {}", id);
        Ok(())
    }

    // ========================================================================
    // System operations
    // ========================================================================

    /// Deregister every helper under the service prefix.
    pub async fn system_stop(&self) -> Result<()> {
        let labels = self.services.list(&self.config.label_prefix).await?;
        for label in labels {
            if let Err(e) = self.services.deregister(&label).await {
                warn!("deregistering {} failed: {}", label, e);
            }
        }
        Ok(())
    }

    /// Bytes used by one container's bundle.
    pub fn disk_usage(&self, id: &str) -> Result<u64> {
        if !self.entries.contains_key(id) {
            return Err(Error::not_found(format!("container {} does not exist", id)));
        }
        dir_size(self.bundle(id).path())
    }

    /// Stream the container's rootfs block image into `target`.
    pub async fn export(&self, id: &str, target: OwnedFd) -> Result<u64> {
        let status = self.snapshot(id)?.status;
        if status != ContainerStatus::Stopped {
            return Err(Error::invalid_state(format!(
                "container {} must be stopped to export",
                id
            )));
        }
        let rootfs = self.bundle(id).rootfs_path();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut source = std::fs::File::open(&rootfs)?;
            let mut target = std::fs::File::from(target);
            let copied = std::io::copy(&mut source, &mut target)?;
            Ok(copied)
        })
        .await
        .map_err(|e| Error::internal(format!("export task failed: {}", e)))?
    }
}

pub(crate) fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        if kind.is_dir() {
            total += dir_size(&entry.path())?;
        } else if kind.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
