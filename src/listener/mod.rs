//! API daemon request dispatch
//!
//! The daemon listens on `<root>/harbord.sock` and routes the canonical
//! opcode set to the orchestrator and the image, volume, and network
//! services. Errors flow back over the wire with their kind preserved.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::network::NetworkService;
use crate::orchestrator::{CreateOptions, Orchestrator};
use crate::protocol::{MessageBag, RequestHandler, RequestOutcome, Route};
use crate::sandbox::SandboxStdio;
use crate::types::{ContainerConfiguration, Platform, ProcessConfiguration};
use crate::volume::{VolumeCreateOptions, VolumeService};

/// Shared handles behind the daemon's control surface.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub images: Arc<dyn ImageStore>,
    pub volumes: Arc<VolumeService>,
    pub networks: Arc<NetworkService>,
    pub app_root: PathBuf,
    pub default_subnet: String,
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self { state })
    }

    fn take_stdio(bag: &MessageBag, fds: &mut [Option<OwnedFd>]) -> Result<SandboxStdio> {
        let mut take = |key: &str| -> Result<Option<OwnedFd>> {
            match bag.opt_handle(key)? {
                Some(index) => fds
                    .get_mut(index)
                    .and_then(|slot| slot.take())
                    .map(Some)
                    .ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "{} refers to a missing descriptor",
                            key
                        ))
                    }),
                None => Ok(None),
            }
        };
        Ok(SandboxStdio {
            stdin: take("stdin")?,
            stdout: take("stdout")?,
            stderr: take("stderr")?,
        })
    }

    /// Ids for a batch verb: a single `id` or a JSON `ids` list.
    fn batch_ids(bag: &MessageBag) -> Result<Vec<String>> {
        if bag.contains("ids") {
            let ids: Vec<String> = bag.json("ids")?;
            if ids.is_empty() {
                return Err(Error::new(
                    crate::error::ErrorKind::Empty,
                    "no container ids given",
                ));
            }
            return Ok(ids);
        }
        Ok(vec![bag.string("id")?.to_string()])
    }

    /// Run `op` per id, accumulate failures, report the successes, and
    /// raise one aggregate error when anything failed.
    async fn run_batch<F, Fut>(ids: Vec<String>, op: F) -> Result<RequestOutcome>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for id in ids {
            match op(id.clone()).await {
                Ok(()) => succeeded.push(id),
                Err(err) => failures.push(format!("{}: {}", id, err)),
            }
        }
        let mut reply = MessageBag::new();
        reply.set_json("succeeded", &succeeded)?;
        if failures.is_empty() {
            Ok(RequestOutcome::bag(reply))
        } else if succeeded.is_empty() {
            Err(Error::internal(failures.join("; ")))
        } else {
            Err(Error::internal(format!(
                "{} (succeeded: {})",
                failures.join("; "),
                succeeded.join(", ")
            )))
        }
    }
}

#[async_trait]
impl RequestHandler for ApiServer {
    async fn handle(
        &self,
        route: Route,
        bag: MessageBag,
        fds: Vec<OwnedFd>,
    ) -> Result<RequestOutcome> {
        let mut fds: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        let state = &self.state;

        match route {
            // ================================================================
            // Containers
            // ================================================================
            Route::ContainerCreate => {
                let config: ContainerConfiguration = bag.json("config")?;
                let options: CreateOptions = if bag.contains("options") {
                    bag.json("options")?
                } else {
                    CreateOptions::default()
                };
                let kernel = PathBuf::from(bag.string("kernel")?);
                let snapshot = state.orchestrator.create(config, &kernel, options).await?;
                let mut reply = MessageBag::new();
                reply.set_json("container", &snapshot)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerList => {
                let containers = state
                    .orchestrator
                    .with_container_list(|snapshots| Ok(snapshots.to_vec()))
                    .await?;
                let mut reply = MessageBag::new();
                reply.set_json("containers", &containers)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerState => {
                let id = bag.string("id")?;
                let mut reply = MessageBag::new();
                reply.set_json("container", &state.orchestrator.snapshot(id)?)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerBootstrap => {
                let id = bag.string("id")?.to_string();
                let stdio = Self::take_stdio(&bag, &mut fds)?;
                state.orchestrator.bootstrap(&id, stdio).await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerStartProcess => {
                let id = bag.string("id")?;
                let process_id = bag.string("processId")?;
                state.orchestrator.start_process(id, process_id).await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerCreateProcess => {
                let id = bag.string("id")?.to_string();
                let process_id = bag.string("processId")?.to_string();
                let config: ProcessConfiguration = bag.json("config")?;
                let stdio = Self::take_stdio(&bag, &mut fds)?;
                state
                    .orchestrator
                    .create_process(&id, &process_id, config, stdio)
                    .await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerKill => {
                let signal = bag.i64("signal")? as i32;
                let ids = Self::batch_ids(&bag)?;
                let orchestrator = Arc::clone(&state.orchestrator);
                Self::run_batch(ids, move |id| {
                    let orchestrator = Arc::clone(&orchestrator);
                    async move {
                        let process = id.clone();
                        orchestrator.kill(&id, &process, signal).await
                    }
                })
                .await
            }
            Route::ContainerStop => {
                let signal = if bag.contains("signal") {
                    bag.i64("signal")? as i32
                } else {
                    libc::SIGTERM
                };
                let timeout = if bag.contains("timeoutSeconds") {
                    Duration::from_secs(bag.u64("timeoutSeconds")?)
                } else {
                    Duration::from_secs(5)
                };
                let ids = Self::batch_ids(&bag)?;
                let orchestrator = Arc::clone(&state.orchestrator);
                Self::run_batch(ids, move |id| {
                    let orchestrator = Arc::clone(&orchestrator);
                    async move { orchestrator.stop(&id, signal, timeout).await }
                })
                .await
            }
            Route::ContainerDelete => {
                let force = bag.bool_or("force", false)?;
                let ids = Self::batch_ids(&bag)?;
                let orchestrator = Arc::clone(&state.orchestrator);
                Self::run_batch(ids, move |id| {
                    let orchestrator = Arc::clone(&orchestrator);
                    async move { orchestrator.delete(&id, force).await }
                })
                .await
            }
            Route::ContainerWait => {
                let id = bag.string("id")?;
                let process_id = if bag.contains("processId") {
                    bag.string("processId")?
                } else {
                    id
                };
                let status = state.orchestrator.wait(id, process_id).await?;
                let mut reply = MessageBag::new();
                reply.set_i64("code", status.code as i64);
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerResize => {
                let id = bag.string("id")?;
                let process_id = bag.string("processId")?;
                let columns = bag.u64("columns")? as u16;
                let rows = bag.u64("rows")? as u16;
                state
                    .orchestrator
                    .resize(id, process_id, columns, rows)
                    .await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerDial => {
                let id = bag.string("id")?;
                let port = bag.u64("port")? as u32;
                let stream = state.orchestrator.dial(id, port).await?;
                let mut reply = MessageBag::new();
                reply.set_handle("stream", 0);
                Ok(RequestOutcome::with_fds(reply, vec![stream]))
            }
            Route::ContainerLogs => {
                let id = bag.string("id")?;
                let (stdio_log, boot_log) = state.orchestrator.logs(id).await?;
                let mut reply = MessageBag::new();
                reply.set_handle("stdio", 0);
                reply.set_handle("boot", 1);
                Ok(RequestOutcome::with_fds(reply, vec![stdio_log, boot_log]))
            }
            Route::ContainerStats => {
                let id = bag.string("id")?;
                let stats = state.orchestrator.stats(id).await?;
                let mut reply = MessageBag::new();
                reply.set_json("stats", &stats)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerShutdown => Err(Error::unsupported(
                "containerShutdown addresses a sandbox helper, not the daemon",
            )),
            Route::ContainerDiskUsage => {
                let id = bag.string("id")?;
                let mut reply = MessageBag::new();
                reply.set_u64("bytes", state.orchestrator.disk_usage(id)?);
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerExport => {
                let id = bag.string("id")?.to_string();
                let index = bag.handle("target")?;
                let target = fds
                    .get_mut(index)
                    .and_then(|slot| slot.take())
                    .ok_or_else(|| {
                        Error::invalid_argument("export target descriptor is missing")
                    })?;
                let copied = state.orchestrator.export(&id, target).await?;
                let mut reply = MessageBag::new();
                reply.set_u64("bytes", copied);
                Ok(RequestOutcome::bag(reply))
            }
            Route::SystemDiskUsage => {
                let used = crate::orchestrator::dir_size(&state.app_root)?;
                let disks = sysinfo::Disks::new_with_refreshed_list();
                let (total, available) = disks
                    .list()
                    .iter()
                    .map(|d| (d.total_space(), d.available_space()))
                    .max_by_key(|(total, _)| *total)
                    .unwrap_or((0, 0));
                let mut reply = MessageBag::new();
                reply.set_u64("appRootBytes", used);
                reply.set_u64("diskTotalBytes", total);
                reply.set_u64("diskAvailableBytes", available);
                Ok(RequestOutcome::bag(reply))
            }

            // ================================================================
            // Images and snapshots
            // ================================================================
            Route::ImageList => {
                let images = state.images.list().await?;
                let mut reply = MessageBag::new();
                reply.set_json("images", &images)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ImagePull => {
                let reference = bag.string("reference")?;
                let platform: Platform = bag.json("platform")?;
                let concurrency = if bag.contains("concurrency") {
                    bag.u64("concurrency")? as usize
                } else {
                    4
                };
                let image = state
                    .images
                    .pull(reference, &platform, None, concurrency, None)
                    .await?;
                let mut reply = MessageBag::new();
                reply.set_json("image", &image)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ImageTag => {
                let reference = bag.string("reference")?;
                let new_reference = bag.string("newReference")?;
                state.images.tag(reference, new_reference).await?;
                Ok(RequestOutcome::empty())
            }
            Route::ImageDelete => {
                let reference = bag.string("reference")?;
                state.images.delete(reference).await?;
                Ok(RequestOutcome::empty())
            }
            Route::SnapshotGet => {
                let reference = bag.string("reference")?;
                let platform: Platform = bag.json("platform")?;
                let filesystem = state
                    .images
                    .get_create_snapshot(reference, &platform)
                    .await?;
                let mut reply = MessageBag::new();
                reply.set_json("filesystem", &filesystem)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ImagePush | Route::ImageSave | Route::ImageLoad | Route::ImageUnpack
            | Route::SnapshotDelete => Err(Error::unsupported(format!(
                "route {:?} is served by the external image service",
                route
            ))),

            // ================================================================
            // Volumes
            // ================================================================
            Route::VolumeCreate => {
                let name = bag.string("name")?;
                let options: VolumeCreateOptions = if bag.contains("options") {
                    bag.json("options")?
                } else {
                    VolumeCreateOptions::default()
                };
                let volume = state.volumes.create(name, options)?;
                let mut reply = MessageBag::new();
                reply.set_json("volume", &volume)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::VolumeList => {
                let mut reply = MessageBag::new();
                reply.set_json("volumes", &state.volumes.list()?)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::VolumeInspect => {
                let name = bag.string("name")?;
                let mut reply = MessageBag::new();
                reply.set_json("volume", &state.volumes.inspect(name)?)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::VolumeDelete => {
                let name = bag.string("name")?;
                let in_use = state.orchestrator.volume_in_use(name);
                state.volumes.delete(name, in_use)?;
                Ok(RequestOutcome::empty())
            }

            // ================================================================
            // Networks
            // ================================================================
            Route::NetworkCreate => {
                let name = bag.string("name")?;
                let subnet = if bag.contains("subnet") {
                    bag.string("subnet")?.to_string()
                } else {
                    state.default_subnet.clone()
                };
                state.networks.create(name, &subnet)?;
                let mut reply = MessageBag::new();
                reply.set_json("network", &state.networks.inspect(name).await?)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::NetworkList => {
                let mut reply = MessageBag::new();
                reply.set_json("networks", &state.networks.list().await?)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::NetworkInspect => {
                let name = bag.string("name")?;
                let mut reply = MessageBag::new();
                reply.set_json("network", &state.networks.inspect(name).await?)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::NetworkDelete => {
                let name = bag.string("name")?;
                let in_use = state.orchestrator.network_in_use(name);
                state.networks.delete(name, in_use)?;
                debug!("network {} deleted", name);
                Ok(RequestOutcome::empty())
            }
        }
    }
}
