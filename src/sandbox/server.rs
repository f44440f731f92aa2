//! Control surface of one sandbox helper
//!
//! Maps control-channel routes onto the sandbox state machine. Passed file
//! handles are addressed by index through the bag's `fileHandle` values.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::{MessageBag, RequestHandler, RequestOutcome, Route};
use crate::types::ProcessConfiguration;

use super::sandbox::{Sandbox, SandboxStdio, StopOptions};

pub struct SandboxServer {
    sandbox: Arc<Sandbox>,
}

impl SandboxServer {
    pub fn new(sandbox: Arc<Sandbox>) -> Arc<Self> {
        Arc::new(Self { sandbox })
    }

    fn take_stdio(bag: &MessageBag, fds: &mut [Option<OwnedFd>]) -> Result<SandboxStdio> {
        let mut take = |key: &str| -> Result<Option<OwnedFd>> {
            match bag.opt_handle(key)? {
                Some(index) => {
                    let slot = fds.get_mut(index).ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "{} refers to missing descriptor {}",
                            key, index
                        ))
                    })?;
                    slot.take().ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "{} reuses descriptor {}",
                            key, index
                        ))
                    })
                    .map(Some)
                }
                None => Ok(None),
            }
        };
        Ok(SandboxStdio {
            stdin: take("stdin")?,
            stdout: take("stdout")?,
            stderr: take("stderr")?,
        })
    }
}

#[async_trait]
impl RequestHandler for SandboxServer {
    async fn handle(
        &self,
        route: Route,
        bag: MessageBag,
        fds: Vec<OwnedFd>,
    ) -> Result<RequestOutcome> {
        let mut fds: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();

        match route {
            Route::ContainerBootstrap => {
                let stdio = Self::take_stdio(&bag, &mut fds)?;
                let attachments = self.sandbox.bootstrap(stdio).await?;
                let mut reply = MessageBag::new();
                reply.set_json("attachments", &attachments)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerStartProcess => {
                let id = bag.string("processId")?;
                let attachments = self.sandbox.start_process(id).await?;
                let mut reply = MessageBag::new();
                reply.set_json("attachments", &attachments)?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerCreateProcess => {
                let id = bag.string("processId")?;
                let config: ProcessConfiguration = bag.json("config")?;
                let stdio = Self::take_stdio(&bag, &mut fds)?;
                self.sandbox.create_process(id, config, stdio).await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerKill => {
                let id = bag.string("processId")?;
                let signal = bag.i64("signal")? as i32;
                self.sandbox.kill(id, signal).await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerResize => {
                let id = bag.string("processId")?;
                let columns = bag.u64("columns")? as u16;
                let rows = bag.u64("rows")? as u16;
                self.sandbox.resize(id, columns, rows).await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerDial => {
                let port = bag.u64("port")? as u32;
                let stream = self.sandbox.dial(port).await?;
                let mut reply = MessageBag::new();
                reply.set_handle("stream", 0);
                Ok(RequestOutcome::with_fds(reply, vec![stream]))
            }
            Route::ContainerWait => {
                let id = bag.string("processId")?;
                let status = self.sandbox.wait(id).await?;
                let mut reply = MessageBag::new();
                reply.set_i64("code", status.code as i64);
                reply.set_string("exitedAt", status.exited_at.to_rfc3339());
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerStop => {
                let mut options = StopOptions::default();
                if bag.contains("signal") {
                    options.signal = bag.i64("signal")? as i32;
                }
                if bag.contains("timeoutSeconds") {
                    options.timeout =
                        std::time::Duration::from_secs(bag.u64("timeoutSeconds")?);
                }
                self.sandbox.stop(options).await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerShutdown => {
                self.sandbox.shutdown().await?;
                Ok(RequestOutcome::empty())
            }
            Route::ContainerState => {
                let mut reply = MessageBag::new();
                reply.set_json("snapshot", &self.sandbox.snapshot())?;
                Ok(RequestOutcome::bag(reply))
            }
            Route::ContainerLogs => {
                let (stdio_log, boot_log) = self.sandbox.logs()?;
                let mut reply = MessageBag::new();
                reply.set_handle("stdio", 0);
                reply.set_handle("boot", 1);
                Ok(RequestOutcome::with_fds(reply, vec![stdio_log, boot_log]))
            }
            Route::ContainerStats => {
                let stats = self.sandbox.stats().await?;
                let mut reply = MessageBag::new();
                reply.set_json("stats", &stats)?;
                Ok(RequestOutcome::bag(reply))
            }
            other => Err(Error::unsupported(format!(
                "route {:?} is not served by sandbox helpers",
                other
            ))),
        }
    }
}
