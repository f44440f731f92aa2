//! Scriptable VM backend for sandbox and orchestrator tests

use std::collections::HashMap;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::monitor::WaiterRegistry;
use crate::types::{ContainerStats, ExitStatus, ProcessConfiguration};

use super::traits::{
    GuestStdio, TerminalSize, VirtualMachine, VirtualMachineFactory, VmConfiguration,
};

#[derive(Default)]
pub struct FakeVmFactory {
    pub fail_build: AtomicBool,
    pub machines: Mutex<Vec<Arc<FakeVm>>>,
}

impl FakeVmFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_machine(&self) -> Option<Arc<FakeVm>> {
        self.machines.lock().last().cloned()
    }
}

#[async_trait]
impl VirtualMachineFactory for FakeVmFactory {
    async fn build(&self, config: VmConfiguration) -> Result<Arc<dyn VirtualMachine>> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(Error::internal("fake backend refused to build"));
        }
        let vm = Arc::new(FakeVm::new(config));
        self.machines.lock().push(Arc::clone(&vm));
        Ok(vm)
    }
}

struct FakeProcess {
    #[allow(dead_code)]
    config: Option<ProcessConfiguration>,
    stdout: Option<OwnedFd>,
    signals: Vec<i32>,
    resizes: Vec<TerminalSize>,
}

pub struct FakeVm {
    pub config: VmConfiguration,
    pub created: AtomicBool,
    pub powered_off: AtomicBool,
    /// Deliver 128+signal as the exit code when a signal arrives
    pub exit_on_signal: AtomicBool,
    processes: Mutex<HashMap<String, FakeProcess>>,
    exits: WaiterRegistry,
}

impl FakeVm {
    fn new(config: VmConfiguration) -> Self {
        Self {
            config,
            created: AtomicBool::new(false),
            powered_off: AtomicBool::new(false),
            exit_on_signal: AtomicBool::new(true),
            processes: Mutex::new(HashMap::new()),
            exits: WaiterRegistry::new(),
        }
    }

    /// Resolve a process's wait with `code`, as if the guest reported it.
    pub fn finish(&self, id: &str, code: i32) {
        self.exits.resolve(id, ExitStatus::new(code));
    }

    /// Write guest output into the stdout handle the sandbox passed for
    /// `id`.
    pub fn write_stdout(&self, id: &str, data: &[u8]) {
        let fd = self
            .processes
            .lock()
            .get_mut(id)
            .and_then(|p| p.stdout.take());
        if let Some(fd) = fd {
            let mut file = std::fs::File::from(fd);
            file.write_all(data).expect("fake stdout write");
            // Dropping the file closes the write end so readers see EOF.
        }
    }

    pub fn signals_for(&self, id: &str) -> Vec<i32> {
        self.processes
            .lock()
            .get(id)
            .map(|p| p.signals.clone())
            .unwrap_or_default()
    }

    pub fn resizes_for(&self, id: &str) -> Vec<TerminalSize> {
        self.processes
            .lock()
            .get(id)
            .map(|p| p.resizes.clone())
            .unwrap_or_default()
    }

    pub fn has_process(&self, id: &str) -> bool {
        self.processes.lock().contains_key(id)
    }
}

#[async_trait]
impl VirtualMachine for FakeVm {
    async fn create(&self) -> Result<()> {
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, id: &str, stdio: GuestStdio) -> Result<()> {
        self.processes.lock().insert(
            id.to_string(),
            FakeProcess {
                config: None,
                stdout: stdio.stdout,
                signals: Vec::new(),
                resizes: Vec::new(),
            },
        );
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        config: ProcessConfiguration,
        stdio: GuestStdio,
    ) -> Result<()> {
        self.processes.lock().insert(
            id.to_string(),
            FakeProcess {
                config: Some(config),
                stdout: stdio.stdout,
                signals: Vec::new(),
                resizes: Vec::new(),
            },
        );
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus> {
        Ok(self.exits.wait(id).await)
    }

    async fn kill(&self, id: &str, signal: i32) -> Result<()> {
        {
            let mut processes = self.processes.lock();
            let process = processes
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("no guest process {}", id)))?;
            process.signals.push(signal);
        }
        if self.exit_on_signal.load(Ordering::SeqCst) {
            self.exits.resolve(id, ExitStatus::new(128 + signal));
        }
        Ok(())
    }

    async fn resize(&self, id: &str, size: TerminalSize) -> Result<()> {
        let mut processes = self.processes.lock();
        let process = processes
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("no guest process {}", id)))?;
        process.resizes.push(size);
        Ok(())
    }

    async fn dial_vsock(&self, port: u32) -> Result<OwnedFd> {
        if port == 0 {
            return Err(Error::invalid_argument("vsock port must be nonzero"));
        }
        let (host, _guest) = std::os::unix::net::UnixStream::pair()
            .map_err(|e| Error::wrap("fake vsock pair", e))?;
        Ok(OwnedFd::from(host))
    }

    async fn stats(&self) -> Result<ContainerStats> {
        Ok(ContainerStats {
            memory_bytes: 42 << 20,
            memory_limit_bytes: self.config.memory_in_bytes,
            cpu_time_nanos: 1_000_000,
            networks: Vec::new(),
            uptime_millis: 1000,
        })
    }

    async fn stop(&self) -> Result<()> {
        self.powered_off.store(true, Ordering::SeqCst);
        Ok(())
    }
}
