//! Host service manager
//!
//! Sandbox helpers are registered with the host's service manager under
//! labels of the form `<prefix>.<runtime-handler>.<id>`. The launchd
//! adapter lives outside this crate; the in-tree implementation spawns
//! detached helper processes and persists registration records so a
//! restarted daemon can enumerate and deregister them by prefix.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Environment variable carrying the registered label into the helper.
pub const ENV_SERVICE_LABEL: &str = "HARBOR_SERVICE_LABEL";

#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Register and launch `executable args` under `label`.
    async fn register(
        &self,
        label: &str,
        executable: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<()>;

    /// Stop and remove the registration for `label`. Idempotent.
    async fn deregister(&self, label: &str) -> Result<()>;

    /// Labels currently registered under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    label: String,
    executable: PathBuf,
    args: Vec<String>,
    pid: u32,
}

/// Spawns helpers as detached child processes, one per label.
pub struct ProcessServiceManager {
    root: PathBuf,
}

impl ProcessServiceManager {
    pub fn open(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn record_path(&self, label: &str) -> PathBuf {
        self.root.join(format!("{}.json", label))
    }

    fn load(&self, label: &str) -> Result<Registration> {
        let content = std::fs::read(self.record_path(label))?;
        serde_json::from_slice(&content)
            .map_err(|e| Error::wrap(format!("corrupt service record for {}", label), e))
    }

    fn alive(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

#[async_trait]
impl ServiceManager for ProcessServiceManager {
    async fn register(
        &self,
        label: &str,
        executable: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<()> {
        if self.record_path(label).exists() {
            let existing = self.load(label)?;
            if Self::alive(existing.pid) {
                return Err(Error::exists(format!(
                    "service {} is already registered (pid {})",
                    label, existing.pid
                )));
            }
            debug!("replacing stale registration for {}", label);
        }

        let mut command = tokio::process::Command::new(executable);
        command
            .args(args)
            .env(ENV_SERVICE_LABEL, label)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(false);
        for (key, value) in env {
            command.env(key, value);
        }
        let child = command
            .spawn()
            .map_err(|e| Error::wrap(format!("failed to spawn helper for {}", label), e))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::internal(format!("helper for {} exited at spawn", label)))?;

        let record = Registration {
            label: label.to_string(),
            executable: executable.to_path_buf(),
            args: args.to_vec(),
            pid,
        };
        std::fs::write(self.record_path(label), serde_json::to_vec_pretty(&record)?)?;
        info!("registered service {} (pid {})", label, pid);
        Ok(())
    }

    async fn deregister(&self, label: &str) -> Result<()> {
        let path = self.record_path(label);
        if !path.exists() {
            return Ok(());
        }
        match self.load(label) {
            Ok(record) => {
                if Self::alive(record.pid) {
                    if let Err(e) = kill(Pid::from_raw(record.pid as i32), Signal::SIGTERM) {
                        warn!("failed to signal {} (pid {}): {}", label, record.pid, e);
                    }
                }
            }
            Err(e) => warn!("dropping unreadable record for {}: {}", label, e),
        }
        std::fs::remove_file(&path)?;
        info!("deregistered service {}", label);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut labels = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(label) = name.strip_suffix(".json") else {
                continue;
            };
            if label.starts_with(prefix) {
                labels.push(label.to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records registrations without spawning anything.
    #[derive(Default)]
    pub struct RecordingServiceManager {
        pub registered: Mutex<HashMap<String, (PathBuf, Vec<String>)>>,
    }

    #[async_trait]
    impl ServiceManager for RecordingServiceManager {
        async fn register(
            &self,
            label: &str,
            executable: &Path,
            args: &[String],
            _env: &[(String, String)],
        ) -> Result<()> {
            let mut registered = self.registered.lock();
            if registered.contains_key(label) {
                return Err(Error::exists(format!("service {} already registered", label)));
            }
            registered.insert(
                label.to_string(),
                (executable.to_path_buf(), args.to_vec()),
            );
            Ok(())
        }

        async fn deregister(&self, label: &str) -> Result<()> {
            self.registered.lock().remove(label);
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            let mut labels: Vec<String> = self
                .registered
                .lock()
                .keys()
                .filter(|label| label.starts_with(prefix))
                .cloned()
                .collect();
            labels.sort();
            Ok(labels)
        }
    }
}
