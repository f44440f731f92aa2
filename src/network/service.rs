//! Named-network registry

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

use super::driver::{NetworkDriver, NetworkState, SubnetDriver};

/// Wire-visible description of one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDescription {
    pub name: String,
    pub state: NetworkState,
}

/// Directory of named networks backed by `networks/<name>/` state dirs.
pub struct NetworkService {
    root: PathBuf,
    drivers: DashMap<String, Arc<dyn NetworkDriver>>,
}

impl NetworkService {
    /// Open the registry, reattaching every network already on disk and
    /// guaranteeing the default network exists.
    pub fn open(root: PathBuf, default_name: &str, default_subnet: &str) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let service = Self {
            root,
            drivers: DashMap::new(),
        };

        for entry in std::fs::read_dir(&service.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let state_path = entry.path().join("state.json");
            if !state_path.exists() {
                continue;
            }
            let content = std::fs::read(&state_path)?;
            let subnet = serde_json::from_slice::<serde_json::Value>(&content)
                .ok()
                .and_then(|v| v["subnet"].as_str().map(String::from));
            if let Some(subnet) = subnet {
                let driver = SubnetDriver::open(&name, &subnet, &entry.path())?;
                service.drivers.insert(name, Arc::new(driver));
            }
        }

        if !service.drivers.contains_key(default_name) {
            service.create(default_name, default_subnet)?;
        }
        Ok(service)
    }

    pub fn create(&self, name: &str, subnet: &str) -> Result<Arc<dyn NetworkDriver>> {
        if self.drivers.contains_key(name) {
            return Err(Error::exists(format!("network {} already exists", name)));
        }
        let dir = self.root.join(name);
        let driver: Arc<dyn NetworkDriver> = Arc::new(SubnetDriver::open(name, subnet, &dir)?);
        self.drivers.insert(name.to_string(), Arc::clone(&driver));
        info!("created network {} ({})", name, subnet);
        Ok(driver)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn NetworkDriver>> {
        self.drivers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::not_found(format!("network {} does not exist", name)))
    }

    pub fn delete(&self, name: &str, in_use: bool) -> Result<()> {
        if in_use {
            return Err(Error::invalid_state(format!(
                "network {} is attached to existing containers",
                name
            )));
        }
        if self.drivers.remove(name).is_none() {
            return Err(Error::not_found(format!("network {} does not exist", name)));
        }
        let dir = self.root.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!("deleted network {}", name);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<NetworkDescription>> {
        let drivers: Vec<(String, Arc<dyn NetworkDriver>)> = self
            .drivers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut descriptions = Vec::new();
        for (name, driver) in drivers {
            descriptions.push(NetworkDescription {
                name,
                state: driver.state().await?,
            });
        }
        descriptions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptions)
    }

    pub async fn inspect(&self, name: &str) -> Result<NetworkDescription> {
        let driver = self.get(name)?;
        Ok(NetworkDescription {
            name: name.to_string(),
            state: driver.state().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_default_network_created_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            NetworkService::open(dir.path().to_path_buf(), "default", "192.168.64.0/24").unwrap();
        let listed = service.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "default");
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            NetworkService::open(dir.path().to_path_buf(), "default", "192.168.64.0/24").unwrap();
        let err = service.create("default", "10.0.0.0/24").unwrap_err();
        assert!(err.is_kind(ErrorKind::Exists));
    }

    #[tokio::test]
    async fn test_networks_reattach_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let service =
                NetworkService::open(dir.path().to_path_buf(), "default", "192.168.64.0/24")
                    .unwrap();
            service.create("backend", "10.2.0.0/24").unwrap();
        }
        let reopened =
            NetworkService::open(dir.path().to_path_buf(), "default", "192.168.64.0/24").unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 2);
        reopened.get("backend").unwrap();
    }

    #[tokio::test]
    async fn test_delete_in_use_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service =
            NetworkService::open(dir.path().to_path_buf(), "default", "192.168.64.0/24").unwrap();
        service.create("backend", "10.2.0.0/24").unwrap();

        let err = service.delete("backend", true).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidState));

        service.delete("backend", false).unwrap();
        assert!(service.get("backend").is_err());
    }
}
