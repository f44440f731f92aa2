//! Persistent volumes
//!
//! Each volume is a directory under `volumes/<name>/` holding its
//! `entity.json` record and a sparse `volume.img` block file. The image is
//! created at the declared size with no blocks allocated, so it grows with
//! use up to that size.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::validate_id;

/// Default block image size when the caller declares none: 1 GiB.
pub const DEFAULT_VOLUME_SIZE: u64 = 1 << 30;

/// One persistent volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub driver: String,
    /// Host path of the block image
    pub source: PathBuf,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub options: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub is_anonymous: bool,
    /// Declared maximum size of the block image
    pub size_in_bytes: u64,
}

/// Parameters for `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCreateOptions {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub options: std::collections::HashMap<String, String>,
}

/// Issues and tracks block-backed volumes under one root directory.
pub struct VolumeService {
    root: PathBuf,
}

impl VolumeService {
    pub fn open(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn entity_path(&self, name: &str) -> PathBuf {
        self.dir(name).join("entity.json")
    }

    /// Create a named volume. The block image is sparse: full declared
    /// length, no allocated blocks.
    pub fn create(&self, name: &str, options: VolumeCreateOptions) -> Result<Volume> {
        if !validate_id(name) {
            return Err(Error::invalid_argument(format!(
                "volume name {} is not valid",
                name
            )));
        }
        let dir = self.dir(name);
        if dir.exists() {
            return Err(Error::exists(format!("volume {} already exists", name)));
        }
        std::fs::create_dir_all(&dir)?;

        let unwind = scopeguard::guard(dir.clone(), |dir| {
            let _ = std::fs::remove_dir_all(dir);
        });

        let image_path = dir.join("volume.img");
        let size = options.size_in_bytes.unwrap_or(DEFAULT_VOLUME_SIZE);
        let image = std::fs::File::create(&image_path)?;
        image.set_len(size)?;

        let volume = Volume {
            name: name.to_string(),
            driver: options.driver.unwrap_or_else(|| "sparse".to_string()),
            source: image_path,
            labels: options.labels,
            options: options.options,
            is_anonymous: false,
            size_in_bytes: size,
        };
        self.persist(&volume)?;

        scopeguard::ScopeGuard::into_inner(unwind);
        info!("created volume {} ({} bytes)", name, size);
        Ok(volume)
    }

    /// Create an anonymous volume for a container; removed with it.
    pub fn create_anonymous(&self, options: VolumeCreateOptions) -> Result<Volume> {
        let name = Uuid::new_v4().simple().to_string();
        let mut volume = self.create(&name, options)?;
        volume.is_anonymous = true;
        self.persist(&volume)?;
        Ok(volume)
    }

    fn persist(&self, volume: &Volume) -> Result<()> {
        let json = serde_json::to_vec_pretty(volume)?;
        std::fs::write(self.entity_path(&volume.name), json)?;
        Ok(())
    }

    pub fn inspect(&self, name: &str) -> Result<Volume> {
        let path = self.entity_path(name);
        if !path.exists() {
            return Err(Error::not_found(format!("volume {} does not exist", name)));
        }
        let content = std::fs::read(&path)?;
        serde_json::from_slice(&content)
            .map_err(|e| Error::wrap(format!("corrupt volume record for {}", name), e))
    }

    pub fn list(&self) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.inspect(&name) {
                Ok(volume) => volumes.push(volume),
                Err(_) => continue,
            }
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    /// Delete a volume. `in_use` is the orchestrator's verdict on whether a
    /// container still mounts it.
    pub fn delete(&self, name: &str, in_use: bool) -> Result<()> {
        if in_use {
            return Err(Error::invalid_state(format!(
                "volume {} is mounted by an existing container",
                name
            )));
        }
        let dir = self.dir(name);
        if !dir.exists() {
            return Err(Error::not_found(format!("volume {} does not exist", name)));
        }
        std::fs::remove_dir_all(&dir)?;
        info!("deleted volume {}", name);
        Ok(())
    }

    /// Resolve a `volume` mount source to its block image path.
    pub fn source_for(&self, name: &str) -> Result<PathBuf> {
        Ok(self.inspect(name)?.source)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
