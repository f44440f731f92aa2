//! Image store collaborator
//!
//! The OCI content store, registry codecs, and unpacker live outside this
//! crate. The orchestrator consumes them through `ImageStore`: list known
//! images, resolve references, pull, and materialize per-platform rootfs
//! snapshots for cloning into bundles. The in-tree `LocalImageStore` serves
//! snapshots already materialized under `images/`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Platform;

/// Content descriptor for one image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// One image known to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub reference: String,
    pub descriptor: Descriptor,
}

/// A materialized filesystem snapshot, ready to clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filesystem {
    pub path: PathBuf,
    pub format: FilesystemFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemFormat {
    /// A single block image file
    Block,
    /// An on-disk directory tree
    Directory,
}

/// Registry credentials, opaque to this crate.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Progress callback for pulls: (bytes done, bytes total if known).
pub type PullProgress = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Image>>;

    async fn get(&self, reference: &str) -> Result<Image>;

    async fn pull(
        &self,
        reference: &str,
        platform: &Platform,
        auth: Option<RegistryAuth>,
        concurrency: usize,
        progress: Option<PullProgress>,
    ) -> Result<Image>;

    /// Materialize (or reuse) the unpacked snapshot for `reference` on
    /// `platform` and return a filesystem ready to clone.
    async fn get_create_snapshot(&self, reference: &str, platform: &Platform)
        -> Result<Filesystem>;

    async fn delete(&self, reference: &str) -> Result<()>;

    async fn tag(&self, reference: &str, new_reference: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    #[serde(default)]
    images: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    reference: String,
    descriptor: Descriptor,
    /// platform string → snapshot path relative to the image root
    #[serde(default)]
    snapshots: std::collections::HashMap<String, String>,
}

/// Store over a pre-populated `images/` directory. Pulling is the registry
/// collaborator's job and reports `Unsupported` here.
pub struct LocalImageStore {
    root: PathBuf,
    index: parking_lot::RwLock<Index>,
}

impl LocalImageStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let content = std::fs::read(&index_path)?;
            serde_json::from_slice(&content)
                .map_err(|e| Error::wrap("corrupt image index", e))?
        } else {
            Index::default()
        };
        Ok(Self {
            root,
            index: parking_lot::RwLock::new(index),
        })
    }

    fn persist(&self, index: &Index) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)?;
        std::fs::write(self.root.join("index.json"), json)?;
        Ok(())
    }

    fn entry(&self, reference: &str) -> Result<IndexEntry> {
        self.index
            .read()
            .images
            .iter()
            .find(|entry| entry.reference == reference)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("image {} is not in the store", reference)))
    }

    /// Register a snapshot that an external unpacker materialized; test
    /// fixtures use this too.
    pub fn insert(
        &self,
        reference: &str,
        descriptor: Descriptor,
        platform: &Platform,
        snapshot_relative: &str,
    ) -> Result<()> {
        let mut index = self.index.write();
        let platform_key = platform.to_string();
        match index
            .images
            .iter_mut()
            .find(|entry| entry.reference == reference)
        {
            Some(entry) => {
                entry.descriptor = descriptor;
                entry
                    .snapshots
                    .insert(platform_key, snapshot_relative.to_string());
            }
            None => {
                let mut snapshots = std::collections::HashMap::new();
                snapshots.insert(platform_key, snapshot_relative.to_string());
                index.images.push(IndexEntry {
                    reference: reference.to_string(),
                    descriptor,
                    snapshots,
                });
            }
        }
        self.persist(&index)
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn list(&self) -> Result<Vec<Image>> {
        Ok(self
            .index
            .read()
            .images
            .iter()
            .map(|entry| Image {
                reference: entry.reference.clone(),
                descriptor: entry.descriptor.clone(),
            })
            .collect())
    }

    async fn get(&self, reference: &str) -> Result<Image> {
        let entry = self.entry(reference)?;
        Ok(Image {
            reference: entry.reference,
            descriptor: entry.descriptor,
        })
    }

    async fn pull(
        &self,
        reference: &str,
        _platform: &Platform,
        _auth: Option<RegistryAuth>,
        _concurrency: usize,
        _progress: Option<PullProgress>,
    ) -> Result<Image> {
        Err(Error::unsupported(format!(
            "pulling {} requires the registry service",
            reference
        )))
    }

    async fn get_create_snapshot(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> Result<Filesystem> {
        let entry = self.entry(reference)?;
        let relative = entry.snapshots.get(&platform.to_string()).ok_or_else(|| {
            Error::not_found(format!(
                "image {} has no snapshot for {}",
                reference, platform
            ))
        })?;
        let path = self.root.join(relative);
        if !path.exists() {
            return Err(Error::not_found(format!(
                "snapshot for {} is missing at {}",
                reference,
                path.display()
            )));
        }
        let format = if path.is_dir() {
            FilesystemFormat::Directory
        } else {
            FilesystemFormat::Block
        };
        Ok(Filesystem { path, format })
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let mut index = self.index.write();
        let before = index.images.len();
        index.images.retain(|entry| entry.reference != reference);
        if index.images.len() == before {
            return Err(Error::not_found(format!(
                "image {} is not in the store",
                reference
            )));
        }
        self.persist(&index)
    }

    async fn tag(&self, reference: &str, new_reference: &str) -> Result<()> {
        let entry = self.entry(reference)?;
        let mut index = self.index.write();
        if index.images.iter().any(|e| e.reference == new_reference) {
            return Err(Error::exists(format!("image {} already exists", new_reference)));
        }
        index.images.push(IndexEntry {
            reference: new_reference.to_string(),
            ..entry
        });
        self.persist(&index)
    }
}
