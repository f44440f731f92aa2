//! On-disk container bundles
//!
//! `<root>/containers/<id>/` holds everything a container needs to be
//! re-bootstrapped: `config.json`, `options.json`, kernel bits, the cloned
//! rootfs, the init filesystem, and the two log files. A bundle exists iff
//! the orchestrator knows the container, so creation is atomic (staged
//! under a temporary name, then renamed) and deletion is the last step of
//! `delete`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::ContainerConfiguration;

/// Create-time options persisted next to the configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    #[serde(default)]
    pub auto_remove: bool,
}

/// One container's bundle directory.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: PathBuf,
}

impl Bundle {
    /// The bundle path for `id` under `containers_root`, whether or not it
    /// exists yet.
    pub fn at(containers_root: &Path, id: &str) -> Self {
        Self {
            root: containers_root.join(id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn options_path(&self) -> PathBuf {
        self.root.join("options.json")
    }

    pub fn kernel_dir(&self) -> PathBuf {
        self.root.join("kernel")
    }

    pub fn rootfs_path(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    pub fn initfs_path(&self) -> PathBuf {
        self.root.join("initfs")
    }

    pub fn stdio_log(&self) -> PathBuf {
        self.root.join("stdio.log")
    }

    pub fn boot_log(&self) -> PathBuf {
        self.root.join("boot.log")
    }

    /// The helper's control socket lives inside the bundle.
    pub fn control_socket(&self) -> PathBuf {
        self.root.join("control.sock")
    }

    /// Stage a new bundle: build the directory tree and records under a
    /// temporary name, run `populate` to fill the heavyweight artifacts,
    /// then rename into place. A failure at any step leaves nothing
    /// behind.
    pub fn create<F>(
        containers_root: &Path,
        config: &ContainerConfiguration,
        options: &CreateOptions,
        populate: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Bundle) -> Result<()>,
    {
        std::fs::create_dir_all(containers_root)?;
        let final_path = containers_root.join(&config.id);
        if final_path.exists() {
            return Err(Error::exists(format!(
                "bundle for {} already exists",
                config.id
            )));
        }

        let staging = Bundle {
            root: containers_root.join(format!(".staging-{}", config.id)),
        };
        if staging.root.exists() {
            std::fs::remove_dir_all(&staging.root)?;
        }
        std::fs::create_dir_all(&staging.root)?;

        let unwind = scopeguard::guard(staging.root.clone(), |path| {
            let _ = std::fs::remove_dir_all(path);
        });

        std::fs::write(
            staging.config_path(),
            serde_json::to_vec_pretty(config)?,
        )?;
        std::fs::write(
            staging.options_path(),
            serde_json::to_vec_pretty(options)?,
        )?;
        std::fs::create_dir_all(staging.kernel_dir())?;
        std::fs::write(staging.stdio_log(), b"")?;
        set_mode(&staging.stdio_log(), 0o644)?;
        std::fs::write(staging.boot_log(), b"")?;

        populate(&staging)?;

        std::fs::rename(&staging.root, &final_path)?;
        scopeguard::ScopeGuard::into_inner(unwind);
        debug!("created bundle {}", final_path.display());
        Ok(Self { root: final_path })
    }

    pub fn load_config(&self) -> Result<ContainerConfiguration> {
        let content = std::fs::read(self.config_path())?;
        serde_json::from_slice(&content)
            .map_err(|e| Error::wrap(format!("corrupt config in {}", self.root.display()), e))
    }

    pub fn load_options(&self) -> Result<CreateOptions> {
        let content = std::fs::read(self.options_path())?;
        serde_json::from_slice(&content)
            .map_err(|e| Error::wrap(format!("corrupt options in {}", self.root.display()), e))
    }

    /// Remove every artifact. Idempotent.
    pub fn delete(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
            debug!("deleted bundle {}", self.root.display());
        }
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Clone a filesystem snapshot into a bundle artifact. Block images are
/// copied (copy-on-write where the filesystem supports it); directory
/// snapshots are mirrored recursively.
pub fn clone_filesystem(source: &Path, destination: &Path) -> Result<()> {
    if source.is_dir() {
        copy_tree(source, destination)
    } else {
        std::fs::copy(source, destination).map_err(|e| {
            Error::wrap(
                format!(
                    "failed to clone {} to {}",
                    source.display(),
                    destination.display()
                ),
                e,
            )
        })?;
        Ok(())
    }
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{ImageDescriptor, Platform, ProcessConfiguration, User};

    pub(crate) fn test_config(id: &str) -> ContainerConfiguration {
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
                arguments: Vec::new(),
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
            networks: Vec::new(),
            dns: Default::default(),
            sysctls: Default::default(),
            runtime_handler: "vz".into(),
            virtualization: false,
            rosetta: false,
            ssh: false,
        }
    }

    #[test]
    fn test_create_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("c1");
        let bundle = Bundle::create(
            dir.path(),
            &config,
            &CreateOptions { auto_remove: true },
            |staging| {
                std::fs::write(staging.rootfs_path(), b"rootfs")?;
                std::fs::write(staging.initfs_path(), b"initfs")?;
                Ok(())
            },
        )
        .unwrap();

        assert!(bundle.exists());
        assert_eq!(bundle.load_config().unwrap().id, "c1");
        assert!(bundle.load_options().unwrap().auto_remove);
        assert!(bundle.stdio_log().exists());
        assert!(bundle.boot_log().exists());
        assert!(bundle.rootfs_path().exists());

        bundle.delete().unwrap();
        assert!(!bundle.exists());
        bundle.delete().unwrap(); // idempotent
    }

    #[test]
    fn test_failed_populate_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("c1");
        let err = Bundle::create(dir.path(), &config, &CreateOptions::default(), |_| {
            Err(Error::internal("no snapshot"))
        })
        .unwrap_err();
        assert!(err.is_kind(ErrorKind::Internal));

        // Neither the bundle nor the staging directory survives.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_duplicate_bundle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("c1");
        Bundle::create(dir.path(), &config, &CreateOptions::default(), |_| Ok(())).unwrap();
        let err =
            Bundle::create(dir.path(), &config, &CreateOptions::default(), |_| Ok(()))
                .unwrap_err();
        assert!(err.is_kind(ErrorKind::Exists));
    }

    #[test]
    fn test_clone_filesystem_block_and_tree() {
        let dir = tempfile::tempdir().unwrap();
        let block = dir.path().join("snap.img");
        std::fs::write(&block, b"image bytes").unwrap();
        clone_filesystem(&block, &dir.path().join("rootfs")).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("rootfs")).unwrap(),
            b"image bytes"
        );

        let tree = dir.path().join("initfs-src");
        std::fs::create_dir_all(tree.join("sbin")).unwrap();
        std::fs::write(tree.join("sbin/init"), b"#!/bin/true").unwrap();
        clone_filesystem(&tree, &dir.path().join("initfs")).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("initfs/sbin/init")).unwrap(),
            b"#!/bin/true"
        );
    }
}
