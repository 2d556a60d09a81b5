//! On-disk staging layout.
//!
//! ```text
//! <staging root>/
//!   packages/<sha256>/tree            unpacked package, shared by digest
//!   packages/<sha256>/.containerv-unpacked
//!   containers/<id>/rootfs            composed view
//!   containers/<id>/upper/<n>         overlay upper per target
//!   containers/<id>/work/<n>          overlay work dir per target
//!   containers/<id>/layers/<n>        materialized file lists
//!   vm/<id>/                          VM disk chain
//! ```
//!
//! A container's directory belongs to it alone until teardown removes it.

use std::path::{Path, PathBuf};

use containerv_common::error::{ContainervError, Result};
use containerv_common::types::ContainerId;
use containerv_core::filesystem::mount::{self, SysMounter};
use containerv_core::filesystem::tree;

/// Root of all staging data.
#[derive(Debug, Clone)]
pub struct StagingRoot {
    root: PathBuf,
}

impl StagingRoot {
    /// Opens or initializes the staging root.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ContainervError::io(&root, e))?;
        tracing::debug!(path = %root.display(), "staging root opened");
        Ok(Self { root })
    }

    /// Returns the root staging path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared cache of unpacked packages.
    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Directory holding a container's namespace-backend staging.
    #[must_use]
    pub fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join("containers").join(id.as_str())
    }

    /// Directory holding a container's VM disk chain.
    #[must_use]
    pub fn vm_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join("vm").join(id.as_str())
    }

    /// Creates a fresh staging area for `id`, discarding leftovers from an
    /// earlier run under the same id. Mounts still attached inside the old
    /// tree are detached before anything is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if a leftover mount stays attached, the old tree
    /// cannot be removed, or the new one cannot be created.
    pub fn create_area(&self, id: &ContainerId) -> Result<StagingArea> {
        let dir = self.container_dir(id);
        if dir.exists() {
            tracing::warn!(%id, path = %dir.display(), "removing stale staging area");
            mount::detach_all_under(&dir, &SysMounter)?;
            tree::remove_tree(&dir)?;
        }
        let area = StagingArea { root: dir };
        let rootfs = area.rootfs();
        std::fs::create_dir_all(&rootfs).map_err(|e| ContainervError::io(&rootfs, e))?;
        Ok(area)
    }
}

/// One container's staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Wraps an existing staging directory.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Staging directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where the composed rootfs appears.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    /// Overlay upper directory for the `n`th target.
    #[must_use]
    pub fn upper(&self, n: usize) -> PathBuf {
        self.root.join("upper").join(n.to_string())
    }

    /// Overlay work directory for the `n`th target.
    #[must_use]
    pub fn work(&self, n: usize) -> PathBuf {
        self.root.join("work").join(n.to_string())
    }

    /// Materialization directory for the `n`th layer.
    #[must_use]
    pub fn layer_dir(&self, n: usize) -> PathBuf {
        self.root.join("layers").join(n.to_string())
    }

    /// Whether the staging directory still exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Deletes the staging directory. Removing a missing area succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be removed.
    pub fn remove(&self) -> Result<()> {
        tree::remove_tree(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_open_returns_correct_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staging = StagingRoot::open(dir.path().join("staging")).expect("open");
        assert!(staging.root().is_dir());
    }

    #[test]
    fn area_layout_is_per_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staging = StagingRoot::open(dir.path()).expect("open");
        let area = staging.create_area(&ContainerId::new("c1")).expect("area");

        assert!(area.rootfs().is_dir());
        assert!(area.path().ends_with("containers/c1"));
        assert!(area.upper(2).ends_with("containers/c1/upper/2"));
        assert!(staging.vm_dir(&ContainerId::new("c1")).ends_with("vm/c1"));
    }

    #[test]
    fn create_area_discards_leftovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staging = StagingRoot::open(dir.path()).expect("open");
        let id = ContainerId::new("c1");
        let area = staging.create_area(&id).expect("area");
        std::fs::write(area.rootfs().join("stale"), b"x").expect("write");

        let area = staging.create_area(&id).expect("recreate");
        assert!(!area.rootfs().join("stale").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staging = StagingRoot::open(dir.path()).expect("open");
        let area = staging.create_area(&ContainerId::new("c1")).expect("area");
        area.remove().expect("remove");
        area.remove().expect("remove again");
        assert!(!area.exists());
    }
}
