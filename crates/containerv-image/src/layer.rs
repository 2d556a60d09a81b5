//! Filesystem layers and layer-set validation.
//!
//! Layers are ordered bottom to top: a later layer shadows an earlier one at
//! identical paths. Each layer lands at a target path inside the rootfs.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use containerv_common::constants::MAX_LAYERS;
use containerv_common::error::{ContainervError, Result};
use containerv_core::filesystem::tree;

use crate::package::PackageArchive;

/// A single host file or directory copied into a `Files` layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Source on the host.
    pub host: PathBuf,
    /// Destination relative to the layer target.
    pub dest: PathBuf,
}

/// Where a layer's content comes from.
#[derive(Debug, Clone)]
pub enum LayerSource {
    /// A host directory.
    Directory(PathBuf),
    /// An already-opened package archive.
    Package(Arc<dyn PackageArchive>),
    /// A raw list of host paths and their destinations.
    Files(Vec<FileEntry>),
    /// Partition or image content: an unpacked image root on the namespace
    /// backend, a virtual disk on the VM backend.
    Image(PathBuf),
}

impl LayerSource {
    /// Short name of the source kind for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Directory(_) => "directory",
            Self::Package(_) => "package",
            Self::Files(_) => "files",
            Self::Image(_) => "image",
        }
    }
}

/// One entry of a container's layer list.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Layer content.
    pub source: LayerSource,
    /// Absolute path inside the rootfs where the content lands.
    pub target: PathBuf,
    /// Whether container writes at `target` go to this layer.
    pub writable: bool,
}

impl Layer {
    /// A read-only layer at the rootfs root.
    #[must_use]
    pub fn new(source: LayerSource) -> Self {
        Self {
            source,
            target: PathBuf::from("/"),
            writable: false,
        }
    }

    /// Places the layer at `target` instead of `/`.
    #[must_use]
    pub fn at(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = target.into();
        self
    }

    /// Marks the layer writable.
    #[must_use]
    pub const fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
}

/// Normalizes an absolute in-rootfs path to a relative one (`/` becomes
/// the empty path).
///
/// # Errors
///
/// Returns `InvalidSpec` for a relative path or one containing `..`.
pub fn normalize_target(target: &Path) -> Result<PathBuf> {
    if !target.has_root() {
        return Err(ContainervError::invalid(format!(
            "layer target must be absolute: {}",
            target.display()
        )));
    }
    relative_inside(target, "layer target")
}

/// Normalizes a destination that must stay inside its parent.
///
/// # Errors
///
/// Returns `InvalidSpec` if the path contains `..`.
pub fn relative_inside(path: &Path, what: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ContainervError::invalid(format!(
                    "{what} escapes its root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Checks a layer list before anything is mounted or copied.
///
/// Rejects empty or oversized lists, bad targets, more than one writable
/// layer, a writable layer that is not a directory or shares its target,
/// and `Image` content mixed with a `Files` list at the same target.
///
/// # Errors
///
/// Returns `InvalidSpec` describing the first conflict found.
pub fn validate_layers(layers: &[Layer]) -> Result<()> {
    if layers.is_empty() {
        return Err(ContainervError::invalid("layer list is empty"));
    }
    if layers.len() > MAX_LAYERS {
        return Err(ContainervError::invalid(format!(
            "too many layers: {} (max {MAX_LAYERS})",
            layers.len()
        )));
    }

    let mut images = HashSet::new();
    let mut files = HashSet::new();
    let mut writable = None;
    for layer in layers {
        let target = normalize_target(&layer.target)?;
        match &layer.source {
            LayerSource::Image(_) => {
                let _ = images.insert(target.clone());
            }
            LayerSource::Files(entries) => {
                for entry in entries {
                    let _ = relative_inside(&entry.dest, "file destination")?;
                }
                let _ = files.insert(target.clone());
            }
            LayerSource::Directory(_) | LayerSource::Package(_) => {}
        }
        if layer.writable {
            if writable.is_some() {
                return Err(ContainervError::invalid("more than one writable layer"));
            }
            if !matches!(layer.source, LayerSource::Directory(_)) {
                return Err(ContainervError::invalid(format!(
                    "writable layer must be a directory, got {}",
                    layer.source.kind()
                )));
            }
            writable = Some(target);
        }
    }

    if let Some(target) = images.intersection(&files).next() {
        return Err(ContainervError::invalid(format!(
            "image content and a file list share target /{}",
            target.display()
        )));
    }
    if let Some(target) = writable {
        let sharing = layers
            .iter()
            .filter(|l| normalize_target(&l.target).is_ok_and(|t| t == target))
            .count();
        if sharing > 1 {
            return Err(ContainervError::invalid(format!(
                "writable layer must be the only layer at /{}",
                target.display()
            )));
        }
    }
    Ok(())
}

/// Copies a file list into `dir`, each entry at its destination relative to
/// `dir`. A destination of `/` keeps the host file name.
///
/// # Errors
///
/// Returns `NotFound` for a missing host file, `InvalidSpec` for an escaping
/// destination, or the failing copy's I/O error.
pub fn materialize_files(entries: &[FileEntry], dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| ContainervError::io(dir, e))?;
    for entry in entries {
        let meta = std::fs::symlink_metadata(&entry.host).map_err(|_| ContainervError::NotFound {
            kind: "layer file",
            id: entry.host.display().to_string(),
        })?;
        let mut dest = dir.join(relative_inside(&entry.dest, "file destination")?);
        if meta.is_dir() {
            let _ = tree::copy_merge(&entry.host, &dest)?;
            continue;
        }
        if dest == dir {
            if let Some(name) = entry.host.file_name() {
                dest = dir.join(name);
            }
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ContainervError::io(parent, e))?;
        }
        let _ = std::fs::copy(&entry.host, &dest).map_err(|e| ContainervError::io(&entry.host, e))?;
    }
    Ok(())
}
