//! Package archive handles.
//!
//! A package layer arrives as an already-opened archive. The composer only
//! needs its name, a content digest, and a way to unpack it; the archive
//! codec stays behind [`PackageArchive`].

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use containerv_common::constants::UNPACK_COMPLETE_MARKER;
use containerv_common::error::{ContainervError, Result};
use containerv_common::types::Sha256Hash;

/// An opened package archive.
pub trait PackageArchive: Send + Sync + fmt::Debug {
    /// Package name used in logs.
    fn name(&self) -> &str;

    /// SHA-256 digest of the archive contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be read.
    fn digest(&self) -> Result<Sha256Hash>;

    /// Extracts the archive into `dir`, which already exists.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the archive cannot be decoded.
    fn unpack_to(&self, dir: &Path) -> Result<()>;
}

/// A `.tar` or gzip-compressed `.tar.gz` package on disk.
#[derive(Debug)]
pub struct TarPackage {
    path: PathBuf,
    name: String,
    digest: OnceLock<Sha256Hash>,
}

impl TarPackage {
    /// Opens the archive at `path`. The name defaults to the file stem.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `path` is not a file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(ContainervError::NotFound {
                kind: "package archive",
                id: path.display().to_string(),
            });
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .map(|n| {
                n.trim_end_matches(".gz")
                    .trim_end_matches(".tgz")
                    .trim_end_matches(".tar")
                    .to_string()
            })
            .unwrap_or_default();
        Ok(Self {
            path,
            name,
            digest: OnceLock::new(),
        })
    }

    /// Archive location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_gzip(&self) -> Result<bool> {
        let mut magic = [0u8; 2];
        let mut file = File::open(&self.path).map_err(|e| ContainervError::io(&self.path, e))?;
        match file.read_exact(&mut magic) {
            Ok(()) => Ok(magic == [0x1f, 0x8b]),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(ContainervError::io(&self.path, e)),
        }
    }

    fn corrupt(&self, e: &std::io::Error) -> ContainervError {
        ContainervError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

impl PackageArchive for TarPackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn digest(&self) -> Result<Sha256Hash> {
        if let Some(digest) = self.digest.get() {
            return Ok(digest.clone());
        }
        let digest = crate::hash::hash_file(&self.path)?;
        let _ = self.digest.set(digest.clone());
        Ok(digest)
    }

    fn unpack_to(&self, dir: &Path) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| ContainervError::io(&self.path, e))?;
        if self.is_gzip()? {
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
            archive.set_preserve_permissions(true);
            archive.unpack(dir).map_err(|e| self.corrupt(&e))?;
        } else {
            let mut archive = tar::Archive::new(file);
            archive.set_preserve_permissions(true);
            archive.unpack(dir).map_err(|e| self.corrupt(&e))?;
        }
        Ok(())
    }
}

/// Unpacks `package` into `cache_root/<digest>/tree` unless a previous
/// unpack already completed, and returns the tree path.
///
/// A marker file next to the tree records completion, so an interrupted
/// unpack is discarded and redone.
///
/// # Errors
///
/// Returns `Corrupt` for an undecodable archive, or an I/O error.
pub fn unpack_cached(package: &dyn PackageArchive, cache_root: &Path) -> Result<PathBuf> {
    let digest = package.digest()?;
    let entry = cache_root.join(digest.as_hex());
    let tree = entry.join("tree");
    let marker = entry.join(UNPACK_COMPLETE_MARKER);

    if marker.is_file() && tree.is_dir() {
        tracing::debug!(package = package.name(), %digest, "reusing unpacked package");
        return Ok(tree);
    }

    containerv_core::filesystem::tree::remove_tree(&entry)?;
    std::fs::create_dir_all(&tree).map_err(|e| ContainervError::io(&tree, e))?;
    if let Err(e) = package.unpack_to(&tree) {
        let _ = containerv_core::filesystem::tree::remove_tree(&entry);
        return Err(e);
    }
    std::fs::write(&marker, digest.as_hex()).map_err(|e| ContainervError::io(&marker, e))?;

    tracing::info!(package = package.name(), %digest, "package unpacked");
    Ok(tree)
}
