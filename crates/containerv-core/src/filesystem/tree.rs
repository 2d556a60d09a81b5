//! Worklist-based directory tree operations.
//!
//! Layer trees can nest arbitrarily deep, so every traversal here keeps an
//! explicit stack instead of recursing.

use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use containerv_common::error::{ContainervError, Result};

use super::mount;

/// Entry counts and byte totals for a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Regular files.
    pub files: u64,
    /// Directories, including the root.
    pub dirs: u64,
    /// Symbolic links.
    pub symlinks: u64,
    /// Sum of regular file sizes.
    pub bytes: u64,
}

/// Visits every entry under `root` (root included) without following
/// symlinks. Entries vanishing mid-walk are skipped.
///
/// # Errors
///
/// Returns an error if a directory cannot be listed or the visitor fails.
pub fn walk<F>(root: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(&Path, &Metadata) -> Result<()>,
{
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(ContainervError::io(path, e)),
        };
        visit(&path, &meta)?;
        if meta.is_dir() {
            for entry in fs::read_dir(&path).map_err(|e| ContainervError::io(&path, e))? {
                let entry = entry.map_err(|e| ContainervError::io(&path, e))?;
                stack.push(entry.path());
            }
        }
    }
    Ok(())
}

/// Collects [`TreeStats`] for the tree at `root`.
///
/// # Errors
///
/// Returns an error if any directory cannot be listed.
pub fn tree_stats(root: &Path) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    walk(root, |_, meta| {
        let ft = meta.file_type();
        if ft.is_dir() {
            stats.dirs += 1;
        } else if ft.is_symlink() {
            stats.symlinks += 1;
        } else if ft.is_file() {
            stats.files += 1;
            stats.bytes += meta.len();
        }
        Ok(())
    })?;
    Ok(stats)
}

/// Removes `root` and everything beneath it. A missing root is not an error.
///
/// Symlinks are removed, never followed. The removal stays on `root`'s
/// own mount: an entry that is a mount point, or lives on another device,
/// stops it before anything under that entry is touched.
///
/// # Errors
///
/// Returns `Internal` when the tree reaches across a mount point, or an
/// I/O error if an entry cannot be removed.
pub fn remove_tree(root: &Path) -> Result<()> {
    let root = match anchored(root) {
        Ok(root) => root,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ContainervError::io(root, e)),
    };
    let root_meta = match fs::symlink_metadata(&root) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ContainervError::io(root, e)),
    };
    let device = device_of(&root_meta);
    let mount_points: Vec<PathBuf> = if root_meta.is_dir() {
        mount::mounts_under(&root)?
            .into_iter()
            .filter(|point| *point != root)
            .collect()
    } else {
        Vec::new()
    };

    // (path, children already pushed)
    let mut stack: Vec<(PathBuf, bool)> = vec![(root, false)];
    while let Some((path, expanded)) = stack.pop() {
        if expanded {
            match fs::remove_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ContainervError::io(path, e)),
            }
            continue;
        }
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(ContainervError::io(path, e)),
        };
        if device_of(&meta) != device || mount_points.contains(&path) {
            return Err(ContainervError::internal(format!(
                "refusing to remove across mount point {}",
                path.display()
            )));
        }
        if meta.is_dir() {
            let entries = fs::read_dir(&path).map_err(|e| ContainervError::io(&path, e))?;
            stack.push((path.clone(), true));
            for entry in entries {
                let entry = entry.map_err(|e| ContainervError::io(&path, e))?;
                stack.push((entry.path(), false));
            }
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ContainervError::io(path, e)),
            }
        }
    }
    Ok(())
}

/// `path` with its parent resolved, so it matches mountinfo without
/// following a symlink at `path` itself.
fn anchored(path: &Path) -> std::io::Result<PathBuf> {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            Ok(fs::canonicalize(parent)?.join(name))
        }
        _ => fs::canonicalize(path),
    }
}

#[cfg(unix)]
fn device_of(meta: &Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::dev(meta)
}

#[cfg(not(unix))]
const fn device_of(_meta: &Metadata) -> u64 {
    0
}

/// Merges the tree at `src` into `dst` with overlay semantics.
///
/// Directories merge recursively; files and symlinks in `src` replace
/// whatever sits at the same path in `dst`, including whole directories.
/// Special files (devices, fifos, sockets) are skipped.
///
/// # Errors
///
/// Returns `NotFound` if `src` does not exist, or an I/O error if copying
/// fails.
pub fn copy_merge(src: &Path, dst: &Path) -> Result<TreeStats> {
    let root_meta = fs::symlink_metadata(src).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ContainervError::NotFound {
                kind: "layer source",
                id: src.display().to_string(),
            }
        } else {
            ContainervError::io(src, e)
        }
    })?;
    let mut stats = TreeStats::default();
    if !root_meta.is_dir() {
        replace_with(src, dst, &root_meta, &mut stats)?;
        return Ok(stats);
    }

    // Directory modes are applied last so read-only source dirs stay writable
    // while their children are copied in.
    let mut deferred = Vec::new();
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        ensure_dir(&to)?;
        stats.dirs += 1;
        for entry in fs::read_dir(&from).map_err(|e| ContainervError::io(&from, e))? {
            let entry = entry.map_err(|e| ContainervError::io(&from, e))?;
            let child_src = entry.path();
            let child_dst = to.join(entry.file_name());
            let meta =
                fs::symlink_metadata(&child_src).map_err(|e| ContainervError::io(&child_src, e))?;
            if meta.is_dir() {
                stack.push((child_src, child_dst));
            } else {
                replace_with(&child_src, &child_dst, &meta, &mut stats)?;
            }
        }
        let perms = fs::metadata(&from)
            .map_err(|e| ContainervError::io(&from, e))?
            .permissions();
        deferred.push((to, perms));
    }
    for (path, perms) in deferred.into_iter().rev() {
        fs::set_permissions(&path, perms).map_err(|e| ContainervError::io(&path, e))?;
    }
    Ok(stats)
}

/// Makes `path` a directory, replacing a file or symlink sitting there.
fn ensure_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => return Ok(()),
        Ok(_) => fs::remove_file(path).map_err(|e| ContainervError::io(path, e))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(ContainervError::io(path, e)),
    }
    fs::create_dir_all(path).map_err(|e| ContainervError::io(path, e))
}

/// Replaces whatever is at `dst` with the non-directory entry at `src`.
fn replace_with(src: &Path, dst: &Path, meta: &Metadata, stats: &mut TreeStats) -> Result<()> {
    let ft = meta.file_type();
    if !ft.is_file() && !ft.is_symlink() {
        tracing::debug!(path = %src.display(), "skipping special file");
        return Ok(());
    }
    match fs::symlink_metadata(dst) {
        Ok(existing) if existing.is_dir() => remove_tree(dst)?,
        Ok(_) => fs::remove_file(dst).map_err(|e| ContainervError::io(dst, e))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(ContainervError::io(dst, e)),
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| ContainervError::io(parent, e))?;
    }
    if ft.is_symlink() {
        copy_symlink(src, dst)?;
        stats.symlinks += 1;
    } else {
        stats.bytes += fs::copy(src, dst).map_err(|e| ContainervError::io(dst, e))?;
        stats.files += 1;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).map_err(|e| ContainervError::io(src, e))?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| ContainervError::io(dst, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let _ = fs::copy(src, dst).map_err(|e| ContainervError::io(dst, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn copy_merge_later_file_replaces_earlier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("base");
        let top = dir.path().join("top");
        let out = dir.path().join("out");
        write(&base.join("etc/os-release"), "base");
        write(&base.join("etc/hosts"), "127.0.0.1");
        write(&top.join("etc/os-release"), "top");

        let _ = copy_merge(&base, &out).expect("merge base");
        let _ = copy_merge(&top, &out).expect("merge top");

        assert_eq!(fs::read_to_string(out.join("etc/os-release")).unwrap(), "top");
        assert_eq!(fs::read_to_string(out.join("etc/hosts")).unwrap(), "127.0.0.1");
    }

    #[test]
    fn copy_merge_file_replaces_directory_wholesale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("base");
        let top = dir.path().join("top");
        let out = dir.path().join("out");
        write(&base.join("opt/app/bin/run"), "x");
        write(&top.join("opt/app"), "now a file");

        let _ = copy_merge(&base, &out).expect("merge base");
        let _ = copy_merge(&top, &out).expect("merge top");

        let meta = fs::symlink_metadata(out.join("opt/app")).unwrap();
        assert!(meta.is_file());
    }

    #[test]
    fn copy_merge_missing_source_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = copy_merge(&dir.path().join("nope"), &dir.path().join("out"));
        assert!(matches!(result, Err(ContainervError::NotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn copy_merge_preserves_symlinks_without_following() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("base");
        let out = dir.path().join("out");
        fs::create_dir_all(&base).unwrap();
        std::os::unix::fs::symlink("/does/not/exist", base.join("dangling")).unwrap();

        let stats = copy_merge(&base, &out).expect("merge");
        assert_eq!(stats.symlinks, 1);
        assert_eq!(
            fs::read_link(out.join("dangling")).unwrap(),
            Path::new("/does/not/exist")
        );
    }

    #[test]
    fn remove_tree_handles_deep_nesting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("deep");
        let mut p = root.clone();
        for i in 0..200 {
            p = p.join(format!("d{i}"));
        }
        write(&p.join("leaf"), "x");

        remove_tree(&root).expect("remove");
        assert!(!root.exists());
        remove_tree(&root).expect("missing root is fine");
    }

    #[cfg(unix)]
    #[test]
    fn remove_tree_deletes_a_symlink_not_its_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("real");
        write(&real.join("keep"), "x");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        remove_tree(&link).expect("remove link");
        assert!(fs::symlink_metadata(&link).is_err());
        assert!(real.join("keep").is_file());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn remove_tree_stops_at_a_mount_point() {
        use crate::filesystem::mount::{Mounter, SysMounter, can_mount};

        if !can_mount() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let precious = dir.path().join("precious");
        write(&precious.join("data"), "host data");
        let root = dir.path().join("area");
        let point = root.join("rootfs/out");
        write(&root.join("scratch"), "x");
        SysMounter.bind(&precious, &point, false).expect("bind");

        let result = remove_tree(&root);
        SysMounter.unmount(&point).expect("unmount");

        assert!(matches!(result, Err(ContainervError::Internal { .. })));
        assert_eq!(fs::read_to_string(precious.join("data")).unwrap(), "host data");
        remove_tree(&root).expect("remove once unmounted");
        assert!(!root.exists());
    }

    #[test]
    fn tree_stats_counts_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(&dir.path().join("a/one"), "12345");
        write(&dir.path().join("a/b/two"), "67");

        let stats = tree_stats(dir.path()).expect("stats");
        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 3);
        assert_eq!(stats.bytes, 7);
    }
}
