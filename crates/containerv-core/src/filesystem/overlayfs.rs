//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks read-only lower layers, optionally under a single writable upper
//! layer, so later layers shadow earlier ones without copying.

use std::path::PathBuf;

use containerv_common::error::{ContainervError, Result};

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers, bottom to top.
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer and its work directory; `None` mounts read-only.
    pub upper: Option<OverlayUpper>,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

/// Writable half of an overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayUpper {
    /// Writable upper directory.
    pub upper_dir: PathBuf,
    /// Work directory on the same filesystem as `upper_dir`.
    pub work_dir: PathBuf,
}

impl OverlayConfig {
    /// Renders the mount data string.
    ///
    /// The kernel expects `lowerdir` top-most first, so the bottom-to-top
    /// order held here is reversed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` if there are no lower layers, if a read-only
    /// overlay has fewer than two, or if a path contains `:` or `,`.
    pub fn mount_options(&self) -> Result<String> {
        if self.lower_dirs.is_empty() {
            return Err(ContainervError::invalid("overlay needs at least one lower layer"));
        }
        if self.upper.is_none() && self.lower_dirs.len() < 2 {
            return Err(ContainervError::invalid(
                "read-only overlay needs at least two lower layers",
            ));
        }
        let mut lowers = Vec::with_capacity(self.lower_dirs.len());
        for dir in self.lower_dirs.iter().rev() {
            lowers.push(option_path(dir)?);
        }
        let mut opts = format!("lowerdir={}", lowers.join(":"));
        if let Some(upper) = &self.upper {
            opts.push_str(&format!(
                ",upperdir={},workdir={}",
                option_path(&upper.upper_dir)?,
                option_path(&upper.work_dir)?
            ));
        }
        Ok(opts)
    }
}

fn option_path(path: &std::path::Path) -> Result<String> {
    let s = path.display().to_string();
    if s.contains(':') || s.contains(',') {
        return Err(ContainervError::invalid(format!(
            "overlay path contains a reserved character: {s}"
        )));
    }
    Ok(s)
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// Creates the upper, work, and merged directories if they do not exist,
/// then issues the `mount(2)` syscall with overlay-specific options.
///
/// # Errors
///
/// Returns an error if directory creation fails or if the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let opts = config.mount_options()?;
    if let Some(upper) = &config.upper {
        for dir in [&upper.upper_dir, &upper.work_dir] {
            std::fs::create_dir_all(dir).map_err(|e| ContainervError::io(dir, e))?;
        }
    }
    std::fs::create_dir_all(&config.merged_dir)
        .map_err(|e| ContainervError::io(&config.merged_dir, e))?;

    let flags = if config.upper.is_some() {
        MsFlags::empty()
    } else {
        MsFlags::MS_RDONLY
    };
    mount(
        Some("overlay"),
        config.merged_dir.as_path(),
        Some("overlay"),
        flags,
        Some(opts.as_str()),
    )
    .map_err(|e| ContainervError::from_errno("overlay mount", e))?;

    tracing::info!(
        merged = %config.merged_dir.display(),
        layers = config.lower_dirs.len(),
        "overlayfs mounted"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_config: &OverlayConfig) -> Result<()> {
    Err(ContainervError::not_supported("OverlayFS requires Linux"))
}
