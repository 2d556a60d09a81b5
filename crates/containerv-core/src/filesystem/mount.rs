//! Mount utilities for container filesystem setup.
//!
//! Host-side mounts made while composing a rootfs go through the
//! [`Mounter`] trait so the composer can record them and teardown can
//! reverse them exactly. [`MountTable`] is that record.

use std::fmt;
use std::path::{Path, PathBuf};

use containerv_common::error::{ContainervError, Result};

use super::overlayfs::OverlayConfig;

/// Kind of mount recorded in a [`MountTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Bind mount of a single source directory.
    Bind {
        /// Whether the bind was remounted read-only.
        readonly: bool,
    },
    /// `OverlayFS` mount over one or more lower directories.
    Overlay,
}

/// A mount created on behalf of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Mount point.
    pub target: PathBuf,
    /// What was mounted there.
    pub kind: MountKind,
}

/// Mount operations used while composing a rootfs.
pub trait Mounter: Send + Sync + fmt::Debug {
    /// Bind-mounts `source` onto `target`, optionally read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount syscall fails.
    fn bind(&self, source: &Path, target: &Path, readonly: bool) -> Result<()>;

    /// Mounts an overlay described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount syscall fails.
    fn overlay(&self, config: &OverlayConfig) -> Result<()>;

    /// Detaches whatever is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount syscall fails.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Ordered record of the mounts a container owns.
#[derive(Debug, Default)]
pub struct MountTable {
    records: Vec<MountRecord>,
}

impl MountTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Records a mount that has just succeeded.
    pub fn push(&mut self, target: impl Into<PathBuf>, kind: MountKind) {
        self.records.push(MountRecord {
            target: target.into(),
            kind,
        });
    }

    /// Mount records in creation order.
    #[must_use]
    pub fn records(&self) -> &[MountRecord] {
        &self.records
    }

    /// Number of recorded mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no mounts are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Unmounts every record in reverse creation order and clears the table.
    ///
    /// A failing unmount is logged and skipped so the remaining mounts are
    /// still released. Returns how many unmounts failed.
    pub fn unwind(&mut self, mounter: &dyn Mounter) -> usize {
        let mut failures = 0;
        while let Some(record) = self.records.pop() {
            if let Err(e) = mounter.unmount(&record.target) {
                failures += 1;
                tracing::warn!(
                    mount_point = %record.target.display(),
                    error = %e,
                    "unmount failed during teardown"
                );
            }
        }
        failures
    }
}

/// [`Mounter`] backed by the real mount syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysMounter;

#[cfg(target_os = "linux")]
impl Mounter for SysMounter {
    fn bind(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        use nix::mount::{MsFlags, mount};

        std::fs::create_dir_all(target).map_err(|e| ContainervError::io(target, e))?;
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| ContainervError::from_errno("bind mount", e))?;

        if readonly {
            let remount = mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            );
            if let Err(e) = remount {
                let _ = self.unmount(target);
                return Err(ContainervError::from_errno("read-only remount", e));
            }
        }
        tracing::debug!(
            source = %source.display(),
            mount_point = %target.display(),
            readonly,
            "bind mount created"
        );
        Ok(())
    }

    fn overlay(&self, config: &OverlayConfig) -> Result<()> {
        super::overlayfs::mount_overlay(config)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH)
            .map_err(|e| ContainervError::from_errno("unmount", e))?;
        tracing::debug!(mount_point = %target.display(), "unmounted");
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for SysMounter {
    fn bind(&self, _source: &Path, _target: &Path, _readonly: bool) -> Result<()> {
        Err(ContainervError::not_supported("bind mounts require Linux"))
    }

    fn overlay(&self, _config: &OverlayConfig) -> Result<()> {
        Err(ContainervError::not_supported("OverlayFS requires Linux"))
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Err(ContainervError::not_supported("unmount requires Linux"))
    }
}

/// Whether this process can create host-side mounts.
#[must_use]
pub fn can_mount() -> bool {
    #[cfg(target_os = "linux")]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mount points at or below `root`, in the order `/proc/self/mountinfo`
/// lists them. `root` should be canonical; mountinfo paths are. A host
/// without procfs reports none.
///
/// # Errors
///
/// Returns an error if mountinfo exists but cannot be read.
pub fn mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    let info = match std::fs::read_to_string(MOUNTINFO) {
        Ok(info) => info,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ContainervError::io(MOUNTINFO, e)),
    };
    Ok(mount_points(&info)
        .into_iter()
        .filter(|point| point.starts_with(root))
        .collect())
}

/// Detaches every mount at or below `root`, newest first, so a tree left
/// behind by a crashed run can be deleted without reaching into whatever
/// was mounted inside it.
///
/// # Errors
///
/// Returns `Internal` if any mount stays attached, or the error of reading
/// mountinfo.
pub fn detach_all_under(root: &Path, mounter: &dyn Mounter) -> Result<()> {
    let root = match std::fs::canonicalize(root) {
        Ok(root) => root,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ContainervError::io(root, e)),
    };
    let points = mounts_under(&root)?;
    let mut failures = 0;
    for point in points.iter().rev() {
        match mounter.unmount(point) {
            Ok(()) => tracing::info!(mount_point = %point.display(), "detached leftover mount"),
            Err(e) => {
                failures += 1;
                tracing::warn!(mount_point = %point.display(), error = %e, "leftover mount stays attached");
            }
        }
    }
    if failures > 0 {
        return Err(ContainervError::internal(format!(
            "{failures} mounts still attached under {}",
            root.display()
        )));
    }
    Ok(())
}

/// Mount point column of each mountinfo line.
fn mount_points(info: &str) -> Vec<PathBuf> {
    info.lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Undoes the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 1..pos + 4)
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        if let Some(byte) = code {
            out.push(char::from(byte));
            rest = &rest[pos + 4..];
        } else {
            out.push('\\');
            rest = &rest[pos + 1..];
        }
    }
    out.push_str(rest);
    out
}

/// Makes every mount in the current mount namespace private, recursively,
/// so nothing done afterwards propagates back to the host.
///
/// # Errors
///
/// Returns an error if the remount fails.
#[cfg(target_os = "linux")]
pub fn make_rprivate() -> std::result::Result<(), nix::errno::Errno> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}

/// Mounts a fresh `proc` at `/proc` of the current root.
///
/// # Errors
///
/// Returns an error if the mount fails.
#[cfg(target_os = "linux")]
pub fn mount_proc() -> std::result::Result<(), nix::errno::Errno> {
    use nix::mount::{MsFlags, mount};

    let _ = std::fs::create_dir("/proc");
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        unmounted: Mutex<Vec<PathBuf>>,
        fail_on: Option<PathBuf>,
    }

    impl Mounter for Recorder {
        fn bind(&self, _source: &Path, _target: &Path, _readonly: bool) -> Result<()> {
            Ok(())
        }

        fn overlay(&self, _config: &OverlayConfig) -> Result<()> {
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.unmounted.lock().unwrap().push(target.to_path_buf());
            if self.fail_on.as_deref() == Some(target) {
                return Err(ContainervError::internal("busy"));
            }
            Ok(())
        }
    }

    #[test]
    fn unwind_releases_in_reverse_order() {
        let mut table = MountTable::new();
        table.push("/s/rootfs", MountKind::Overlay);
        table.push("/s/rootfs/opt", MountKind::Bind { readonly: true });
        table.push("/s/rootfs/var", MountKind::Overlay);

        let recorder = Recorder::default();
        assert_eq!(table.unwind(&recorder), 0);
        assert!(table.is_empty());
        assert_eq!(
            *recorder.unmounted.lock().unwrap(),
            vec![
                PathBuf::from("/s/rootfs/var"),
                PathBuf::from("/s/rootfs/opt"),
                PathBuf::from("/s/rootfs"),
            ]
        );
    }

    #[test]
    fn mountinfo_columns_are_unescaped() {
        let info = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
97 22 0:45 / /var/lib/my\\040stage/rootfs rw - overlay overlay rw,lowerdir=/a
98 97 8:1 /srv /var/lib/my\\040stage/rootfs/srv ro - ext4 /dev/sda1 rw
";
        assert_eq!(
            mount_points(info),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/var/lib/my stage/rootfs"),
                PathBuf::from("/var/lib/my stage/rootfs/srv"),
            ]
        );
        assert_eq!(unescape("a\\134b"), "a\\b");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }

    #[test]
    fn detaching_an_unmounted_tree_touches_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::default();
        detach_all_under(dir.path(), &recorder).expect("nothing mounted");
        detach_all_under(&dir.path().join("missing"), &recorder).expect("missing tree");
        assert!(recorder.unmounted.lock().unwrap().is_empty());
    }

    #[test]
    fn unwind_continues_past_failures() {
        let mut table = MountTable::new();
        table.push("/a", MountKind::Overlay);
        table.push("/b", MountKind::Overlay);
        let recorder = Recorder {
            fail_on: Some(PathBuf::from("/b")),
            ..Recorder::default()
        };

        assert_eq!(table.unwind(&recorder), 1);
        assert_eq!(recorder.unmounted.lock().unwrap().len(), 2);
        assert!(table.is_empty());
    }
}
