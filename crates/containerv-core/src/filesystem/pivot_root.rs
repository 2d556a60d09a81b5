//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

/// Switches the root filesystem of the current mount namespace to `new_root`.
///
/// `new_root` is bind-mounted onto itself first so it is a mount point, then
/// pivoted with the `pivot_root(".", ".")` form; the old root ends up stacked
/// under the new one and is lazily detached. Must run inside a private mount
/// namespace.
///
/// Returns the raw errno so it can be reported from a cloned child without
/// allocating.
///
/// # Errors
///
/// Returns the errno of the first failing step.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> std::result::Result<(), nix::errno::Errno> {
    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::unistd::chdir;

    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    chdir(new_root)?;
    nix::unistd::pivot_root(".", ".")?;
    umount2(".", MntFlags::MNT_DETACH)?;
    chdir("/")?;
    Ok(())
}
