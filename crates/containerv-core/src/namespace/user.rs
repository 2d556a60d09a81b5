//! User namespace ID mapping.
//!
//! Maps container UIDs/GIDs to host IDs. The map itself is built by
//! [`crate::identity::UserMapper`]; this module renders and writes it.

use std::fmt::Write as _;

use containerv_common::error::{ContainervError, Result};

/// One `inside outside count` line of a uid or gid map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    /// First ID as seen inside the namespace.
    pub inside: u32,
    /// First ID on the host.
    pub outside: u32,
    /// Number of consecutive IDs mapped.
    pub count: u32,
}

/// UID and GID maps for a user namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    /// UID map lines.
    pub uid: Vec<IdMapEntry>,
    /// GID map lines.
    pub gid: Vec<IdMapEntry>,
}

impl IdMap {
    /// Renders entries in the `/proc/<pid>/uid_map` format.
    #[must_use]
    pub fn render(entries: &[IdMapEntry]) -> String {
        entries.iter().fold(String::new(), |mut out, e| {
            let _ = writeln!(out, "{} {} {}", e.inside, e.outside, e.count);
            out
        })
    }

    /// Host uid that appears as `inside` in the namespace, if mapped.
    #[must_use]
    pub fn host_uid(&self, inside: u32) -> Option<u32> {
        lookup(&self.uid, inside)
    }

    /// Host gid that appears as `inside` in the namespace, if mapped.
    #[must_use]
    pub fn host_gid(&self, inside: u32) -> Option<u32> {
        lookup(&self.gid, inside)
    }
}

fn lookup(entries: &[IdMapEntry], inside: u32) -> Option<u32> {
    entries.iter().find_map(|e| {
        let offset = inside.checked_sub(e.inside)?;
        (offset < e.count).then(|| e.outside + offset)
    })
}

/// Writes the UID/GID maps for the process `pid`.
///
/// `setgroups` is denied first when the writer is unprivileged, which the
/// kernel requires before an unprivileged `gid_map` write.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/uid_map`,
/// `/proc/<pid>/gid_map`, or `/proc/<pid>/setgroups` fails.
#[cfg(target_os = "linux")]
pub fn write_id_map(pid: u32, map: &IdMap) -> Result<()> {
    use std::fs;

    if !nix::unistd::geteuid().is_root() {
        let setgroups_path = format!("/proc/{pid}/setgroups");
        fs::write(&setgroups_path, "deny").map_err(|e| ContainervError::io(setgroups_path, e))?;
    }

    let uid_map_path = format!("/proc/{pid}/uid_map");
    fs::write(&uid_map_path, IdMap::render(&map.uid))
        .map_err(|e| ContainervError::io(uid_map_path, e))?;

    let gid_map_path = format!("/proc/{pid}/gid_map");
    fs::write(&gid_map_path, IdMap::render(&map.gid))
        .map_err(|e| ContainervError::io(gid_map_path, e))?;

    tracing::debug!(pid, uid_lines = map.uid.len(), gid_lines = map.gid.len(), "wrote UID/GID map");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, UID/GID mapping requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn write_id_map(_pid: u32, _map: &IdMap) -> Result<()> {
    Err(ContainervError::not_supported("user namespaces require Linux"))
}
