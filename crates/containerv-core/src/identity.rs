//! Caller identity and user-namespace mapping.
//!
//! A daemon usually runs as root on behalf of an unprivileged caller. The
//! [`UserMapper`] keeps both identities: the effective one owns the
//! namespace (mapped to root inside it) and the real one owns whatever the
//! container leaves on disk.

use std::path::Path;

use containerv_common::error::Result;

use crate::namespace::user::{IdMap, IdMapEntry};

/// A user name with its uid and primary gid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Login name, or the numeric uid when the passwd entry is missing.
    pub name: String,
    /// User ID.
    pub uid: u32,
    /// Primary group ID.
    pub gid: u32,
}

impl Identity {
    /// Whether this is the superuser.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Real and effective identity of the calling process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMapper {
    real: Identity,
    effective: Identity,
}

impl UserMapper {
    /// Captures the current process identities.
    ///
    /// When the real uid is root and `SUDO_UID`/`SUDO_GID` are set, the
    /// invoking user behind `sudo` is taken as the real identity.
    #[cfg(unix)]
    #[must_use]
    pub fn new() -> Self {
        use nix::unistd::{getegid, geteuid, getgid, getuid};

        let mut real = (getuid().as_raw(), getgid().as_raw());
        if real.0 == 0 {
            if let Some(sudo) = sudo_identity() {
                real = sudo;
            }
        }
        let mapper = Self {
            real: lookup(real.0, real.1),
            effective: lookup(geteuid().as_raw(), getegid().as_raw()),
        };
        tracing::debug!(
            real = %mapper.real.name,
            effective = %mapper.effective.name,
            "captured caller identity"
        );
        mapper
    }

    /// Identity of a process without uid semantics.
    #[cfg(not(unix))]
    #[must_use]
    pub fn new() -> Self {
        let nobody = Identity {
            name: "nobody".into(),
            uid: 0,
            gid: 0,
        };
        Self::from_parts(nobody.clone(), nobody)
    }

    /// Builds a mapper from explicit identities.
    #[must_use]
    pub const fn from_parts(real: Identity, effective: Identity) -> Self {
        Self { real, effective }
    }

    /// The caller's identity.
    #[must_use]
    pub const fn real(&self) -> &Identity {
        &self.real
    }

    /// The identity the process currently acts as.
    #[must_use]
    pub const fn effective(&self) -> &Identity {
        &self.effective
    }

    /// Whether the effective identity differs from the caller's.
    #[must_use]
    pub fn is_elevated(&self) -> bool {
        self.real.uid != self.effective.uid || self.real.gid != self.effective.gid
    }

    /// Builds the uid/gid map for a new user namespace.
    ///
    /// The effective identity becomes root inside. When the process is
    /// privileged and acting for someone else, the caller's ids are also
    /// mapped to themselves so files they own stay owned by them.
    #[must_use]
    pub fn id_map(&self) -> IdMap {
        let single = |inside, outside| IdMapEntry {
            inside,
            outside,
            count: 1,
        };
        let mut map = IdMap {
            uid: vec![single(0, self.effective.uid)],
            gid: vec![single(0, self.effective.gid)],
        };
        if self.effective.is_root() {
            if self.real.uid != self.effective.uid {
                map.uid.push(single(self.real.uid, self.real.uid));
            }
            if self.real.gid != self.effective.gid {
                map.gid.push(single(self.real.gid, self.real.gid));
            }
        }
        map
    }

    /// Re-owns every entry under `root` to the real identity.
    ///
    /// Does nothing unless the process is elevated and able to `chown`.
    /// Symlinks are re-owned themselves, never followed. Returns the number
    /// of entries changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be walked or an entry cannot be
    /// re-owned.
    #[cfg(unix)]
    pub fn fix_ownership(&self, root: &Path) -> Result<usize> {
        use std::os::unix::fs::MetadataExt;

        use containerv_common::error::ContainervError;

        if !self.is_elevated() || !self.effective.is_root() {
            return Ok(0);
        }
        let (uid, gid) = (self.real.uid, self.real.gid);
        let mut changed = 0;
        crate::filesystem::tree::walk(root, |path, meta| {
            if meta.uid() != uid || meta.gid() != gid {
                std::os::unix::fs::lchown(path, Some(uid), Some(gid))
                    .map_err(|e| ContainervError::io(path, e))?;
                changed += 1;
            }
            Ok(())
        })?;
        tracing::debug!(root = %root.display(), changed, owner = %self.real.name, "ownership fixed");
        Ok(changed)
    }

    /// Ownership is not adjusted on this platform.
    ///
    /// # Errors
    ///
    /// Never fails.
    #[cfg(not(unix))]
    pub fn fix_ownership(&self, _root: &Path) -> Result<usize> {
        Ok(0)
    }

    /// Releases the captured identity.
    pub fn delete(self) {
        tracing::trace!(real = %self.real.name, "identity released");
    }
}

impl Default for UserMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn sudo_identity() -> Option<(u32, u32)> {
    let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = std::env::var("SUDO_GID").ok()?.parse().ok()?;
    Some((uid, gid))
}

#[cfg(unix)]
fn lookup(uid: u32, gid: u32) -> Identity {
    use nix::unistd::{Uid, User};

    let name = User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map_or_else(|| uid.to_string(), |u| u.name);
    Identity { name, uid, gid }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str, uid: u32, gid: u32) -> Identity {
        Identity {
            name: name.into(),
            uid,
            gid,
        }
    }

    #[test]
    fn unprivileged_caller_maps_to_root_only() {
        let alice = id("alice", 1000, 1000);
        let mapper = UserMapper::from_parts(alice.clone(), alice);
        let map = mapper.id_map();
        assert_eq!(IdMap::render(&map.uid), "0 1000 1\n");
        assert_eq!(IdMap::render(&map.gid), "0 1000 1\n");
        assert!(!mapper.is_elevated());
    }

    #[test]
    fn sudo_caller_keeps_own_ids() {
        let mapper = UserMapper::from_parts(id("alice", 1000, 1000), id("root", 0, 0));
        let map = mapper.id_map();
        assert_eq!(map.host_uid(0), Some(0));
        assert_eq!(map.host_uid(1000), Some(1000));
        assert_eq!(map.host_gid(1000), Some(1000));
        assert!(mapper.is_elevated());
    }

    #[test]
    fn fix_ownership_is_noop_when_not_elevated() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("f"), b"x").expect("write");
        let alice = id("alice", 1000, 1000);
        let mapper = UserMapper::from_parts(alice.clone(), alice);
        assert_eq!(mapper.fix_ownership(dir.path()).expect("fix"), 0);
    }

    #[cfg(unix)]
    #[test]
    fn current_process_identity_is_captured() {
        let mapper = UserMapper::new();
        assert!(!mapper.effective().name.is_empty());
        assert_eq!(
            mapper.effective().uid,
            nix::unistd::geteuid().as_raw()
        );
    }
}
