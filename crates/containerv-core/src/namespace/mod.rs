//! Linux namespace management for container isolation.
//!
//! A container's namespaces are owned by a small holder process created with
//! `clone(2)`; see [`holder`]. This module defines which namespaces to
//! request and how each one is named in `/proc` and by `nsenter(1)`.

pub mod holder;
pub mod user;
pub mod uts;

/// A single namespace type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    /// Mount table.
    Mount,
    /// Process IDs.
    Pid,
    /// Hostname and domain name.
    Uts,
    /// Network stack.
    Network,
    /// User and group IDs.
    User,
    /// System V IPC and POSIX message queues.
    Ipc,
}

impl NamespaceKind {
    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Pid => "pid",
            Self::Uts => "uts",
            Self::Network => "net",
            Self::User => "user",
            Self::Ipc => "ipc",
        }
    }

    /// Matching `nsenter(1)` option.
    #[must_use]
    pub const fn nsenter_flag(self) -> &'static str {
        match self {
            Self::Mount => "--mount",
            Self::Pid => "--pid",
            Self::Uts => "--uts",
            Self::Network => "--net",
            Self::User => "--user",
            Self::Ipc => "--ipc",
        }
    }
}

/// Which namespaces to create for a container.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFlags {
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Run unisolated instead of failing when namespaces cannot be created
    /// for lack of privilege.
    pub allow_unprivileged: bool,
}

impl Default for NamespaceFlags {
    fn default() -> Self {
        Self {
            mount: true,
            pid: true,
            uts: true,
            network: true,
            user: false,
            ipc: true,
            allow_unprivileged: false,
        }
    }
}

impl NamespaceFlags {
    /// Requests no namespaces at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            mount: false,
            pid: false,
            uts: false,
            network: false,
            user: false,
            ipc: false,
            allow_unprivileged: false,
        }
    }

    /// Namespaces requested, user first so the others are owned by it.
    #[must_use]
    pub fn kinds(&self) -> Vec<NamespaceKind> {
        [
            (self.user, NamespaceKind::User),
            (self.mount, NamespaceKind::Mount),
            (self.pid, NamespaceKind::Pid),
            (self.uts, NamespaceKind::Uts),
            (self.network, NamespaceKind::Network),
            (self.ipc, NamespaceKind::Ipc),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect()
    }

    /// Whether no namespace is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }

    /// Translates the request into `clone(2)` flags.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        self.kinds()
            .into_iter()
            .fold(CloneFlags::empty(), |acc, kind| {
                acc | match kind {
                    NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
                    NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
                    NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
                    NamespaceKind::Network => CloneFlags::CLONE_NEWNET,
                    NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
                    NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
                }
            })
    }
}

/// Whether the host exposes namespaces at all.
#[must_use]
pub fn namespaces_supported() -> bool {
    cfg!(target_os = "linux") && std::path::Path::new("/proc/self/ns/mnt").exists()
}
