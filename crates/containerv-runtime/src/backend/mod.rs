//! Isolation backends and host capability detection.
//!
//! A process uses exactly one backend, chosen once from [`Capabilities`]:
//! Linux namespaces when the kernel has them, otherwise a VM booted from a
//! virtual-disk chain when `qemu-img` and a hypervisor are installed.

pub mod namespace;
pub mod vm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use containerv_common::config::ContainervConfig;
use containerv_common::error::{ContainervError, Result};
use containerv_common::types::{BackendKind, ContainerId};
use containerv_core::filesystem::mount;
use containerv_core::identity::UserMapper;
use containerv_core::namespace::namespaces_supported;
use containerv_image::compose::{Composer, Strategy};
use containerv_image::storage::StagingRoot;
use containerv_policy::{PolicyEngine, PolicyStatus};
use serde::{Deserialize, Serialize};

use crate::container::ContainerSpec;
use crate::spawn::{SpawnOutcome, SpawnRequest};

pub use self::namespace::{NamespaceBackend, NamespaceInstance};
pub use self::vm::{VmDiskBackend, VmInstance};

/// What this host can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Linux namespaces are available.
    pub namespaces: bool,
    /// The process may bind and overlay mount.
    pub overlay_mounts: bool,
    /// `qemu-img` is installed.
    pub disk_tool: bool,
    /// A QEMU system emulator is installed.
    pub hypervisor: bool,
    /// Policy enforcement status.
    pub policy: PolicyStatus,
}

impl Capabilities {
    /// Inspects the host. `policy` is the engine the manager will use.
    #[must_use]
    pub fn detect(policy: &PolicyEngine) -> Self {
        let caps = Self {
            namespaces: namespaces_supported(),
            overlay_mounts: mount::can_mount(),
            disk_tool: vm::disk::QemuImg::locate().is_ok(),
            hypervisor: vm::hypervisor::Qemu::locate().is_ok(),
            policy: policy.status(),
        };
        tracing::debug!(?caps, "host capabilities");
        caps
    }

    /// Backend these capabilities support, namespaces first.
    #[must_use]
    pub const fn backend_kind(&self) -> Option<BackendKind> {
        if self.namespaces {
            Some(BackendKind::Namespace)
        } else if self.disk_tool && self.hypervisor {
            Some(BackendKind::VmDisk)
        } else {
            None
        }
    }
}

/// Host description for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Host operating system name.
    pub os: String,
    /// Host CPU architecture.
    pub arch: String,
    /// Detected capabilities.
    pub capabilities: Capabilities,
    /// Backend a manager would select.
    pub backend: Option<BackendKind>,
}

/// Describes the current platform.
#[must_use]
pub fn platform_info(policy: &PolicyEngine) -> PlatformInfo {
    let capabilities = Capabilities::detect(policy);
    PlatformInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        backend: capabilities.backend_kind(),
        capabilities,
    }
}

/// The backend selected for this process.
#[derive(Debug)]
pub enum Backend {
    /// Namespaces over a composed rootfs.
    Namespace(NamespaceBackend),
    /// A VM per container.
    VmDisk(VmDiskBackend),
}

impl Backend {
    /// Builds the backend `caps` supports, configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if the host supports no backend, or the error
    /// of opening the staging root.
    pub fn select(config: &ContainervConfig, caps: &Capabilities) -> Result<Self> {
        let kind = caps.backend_kind().ok_or_else(|| {
            ContainervError::not_supported(
                "no isolation backend: namespaces unavailable and qemu-img or qemu missing",
            )
        })?;
        let staging = StagingRoot::open(&config.staging_dir)?;
        let backend = match kind {
            BackendKind::Namespace => {
                let identity = UserMapper::new();
                let composer = Composer::new(Strategy::select(config.composition), staging)
                    .with_identity(identity.clone());
                Self::Namespace(NamespaceBackend::new(composer, identity))
            }
            BackendKind::VmDisk => {
                let preparer = vm::disk::WinVmPreparer::new(
                    staging,
                    Arc::new(vm::disk::QemuImg::locate()?),
                )
                .with_base_disk(config.vm.base_disk.clone());
                Self::VmDisk(VmDiskBackend::new(
                    preparer,
                    Arc::new(vm::hypervisor::Qemu::locate()?),
                    config.vm.clone(),
                ))
            }
        };
        tracing::info!(backend = %kind, staging = %config.staging_dir.display(), "backend selected");
        Ok(backend)
    }

    /// Kind of this backend.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Namespace(_) => BackendKind::Namespace,
            Self::VmDisk(_) => BackendKind::VmDisk,
        }
    }

    /// Builds the filesystem view and isolation boundary for `id`. On error
    /// nothing is left behind.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error.
    pub fn create(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<Instance> {
        match self {
            Self::Namespace(backend) => backend.create(id, spec).map(Instance::Namespace),
            Self::VmDisk(backend) => backend.create(id, spec).map(Instance::VmDisk),
        }
    }
}

/// Resources one container holds on its backend.
///
/// Teardown is split into stages so the manager can interleave policy
/// cleanup; each stage is idempotent.
#[derive(Debug)]
pub enum Instance {
    /// Namespace-backed container.
    Namespace(NamespaceInstance),
    /// VM-backed container.
    VmDisk(VmInstance),
}

impl Instance {
    /// Backend kind.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Namespace(_) => BackendKind::Namespace,
            Self::VmDisk(_) => BackendKind::VmDisk,
        }
    }

    /// Root of the container's view.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        match self {
            Self::Namespace(inst) => inst.rootfs(),
            Self::VmDisk(inst) => inst.rootfs(),
        }
    }

    /// Pid of the namespace holder, when the container is isolated.
    #[must_use]
    pub fn holder_pid(&self) -> Option<u32> {
        match self {
            Self::Namespace(inst) => inst.handle().holder_pid(),
            Self::VmDisk(_) => None,
        }
    }

    /// Runs a command in the container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a malformed request or the spawn failure.
    pub fn spawn(&mut self, request: &SpawnRequest) -> Result<SpawnOutcome> {
        match self {
            Self::Namespace(inst) => inst.spawn(request),
            Self::VmDisk(inst) => inst.spawn(request),
        }
    }

    /// Reaps a process started without waiting.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a pid this container does not own.
    pub fn wait_process(&mut self, pid: u32) -> Result<i32> {
        match self {
            Self::Namespace(inst) => inst.wait_process(pid),
            Self::VmDisk(inst) => inst.wait_process(pid),
        }
    }

    /// Unreaped processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        match self {
            Self::Namespace(inst) => inst.process_count(),
            Self::VmDisk(inst) => inst.process_count(),
        }
    }

    /// SIGTERM, then SIGKILL after `grace`, then reap.
    pub fn terminate_processes(&mut self, grace: Duration) {
        match self {
            Self::Namespace(inst) => inst.terminate_processes(grace),
            Self::VmDisk(inst) => inst.terminate_processes(grace),
        }
    }

    /// Undoes layer mounts in reverse order.
    pub fn release_mounts(&mut self) {
        match self {
            Self::Namespace(inst) => inst.release_mounts(),
            Self::VmDisk(_) => {}
        }
    }

    /// Tears down the isolation boundary: the namespace holder or the VM.
    pub fn release_isolation(&mut self) {
        match self {
            Self::Namespace(inst) => inst.release_isolation(),
            Self::VmDisk(inst) => inst.release_isolation(),
        }
    }

    /// Deletes staging directories.
    pub fn release_staging(&mut self) {
        match self {
            Self::Namespace(inst) => inst.release_staging(),
            Self::VmDisk(inst) => inst.release_staging(),
        }
    }

    /// Runs every teardown stage in order.
    pub fn release_all(&mut self, grace: Duration) {
        self.terminate_processes(grace);
        self.release_mounts();
        self.release_isolation();
        self.release_staging();
    }
}
