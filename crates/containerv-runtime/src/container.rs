//! Container records held by the manager.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use containerv_common::types::{BackendKind, ContainerId, ContainerState};
use containerv_core::namespace::NamespaceFlags;
use containerv_image::layer::Layer;
use containerv_policy::PolicySpec;
use serde::{Deserialize, Serialize};

use crate::backend::Instance;

/// Everything needed to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Requested id; generated when absent.
    pub id: Option<ContainerId>,
    /// Ordered layers, later layers winning.
    pub layers: Vec<Layer>,
    /// Namespaces to create.
    pub namespaces: NamespaceFlags,
    /// Hostname inside the uts namespace; defaults to the id prefix.
    pub hostname: Option<String>,
    /// Network policy. Ignored when the host cannot enforce one.
    pub policy: PolicySpec,
}

impl ContainerSpec {
    /// A spec with default namespaces and no policy restrictions.
    #[must_use]
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            id: None,
            layers,
            namespaces: NamespaceFlags::default(),
            hostname: None,
            policy: PolicySpec::default(),
        }
    }

    /// Uses `id` instead of a generated one.
    #[must_use]
    pub fn with_id(mut self, id: ContainerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the namespaces to create.
    #[must_use]
    pub fn with_namespaces(mut self, namespaces: NamespaceFlags) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Sets the hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the network policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PolicySpec) -> Self {
        self.policy = policy;
        self
    }
}

/// A live container and the backend resources it owns.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    backend: BackendKind,
    state: ContainerState,
    created_at: DateTime<Utc>,
    policy_installed: bool,
    pub(crate) instance: Instance,
}

impl Container {
    pub(crate) fn new(id: ContainerId, instance: Instance, policy_installed: bool) -> Self {
        Self {
            id,
            backend: instance.kind(),
            state: ContainerState::Created,
            created_at: Utc::now(),
            policy_installed,
            instance,
        }
    }

    /// Container id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Backend the container runs on.
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ContainerState) {
        tracing::debug!(id = %self.id, from = %self.state, to = %state, "state change");
        self.state = state;
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether a policy entry was installed for this container.
    #[must_use]
    pub const fn policy_installed(&self) -> bool {
        self.policy_installed
    }

    pub(crate) fn policy_released(&mut self) {
        self.policy_installed = false;
    }

    /// Root of the container's view: the composed rootfs, or the disk
    /// staging directory of a VM.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.instance.rootfs()
    }

    /// Pid of the process holding the container's namespaces.
    #[must_use]
    pub fn holder_pid(&self) -> Option<u32> {
        self.instance.holder_pid()
    }

    /// Spawned processes not yet reaped.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.instance.process_count()
    }

    /// Serializable snapshot.
    #[must_use]
    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            state: self.state,
            backend: self.backend,
            rootfs: self.rootfs(),
            processes: self.process_count(),
            policy: self.policy_installed,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Point-in-time view of a container, as returned by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container id.
    pub id: ContainerId,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Backend in use.
    pub backend: BackendKind,
    /// Root of the container's view.
    pub rootfs: PathBuf,
    /// Unreaped processes.
    pub processes: usize,
    /// Whether a policy entry is installed.
    pub policy: bool,
    /// RFC 3339 creation time.
    pub created_at: String,
}
