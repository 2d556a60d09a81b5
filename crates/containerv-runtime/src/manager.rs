//! The container registry and lifecycle entry points.

use std::collections::HashMap;
use std::sync::Arc;

use containerv_common::config::ContainervConfig;
use containerv_common::error::{ContainervError, Result};
use containerv_common::types::{BackendKind, ContainerId, ContainerState};
use containerv_policy::PolicyEngine;
use containerv_policy::backend::{ContainerMetrics, PolicyMetrics};

use crate::backend::{Backend, Capabilities};
use crate::container::{Container, ContainerInfo, ContainerSpec};
use crate::spawn::{SpawnOutcome, SpawnRequest};

/// Owns every container of the process.
///
/// Mutations take `&mut self`; a daemon serving several clients puts the
/// manager behind its own lock. Dropping the manager destroys whatever is
/// still registered.
#[derive(Debug)]
pub struct ContainerManager {
    config: ContainervConfig,
    backend: Backend,
    policy: Arc<PolicyEngine>,
    containers: HashMap<ContainerId, Container>,
}

impl ContainerManager {
    /// Detects the host and builds a manager on the shared policy engine.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if no isolation backend is usable here, or
    /// the error of opening the staging root.
    pub fn new(config: ContainervConfig) -> Result<Self> {
        let policy = PolicyEngine::initialize(&config.bpf_pin_dir);
        let caps = Capabilities::detect(&policy);
        let backend = Backend::select(&config, &caps)?;
        Ok(Self::with_parts(config, backend, policy))
    }

    /// Builds a manager from explicit parts.
    #[must_use]
    pub fn with_parts(config: ContainervConfig, backend: Backend, policy: Arc<PolicyEngine>) -> Self {
        tracing::info!(
            backend = %backend.kind(),
            policy = %policy.status(),
            "container manager ready"
        );
        Self {
            config,
            backend,
            policy,
            containers: HashMap::new(),
        }
    }

    /// Backend every container runs on.
    #[must_use]
    pub const fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Policy engine in use.
    #[must_use]
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ContainervConfig {
        &self.config
    }

    /// Creates a container: filesystem view, isolation boundary, then
    /// policy. A host without policy enforcement leaves the container
    /// unrestricted; any other policy failure undoes the container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a bad id or layer list, `AlreadyExists`
    /// for a registered id, or the failing step's error.
    pub fn create(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let id = spec.id.clone().unwrap_or_else(ContainerId::generate);
        id.validate()?;
        if self.containers.contains_key(&id) {
            return Err(ContainervError::AlreadyExists {
                kind: "container",
                id: id.to_string(),
            });
        }

        let mut instance = self.backend.create(&id, &spec)?;
        let policy_installed = match self.policy.populate_policy(&id, &instance.rootfs(), &spec.policy) {
            Ok(()) => true,
            Err(e) if e.is_not_supported() => {
                tracing::debug!(%id, "policy enforcement unavailable, container unrestricted");
                false
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "policy installation failed, undoing container");
                instance.release_all(self.config.grace_period());
                return Err(e);
            }
        };

        let container = Container::new(id.clone(), instance, policy_installed);
        tracing::info!(
            %id,
            backend = %container.backend(),
            rootfs = %container.rootfs().display(),
            policy = policy_installed,
            "container created"
        );
        let _ = self.containers.insert(id.clone(), container);
        Ok(id)
    }

    /// Runs a command in container `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container, `InvalidSpec` for a
    /// malformed request, or the spawn failure.
    pub fn spawn(&mut self, id: &ContainerId, request: &SpawnRequest) -> Result<SpawnOutcome> {
        let container = self.lookup_mut(id)?;
        let outcome = container.instance.spawn(request)?;
        if container.state() == ContainerState::Created {
            container.set_state(ContainerState::Running);
        }
        tracing::info!(%id, path = %request.path.display(), ?outcome, "process spawned");
        Ok(outcome)
    }

    /// Reaps process `pid` of container `id`, returning its exit code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container or pid.
    pub fn wait_process(&mut self, id: &ContainerId, pid: u32) -> Result<i32> {
        self.lookup_mut(id)?.instance.wait_process(pid)
    }

    /// Tears container `id` down: processes, policy, mounts, namespaces or
    /// VM, then staging. Failures are logged and skipped. Unknown ids,
    /// including already destroyed ones, are ignored.
    pub fn destroy(&mut self, id: &ContainerId) {
        let Some(mut container) = self.containers.remove(id) else {
            tracing::debug!(%id, "destroy of unknown container ignored");
            return;
        };
        container.set_state(ContainerState::Destroying);

        container.instance.terminate_processes(self.config.grace_period());
        if container.policy_installed() {
            if let Err(e) = self.policy.cleanup_policy(id) {
                tracing::warn!(%id, error = %e, "failed to remove policy");
            }
            container.policy_released();
        }
        container.instance.release_mounts();
        container.instance.release_isolation();
        container.instance.release_staging();

        container.set_state(ContainerState::Destroyed);
        tracing::info!(%id, "container destroyed");
    }

    /// Destroys every registered container.
    pub fn destroy_all(&mut self) {
        let ids: Vec<ContainerId> = self.containers.keys().cloned().collect();
        for id in &ids {
            self.destroy(id);
        }
    }

    /// Looks up a live container.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<&Container> {
        self.containers.get(id)
    }

    /// Snapshots of every live container, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerInfo> {
        let mut containers: Vec<&Container> = self.containers.values().collect();
        containers.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        containers.into_iter().map(Container::info).collect()
    }

    /// Policy counters of container `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container, `NotSupported` without
    /// enforcement, or the engine's error.
    pub fn get_container_metrics(&self, id: &ContainerId) -> Result<ContainerMetrics> {
        if !self.containers.contains_key(id) {
            return Err(not_found(id));
        }
        self.policy.get_container_metrics(id)
    }

    /// Policy totals across containers.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` without enforcement, or the engine's error.
    pub fn get_metrics(&self) -> Result<PolicyMetrics> {
        self.policy.get_metrics()
    }

    fn lookup_mut(&mut self, id: &ContainerId) -> Result<&mut Container> {
        self.containers.get_mut(id).ok_or_else(|| not_found(id))
    }
}

impl Drop for ContainerManager {
    fn drop(&mut self) {
        if !self.containers.is_empty() {
            tracing::debug!(count = self.containers.len(), "destroying remaining containers");
            self.destroy_all();
        }
    }
}

fn not_found(id: &ContainerId) -> ContainervError {
    ContainervError::NotFound {
        kind: "container",
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use containerv_core::identity::UserMapper;
    use containerv_core::namespace::NamespaceFlags;
    use containerv_image::compose::{Composer, Strategy};
    use containerv_image::layer::{Layer, LayerSource};
    use containerv_image::storage::StagingRoot;

    use super::*;
    use crate::backend::NamespaceBackend;

    fn manager(root: &Path) -> ContainerManager {
        let config = ContainervConfig::rooted_at(root);
        let composer = Composer::new(Strategy::Copy, StagingRoot::open(&config.staging_dir).unwrap());
        let backend = Backend::Namespace(NamespaceBackend::new(composer, UserMapper::new()));
        ContainerManager::with_parts(config, backend, Arc::new(PolicyEngine::unsupported()))
    }

    fn spec(root: &Path, id: &str) -> ContainerSpec {
        let base = root.join("base");
        std::fs::create_dir_all(base.join("etc")).unwrap();
        ContainerSpec::new(vec![Layer::new(LayerSource::Directory(base))])
            .with_id(ContainerId::new(id))
            .with_namespaces(NamespaceFlags::none())
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path());
        let _ = m.create(spec(dir.path(), "dup")).unwrap();
        assert!(matches!(
            m.create(spec(dir.path(), "dup")),
            Err(ContainervError::AlreadyExists { .. })
        ));
        assert_eq!(m.list().len(), 1);
    }

    #[test]
    fn invalid_id_is_rejected_before_staging() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path());
        assert!(matches!(
            m.create(spec(dir.path(), "../escape")),
            Err(ContainervError::InvalidSpec { .. })
        ));
        assert!(!dir.path().join("staging/containers").exists());
    }

    #[test]
    fn unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path());
        let ghost = ContainerId::new("ghost");
        m.destroy(&ghost);
        assert!(matches!(
            m.spawn(&ghost, &SpawnRequest::new("/bin/true")),
            Err(ContainervError::NotFound { .. })
        ));
        assert!(matches!(
            m.get_container_metrics(&ghost),
            Err(ContainervError::NotFound { .. })
        ));
    }

    #[test]
    fn dropping_the_manager_destroys_containers() {
        let dir = tempfile::tempdir().unwrap();
        let staging = {
            let mut m = manager(dir.path());
            let id = m.create(spec(dir.path(), "c1")).unwrap();
            m.get(&id).unwrap().rootfs()
        };
        assert!(!staging.exists());
    }
}
