//! Namespace backend: a composed rootfs entered through a holder process.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use containerv_common::error::{ContainervError, Result};
use containerv_common::types::ContainerId;
use containerv_core::identity::UserMapper;
use containerv_core::namespace::holder::{
    CloneIsolator, IsolationRequest, Isolator, NamespaceHandle,
};
use containerv_image::compose::{Composer, Composition};

use crate::container::ContainerSpec;
use crate::spawn::{PreparedSpawn, ProcessTable, SpawnOutcome, SpawnRequest};

/// Hostname used when an id has no usable characters.
const FALLBACK_HOSTNAME: &str = "containerv";

/// Derives a hostname from the first characters of `id`.
#[must_use]
pub fn default_hostname(id: &ContainerId) -> String {
    let name: String = id
        .short()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let name = name.trim_matches('-');
    if name.is_empty() {
        FALLBACK_HOSTNAME.to_string()
    } else {
        name.to_string()
    }
}

/// Creates containers as composed rootfs views inside fresh namespaces.
#[derive(Debug)]
pub struct NamespaceBackend {
    composer: Composer,
    isolator: Arc<dyn Isolator>,
    identity: UserMapper,
    nsenter: Option<PathBuf>,
}

impl NamespaceBackend {
    /// Backend isolating through `clone(2)`.
    #[must_use]
    pub fn new(composer: Composer, identity: UserMapper) -> Self {
        Self {
            composer,
            isolator: Arc::new(CloneIsolator),
            identity,
            nsenter: which::which("nsenter").ok(),
        }
    }

    /// Replaces the isolator.
    #[must_use]
    pub fn with_isolator(mut self, isolator: Arc<dyn Isolator>) -> Self {
        self.isolator = isolator;
        self
    }

    /// Composer used for every container.
    #[must_use]
    pub const fn composer(&self) -> &Composer {
        &self.composer
    }

    /// Composes the rootfs, then isolates it. A failed isolation undoes
    /// the composition.
    ///
    /// # Errors
    ///
    /// Returns the composition or isolation error.
    pub fn create(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<NamespaceInstance> {
        let hostname = spec
            .hostname
            .clone()
            .unwrap_or_else(|| default_hostname(id));
        let mut composition = self.composer.compose(id, &spec.layers)?;
        let rootfs = composition.rootfs();
        let id_map = self.identity.id_map();
        let request = IsolationRequest {
            rootfs: &rootfs,
            flags: &spec.namespaces,
            id_map: spec.namespaces.user.then_some(&id_map),
            hostname: Some(&hostname),
        };

        match self.isolator.establish(&request) {
            Ok(handle) => {
                tracing::info!(
                    %id,
                    holder = ?handle.holder_pid(),
                    namespaces = handle.kinds().len(),
                    %hostname,
                    "namespaces established"
                );
                Ok(NamespaceInstance {
                    composer: self.composer.clone(),
                    composition,
                    handle,
                    processes: ProcessTable::new(),
                    nsenter: self.nsenter.clone(),
                })
            }
            Err(e) => {
                tracing::debug!(%id, error = %e, "isolation failed, undoing composition");
                self.composer.decompose(&mut composition);
                Err(e)
            }
        }
    }
}

/// One namespace-backed container.
#[derive(Debug)]
pub struct NamespaceInstance {
    composer: Composer,
    composition: Composition,
    handle: NamespaceHandle,
    processes: ProcessTable,
    nsenter: Option<PathBuf>,
}

impl NamespaceInstance {
    /// Composed rootfs.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.composition.rootfs()
    }

    /// The composition backing this container.
    #[must_use]
    pub const fn composition(&self) -> &Composition {
        &self.composition
    }

    /// The namespace handle.
    #[must_use]
    pub const fn handle(&self) -> &NamespaceHandle {
        &self.handle
    }

    /// Builds the host command for a prepared request: `nsenter` into the
    /// holder when isolated, or the program itself with its working
    /// directory under the rootfs when not.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if `nsenter` is missing, or `NotFound` for a
    /// working directory absent from an unisolated rootfs.
    pub fn command(&self, prepared: &PreparedSpawn) -> Result<Command> {
        let mut command = if self.handle.is_isolated() {
            let nsenter = self
                .nsenter
                .as_ref()
                .ok_or_else(|| ContainervError::not_supported("nsenter not found in PATH"))?;
            let mut cmd = Command::new(nsenter);
            let _ = cmd
                .args(self.handle.nsenter_args(&prepared.working_dir))
                .arg("--")
                .arg(&prepared.path)
                .args(&prepared.arguments);
            cmd
        } else {
            let inside = prepared
                .working_dir
                .strip_prefix("/")
                .unwrap_or(&prepared.working_dir);
            let dir = self.composition.rootfs().join(inside);
            if !dir.is_dir() {
                return Err(ContainervError::NotFound {
                    kind: "working directory",
                    id: prepared.working_dir.display().to_string(),
                });
            }
            let mut cmd = Command::new(&prepared.path);
            let _ = cmd.args(&prepared.arguments).current_dir(dir);
            cmd
        };
        let _ = command
            .env_clear()
            .envs(prepared.environment.iter().map(|(k, v)| (k, v)));
        Ok(command)
    }

    /// See [`Instance::spawn`](super::Instance::spawn).
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a malformed request or the spawn failure.
    pub fn spawn(&mut self, request: &SpawnRequest) -> Result<SpawnOutcome> {
        let prepared = request.prepare()?;
        let command = self.command(&prepared)?;
        self.processes.run(command, request)
    }

    /// See [`Instance::wait_process`](super::Instance::wait_process).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown pid.
    pub fn wait_process(&mut self, pid: u32) -> Result<i32> {
        self.processes.wait(pid)
    }

    /// Unreaped processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub(crate) fn terminate_processes(&mut self, grace: Duration) {
        let killed = self.processes.terminate_all(grace);
        if killed > 0 {
            tracing::warn!(id = %self.composition.id(), killed, "processes killed after grace period");
        }
    }

    pub(crate) fn release_mounts(&mut self) {
        let failures = self.composer.release_mounts(&mut self.composition);
        if failures > 0 {
            tracing::warn!(id = %self.composition.id(), failures, "some layer mounts could not be released");
        }
    }

    pub(crate) fn release_isolation(&mut self) {
        self.handle.release();
    }

    pub(crate) fn release_staging(&mut self) {
        self.composer.release_staging(&mut self.composition);
    }
}
