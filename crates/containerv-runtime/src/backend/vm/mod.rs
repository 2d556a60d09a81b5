//! VM-disk backend for hosts without namespaces.
//!
//! Each container is a guest booted from its own disk chain. Commands run
//! through the guest agent; layers that could not be baked into the chain
//! are streamed to the agent right after boot.

pub mod disk;
pub mod guest;
pub mod hypervisor;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use containerv_common::config::VmConfig;
use containerv_common::error::{ContainervError, Result};
use containerv_common::types::ContainerId;
use containerv_image::layer::{self, LayerSource};

use self::disk::{WinVmPrepareResult, WinVmPreparer};
use self::guest::GuestAgent;
use self::hypervisor::{BootRequest, Hypervisor, RunningVm};
use crate::container::ContainerSpec;
use crate::spawn::{SpawnOutcome, SpawnRequest};

/// Creates one guest per container.
#[derive(Debug)]
pub struct VmDiskBackend {
    preparer: WinVmPreparer,
    hypervisor: Arc<dyn Hypervisor>,
    config: VmConfig,
}

impl VmDiskBackend {
    /// Backend staging with `preparer` and booting with `hypervisor`.
    #[must_use]
    pub fn new(preparer: WinVmPreparer, hypervisor: Arc<dyn Hypervisor>, config: VmConfig) -> Self {
        Self {
            preparer,
            hypervisor,
            config,
        }
    }

    /// Disk chain preparer.
    #[must_use]
    pub const fn preparer(&self) -> &WinVmPreparer {
        &self.preparer
    }

    /// Stages the chain, boots the guest, waits for its agent, and installs
    /// pending layers. Any failure stops the guest and removes the chain.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error.
    pub fn create(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<VmInstance> {
        let mut prepared = self.preparer.prepare_layers(id, &spec.layers)?;
        if prepared.boot_disk.is_none() {
            prepared = self.preparer.prepare_base(id, &spec.layers)?;
        }
        let Some(boot_disk) = prepared.boot_disk.clone() else {
            self.preparer.prepare_result_destroy(&mut prepared);
            return Err(ContainervError::internal("disk chain has no boot disk"));
        };

        let request = BootRequest {
            name: id.as_str(),
            disk: &boot_disk,
            memory_mb: self.config.memory_mb,
            cpus: self.config.cpus,
            guest_port: self.config.guest_port,
        };
        let mut vm = match self.hypervisor.boot(&request) {
            Ok(vm) => vm,
            Err(e) => {
                self.preparer.prepare_result_destroy(&mut prepared);
                return Err(e);
            }
        };

        let agent = GuestAgent::new(vm.agent_addr());
        let setup = agent
            .wait_ready(Duration::from_secs(self.config.boot_timeout_secs))
            .and_then(|()| install_pending(&agent, &prepared));
        if let Err(e) = setup {
            tracing::debug!(%id, error = %e, "guest setup failed, stopping VM");
            vm.stop();
            self.preparer.prepare_result_destroy(&mut prepared);
            return Err(e);
        }

        tracing::info!(%id, agent = %agent.addr(), "VM container ready");
        Ok(VmInstance {
            id: id.clone(),
            preparer: self.preparer.clone(),
            prepared,
            vm,
            agent,
            pids: BTreeSet::new(),
        })
    }
}

/// Streams every layer left in `prepared` to the guest.
fn install_pending(agent: &GuestAgent, prepared: &WinVmPrepareResult) -> Result<()> {
    let Some(staging) = &prepared.staging_dir else {
        return Ok(());
    };
    for (n, layer) in prepared.layers.iter().enumerate() {
        let scratch = staging.join("pending").join(n.to_string());
        let source = match &layer.source {
            LayerSource::Directory(dir) => dir.clone(),
            LayerSource::Files(entries) => {
                layer::materialize_files(entries, &scratch)?;
                scratch
            }
            LayerSource::Package(package) => {
                std::fs::create_dir_all(&scratch).map_err(|e| ContainervError::io(&scratch, e))?;
                package.unpack_to(&scratch)?;
                scratch
            }
            LayerSource::Image(_) => continue,
        };
        agent.install(&layer.target, &source)?;
    }
    Ok(())
}

/// One VM-backed container.
#[derive(Debug)]
pub struct VmInstance {
    id: ContainerId,
    preparer: WinVmPreparer,
    prepared: WinVmPrepareResult,
    vm: RunningVm,
    agent: GuestAgent,
    pids: BTreeSet<u32>,
}

impl VmInstance {
    /// Staging directory of the disk chain.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.prepared.staging_dir.clone().unwrap_or_default()
    }

    /// Whether package content was baked into the chain.
    #[must_use]
    pub const fn applied_packages(&self) -> bool {
        self.prepared.applied_packages
    }

    /// See [`Instance::spawn`](super::Instance::spawn).
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a malformed request or the agent's error.
    pub fn spawn(&mut self, request: &SpawnRequest) -> Result<SpawnOutcome> {
        let prepared = request.prepare()?;
        let outcome = self.agent.provision(request, &prepared)?;
        if let SpawnOutcome::Running(pid) = outcome {
            let _ = self.pids.insert(pid);
        }
        Ok(outcome)
    }

    /// See [`Instance::wait_process`](super::Instance::wait_process).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a pid not started here, or the agent's error.
    pub fn wait_process(&mut self, pid: u32) -> Result<i32> {
        if !self.pids.remove(&pid) {
            return Err(ContainervError::NotFound {
                kind: "process",
                id: pid.to_string(),
            });
        }
        self.agent.wait(pid)
    }

    /// Guest processes not yet waited for.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.pids.len()
    }

    pub(crate) fn terminate_processes(&mut self, grace: Duration) {
        if self.pids.is_empty() || !self.vm.is_running() {
            self.pids.clear();
            return;
        }
        if let Err(e) = self.agent.kill_all(grace) {
            tracing::warn!(id = %self.id, error = %e, "failed to stop guest processes");
        }
        self.pids.clear();
    }

    pub(crate) fn release_isolation(&mut self) {
        self.vm.stop();
    }

    pub(crate) fn release_staging(&mut self) {
        self.preparer.prepare_result_destroy(&mut self.prepared);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Mutex;

    use containerv_image::layer::Layer;
    use containerv_image::storage::StagingRoot;

    use super::disk::tests::FakeDiskTool;
    use super::guest::tests::fake_agent;
    use super::*;

    /// Hypervisor pointing every guest at a fixed agent address.
    #[derive(Debug)]
    struct FakeHypervisor {
        agent: SocketAddr,
        booted: Mutex<Vec<PathBuf>>,
    }

    impl Hypervisor for FakeHypervisor {
        fn boot(&self, request: &BootRequest<'_>) -> Result<RunningVm> {
            self.booted.lock().unwrap().push(request.disk.to_path_buf());
            Ok(RunningVm::external(request.name, self.agent))
        }
    }

    fn backend(root: &Path, agent: SocketAddr) -> (VmDiskBackend, Arc<FakeHypervisor>) {
        let base = root.join("base.vhd");
        std::fs::write(&base, b"conectix").unwrap();
        let preparer = WinVmPreparer::new(
            StagingRoot::open(root.join("staging")).unwrap(),
            Arc::new(FakeDiskTool::default()),
        )
        .with_base_disk(Some(base));
        let hypervisor = Arc::new(FakeHypervisor {
            agent,
            booted: Mutex::new(Vec::new()),
        });
        let config = VmConfig {
            boot_timeout_secs: 5,
            ..VmConfig::default()
        };
        (
            VmDiskBackend::new(preparer, Arc::clone(&hypervisor) as Arc<dyn Hypervisor>, config),
            hypervisor,
        )
    }

    #[test]
    fn directory_layers_boot_the_base_and_install_after_boot() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("run.cmd"), "echo hi").unwrap();

        let (addr, server) = fake_agent(vec![
            vec![r#"{"result":"pong"}"#.into()],
            vec![r#"{"result":null}"#.into()],
            vec![r#"{"result":{"pid":77}}"#.into()],
            vec![r#"{"result":{"exit_code":0}}"#.into()],
        ]);
        let (backend, hypervisor) = backend(dir.path(), addr);
        let id = ContainerId::new("win1");
        let spec = ContainerSpec::new(vec![Layer::new(LayerSource::Directory(app)).at("/app")]);

        let mut inst = backend.create(&id, &spec).unwrap();
        assert_eq!(hypervisor.booted.lock().unwrap().len(), 1);
        let staging = inst.rootfs();
        assert!(staging.is_dir());

        let outcome = inst.spawn(&SpawnRequest::new("C:\\app\\run.cmd")).unwrap();
        assert_eq!(outcome, SpawnOutcome::Running(77));
        assert_eq!(inst.process_count(), 1);
        assert_eq!(inst.wait_process(77).unwrap(), 0);
        assert!(inst.wait_process(77).is_err());

        inst.terminate_processes(Duration::ZERO);
        inst.release_isolation();
        inst.release_staging();
        assert!(!staging.exists());

        let requests = server.join().unwrap();
        assert!(requests[1].contains(r#""method":"install""#));
        assert!(requests[1].contains(r#""target":"/app""#));
    }

    #[test]
    fn unreachable_agent_removes_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on the closed listener's port.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let (mut backend, _) = backend(dir.path(), addr);
        backend.config.boot_timeout_secs = 1;

        let id = ContainerId::new("win2");
        let spec = ContainerSpec::new(vec![Layer::new(LayerSource::Directory(
            dir.path().to_path_buf(),
        ))]);
        assert!(backend.create(&id, &spec).is_err());
        assert!(!dir.path().join("staging/vm/win2").exists());
    }
}
