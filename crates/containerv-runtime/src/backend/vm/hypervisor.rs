//! Booting guests from a staged disk chain.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use containerv_common::error::{ContainervError, Result};

/// Parameters of one guest boot.
#[derive(Debug, Clone)]
pub struct BootRequest<'a> {
    /// Guest name, the container id.
    pub name: &'a str,
    /// Writable disk to boot from.
    pub disk: &'a Path,
    /// Guest memory in MiB.
    pub memory_mb: u32,
    /// Guest CPU count.
    pub cpus: u32,
    /// Port the guest agent listens on inside the guest.
    pub guest_port: u16,
}

/// Starts guests.
pub trait Hypervisor: Send + Sync + fmt::Debug {
    /// Boots a guest. The returned VM's agent address may not answer yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the guest cannot be started.
    fn boot(&self, request: &BootRequest<'_>) -> Result<RunningVm>;
}

/// A booted guest.
#[derive(Debug)]
pub struct RunningVm {
    name: String,
    agent: SocketAddr,
    process: Option<Child>,
}

impl RunningVm {
    /// A guest run by the given hypervisor process.
    #[must_use]
    pub fn with_process(name: impl Into<String>, agent: SocketAddr, process: Child) -> Self {
        Self {
            name: name.into(),
            agent,
            process: Some(process),
        }
    }

    /// A guest whose lifetime is managed elsewhere; stopping it does nothing.
    #[must_use]
    pub fn external(name: impl Into<String>, agent: SocketAddr) -> Self {
        Self {
            name: name.into(),
            agent,
            process: None,
        }
    }

    /// Host address of the guest agent.
    #[must_use]
    pub const fn agent_addr(&self) -> SocketAddr {
        self.agent
    }

    /// Whether the hypervisor process is still owned.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Kills and reaps the hypervisor process. Repeated calls do nothing.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::info!(name = %self.name, "VM stopped");
        }
    }
}

impl Drop for RunningVm {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns the QEMU binary name for the host architecture.
const fn qemu_binary_name() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "qemu-system-aarch64"
    } else {
        "qemu-system-x86_64"
    }
}

/// Returns the QEMU machine type for the host architecture.
const fn machine_type() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "virt"
    } else {
        "q35"
    }
}

/// Returns platform-specific QEMU acceleration flags.
fn accel_flags() -> Vec<String> {
    let accel = if cfg!(target_os = "macos") {
        "hvf"
    } else if cfg!(target_os = "windows") {
        "whpx,kernel-irqchip=off"
    } else if Path::new("/dev/kvm").exists() {
        "kvm"
    } else {
        "tcg"
    };
    vec!["-accel".into(), accel.into()]
}

/// Picks a free loopback port for the agent forward.
fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| ContainervError::io("127.0.0.1:0", e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| ContainervError::io("127.0.0.1:0", e))?;
    Ok(addr.port())
}

/// [`Hypervisor`] running each guest in its own QEMU process.
#[derive(Debug, Clone)]
pub struct Qemu {
    binary: PathBuf,
}

impl Qemu {
    /// Finds QEMU for the host architecture in `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` naming the missing binary.
    pub fn locate() -> Result<Self> {
        let binary = qemu_binary_name();
        which::which(binary)
            .map(|binary| Self { binary })
            .map_err(|_| ContainervError::not_supported(format!("{binary} not found in PATH")))
    }

    /// Uses an explicit binary.
    #[must_use]
    pub const fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// QEMU command line for `request`, forwarding `host_port` on loopback
    /// to the guest agent.
    #[must_use]
    pub fn command(&self, request: &BootRequest<'_>, host_port: u16) -> Command {
        let netdev = format!(
            "user,id=net0,hostfwd=tcp:127.0.0.1:{host_port}-:{}",
            request.guest_port
        );
        let drive = format!("file={},format=qcow2,if=ide", request.disk.display());
        let mut cmd = Command::new(&self.binary);
        let _ = cmd
            .args(["-name", request.name])
            .args(["-machine", machine_type()])
            .args(accel_flags())
            .args(["-cpu", "max"])
            .args(["-m", &request.memory_mb.to_string()])
            .args(["-smp", &request.cpus.to_string()])
            .args(["-drive", &drive])
            .args(["-netdev", &netdev, "-device", "e1000,netdev=net0"])
            .args(["-display", "none"])
            .arg("-no-reboot")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Hypervisor for Qemu {
    fn boot(&self, request: &BootRequest<'_>) -> Result<RunningVm> {
        let host_port = free_port()?;
        tracing::info!(
            name = request.name,
            qemu = %self.binary.display(),
            disk = %request.disk.display(),
            host_port,
            "booting VM"
        );
        let child = self
            .command(request, host_port)
            .spawn()
            .map_err(|e| ContainervError::io(&self.binary, e))?;
        Ok(RunningVm::with_process(
            request.name,
            SocketAddr::from((Ipv4Addr::LOCALHOST, host_port)),
            child,
        ))
    }
}
