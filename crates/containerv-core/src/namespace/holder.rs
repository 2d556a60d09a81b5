//! Namespace-holder processes.
//!
//! Each isolated container gets one holder: a child created with `clone(2)`
//! directly into the requested namespaces. The holder makes its mounts
//! private, pivots into the composed rootfs, mounts `/proc`, sets the
//! hostname, reports back over a pipe, and then idles until it is killed.
//! Commands are later spawned into the holder's namespaces, and killing it
//! releases them.
//!
//! Setup protocol:
//!
//! ```text
//! parent                              holder
//!   clone(flags) ───────────────────▶ block on go pipe
//!   write uid/gid map (user ns)
//!   go pipe: 1 byte ────────────────▶ make-rprivate, pivot_root, /proc, hostname
//!   read 5-byte report ◀───────────── [stage, errno as i32]
//!   open /proc/<pid>/ns/*             pause() forever
//! ```

use std::fmt;
use std::fs::File;
use std::path::Path;

use containerv_common::error::{ContainervError, Result};

use super::user::IdMap;
use super::{NamespaceFlags, NamespaceKind};

/// Everything needed to establish a container's namespaces.
#[derive(Debug, Clone, Copy)]
pub struct IsolationRequest<'a> {
    /// Composed rootfs to pivot into.
    pub rootfs: &'a Path,
    /// Namespaces to create.
    pub flags: &'a NamespaceFlags,
    /// UID/GID map written when a user namespace is requested.
    pub id_map: Option<&'a IdMap>,
    /// Hostname set when a UTS namespace is requested.
    pub hostname: Option<&'a str>,
}

/// Creates isolation boundaries around a composed rootfs.
pub trait Isolator: Send + Sync + fmt::Debug {
    /// Establishes the namespaces described by `request`.
    ///
    /// On error nothing is left behind: any holder already created has been
    /// killed and reaped.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the rootfs is missing, `PermissionDenied` if
    /// namespaces cannot be created and the flags do not allow an
    /// unprivileged fallback, or the classified errno of a failed step.
    fn establish(&self, request: &IsolationRequest<'_>) -> Result<NamespaceHandle>;
}

/// Owned namespaces of one container.
///
/// Dropping the handle releases it; [`NamespaceHandle::release`] does the
/// same explicitly and is idempotent.
#[derive(Debug)]
pub struct NamespaceHandle {
    holder: Option<i32>,
    kinds: Vec<NamespaceKind>,
    handles: Vec<(NamespaceKind, File)>,
    released: bool,
}

impl NamespaceHandle {
    /// A handle for a container running without namespaces.
    #[must_use]
    pub const fn unisolated() -> Self {
        Self {
            holder: None,
            kinds: Vec::new(),
            handles: Vec::new(),
            released: false,
        }
    }

    /// PID of the holder process, if the container is isolated.
    #[must_use]
    pub fn holder_pid(&self) -> Option<u32> {
        self.holder.and_then(|pid| u32::try_from(pid).ok())
    }

    /// Whether commands run inside namespaces.
    #[must_use]
    pub const fn is_isolated(&self) -> bool {
        self.holder.is_some()
    }

    /// Namespaces owned by this handle.
    #[must_use]
    pub fn kinds(&self) -> &[NamespaceKind] {
        &self.kinds
    }

    /// Number of open `/proc/<pid>/ns/*` handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Whether [`NamespaceHandle::release`] has run.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// `nsenter(1)` arguments that enter every owned namespace, take the
    /// holder's root, and start in `working_dir` (a path inside the rootfs).
    ///
    /// Empty for an unisolated handle.
    #[must_use]
    pub fn nsenter_args(&self, working_dir: &Path) -> Vec<String> {
        let Some(pid) = self.holder else {
            return Vec::new();
        };
        let mut args = vec!["--target".to_string(), pid.to_string()];
        args.extend(self.kinds.iter().map(|k| k.nsenter_flag().to_string()));
        args.push("--root".to_string());
        let inside = working_dir.strip_prefix("/").unwrap_or(working_dir);
        args.push(format!("--wd=/proc/{pid}/root/{}", inside.display()));
        args
    }

    /// Kills and reaps the holder and closes the namespace handles.
    ///
    /// Safe to call repeatedly; later calls do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pid) = self.holder.take() {
            terminate_holder(pid);
            tracing::debug!(pid, "namespace holder released");
        }
        self.handles.clear();
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// [`Isolator`] that creates a real holder process with `clone(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneIsolator;

impl Isolator for CloneIsolator {
    fn establish(&self, request: &IsolationRequest<'_>) -> Result<NamespaceHandle> {
        let flags = request.flags;
        if flags.is_empty() {
            tracing::debug!("no namespaces requested");
            return Ok(NamespaceHandle::unisolated());
        }
        if !flags.mount {
            // Without a mount namespace there is no pivot, and processes
            // entering the holder would see the host root.
            return Err(ContainervError::invalid(
                "isolated containers need a mount namespace",
            ));
        }
        if !request.rootfs.is_dir() {
            return Err(ContainervError::NotFound {
                kind: "rootfs",
                id: request.rootfs.display().to_string(),
            });
        }
        if let Some(name) = request.hostname {
            super::uts::validate_hostname(name)?;
        }

        match spawn_holder(request) {
            Ok(handle) => Ok(handle),
            Err(e @ ContainervError::PermissionDenied { .. }) if flags.allow_unprivileged => {
                tracing::warn!(error = %e, "namespaces unavailable, running unisolated");
                Ok(NamespaceHandle::unisolated())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(target_os = "linux")]
const HOLDER_STACK_SIZE: usize = 256 * 1024;

#[cfg(target_os = "linux")]
mod stage {
    pub const READY: u8 = 0;
    pub const PRIVATE: u8 = 1;
    pub const PIVOT: u8 = 2;
    pub const PROC: u8 = 3;
    pub const HOSTNAME: u8 = 4;

    pub const fn name(stage: u8) -> &'static str {
        match stage {
            PRIVATE => "making mounts private",
            PIVOT => "pivot_root into rootfs",
            PROC => "mounting /proc",
            HOSTNAME => "setting hostname",
            _ => "holder setup",
        }
    }
}

/// What the cloned child needs, prepared before `clone(2)`.
#[cfg(target_os = "linux")]
struct ChildSetup {
    rootfs: std::path::PathBuf,
    mount: bool,
    pid: bool,
    hostname: Option<String>,
    go_fd: std::os::fd::RawFd,
    ready_fd: std::os::fd::RawFd,
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn spawn_holder(request: &IsolationRequest<'_>) -> Result<NamespaceHandle> {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    use nix::errno::Errno;
    use nix::sched::clone;
    use nix::unistd::pipe;

    let flags = request.flags;
    let (go_read, go_write) = pipe().map_err(|e| ContainervError::from_errno("pipe", e))?;
    let (ready_read, ready_write) = pipe().map_err(|e| ContainervError::from_errno("pipe", e))?;

    let setup = ChildSetup {
        rootfs: request.rootfs.to_path_buf(),
        mount: flags.mount,
        pid: flags.pid,
        hostname: request
            .hostname
            .filter(|_| flags.uts)
            .map(str::to_owned),
        go_fd: go_read.as_raw_fd(),
        ready_fd: ready_write.as_raw_fd(),
    };
    let mut stack = vec![0u8; HOLDER_STACK_SIZE];
    let callback = Box::new(move || holder_main(&setup));

    // SAFETY: without CLONE_VM the child gets a copy of this address space.
    // It only runs `holder_main`, which touches the fds it was handed and
    // never returns into frames owned by the parent.
    let pid = unsafe { clone(callback, &mut stack, flags.clone_flags(), Some(libc::SIGCHLD)) }
        .map_err(|e| ContainervError::from_errno("clone", e))?;
    drop(go_read);
    drop(ready_write);

    let mut guard = HolderGuard(Some(pid.as_raw()));
    tracing::debug!(pid = pid.as_raw(), "namespace holder cloned");

    if flags.user {
        if let Some(map) = request.id_map {
            let raw = u32::try_from(pid.as_raw())
                .map_err(|_| ContainervError::internal("negative holder pid"))?;
            super::user::write_id_map(raw, map)?;
        }
    }

    let mut go = File::from(go_write);
    go.write_all(&[1])
        .map_err(|e| ContainervError::io("holder go pipe", e))?;
    drop(go);

    let mut report = [0u8; 5];
    File::from(ready_read)
        .read_exact(&mut report)
        .map_err(|_| ContainervError::internal("namespace holder exited during setup"))?;
    let errno = i32::from_ne_bytes([report[1], report[2], report[3], report[4]]);
    if report[0] != stage::READY {
        return Err(ContainervError::from_errno(
            stage::name(report[0]),
            Errno::from_raw(errno),
        ));
    }

    let kinds = flags.kinds();
    let mut handles = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        let path = format!("/proc/{}/ns/{}", pid.as_raw(), kind.proc_name());
        let file = File::open(&path).map_err(|e| ContainervError::io(path, e))?;
        handles.push((*kind, file));
    }

    let holder = guard.disarm();
    tracing::info!(pid = holder, namespaces = kinds.len(), "namespaces established");
    Ok(NamespaceHandle {
        holder: Some(holder),
        kinds,
        handles,
        released: false,
    })
}

#[cfg(not(target_os = "linux"))]
fn spawn_holder(_request: &IsolationRequest<'_>) -> Result<NamespaceHandle> {
    Err(ContainervError::PermissionDenied {
        message: "namespaces require Linux".into(),
    })
}

/// Runs in the cloned child. Returns only on failure; the value becomes the
/// child's exit status.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn holder_main(setup: &ChildSetup) -> isize {
    let mut byte = [0u8; 1];
    // SAFETY: go_fd is the read end of a pipe created for this child and
    // `byte` is a valid one-byte buffer.
    let n = unsafe { libc::read(setup.go_fd, byte.as_mut_ptr().cast(), 1) };
    if n != 1 {
        return 1;
    }

    let status = match setup_root(setup) {
        Ok(()) => (stage::READY, 0),
        Err((failed, errno)) => (failed, errno as i32),
    };
    let mut report = [0u8; 5];
    report[0] = status.0;
    report[1..].copy_from_slice(&status.1.to_ne_bytes());
    // SAFETY: ready_fd is the write end of the report pipe; `report` is a
    // valid 5-byte buffer. Closing it lets the parent see EOF if we die.
    unsafe {
        let _ = libc::write(setup.ready_fd, report.as_ptr().cast(), report.len());
        let _ = libc::close(setup.ready_fd);
        let _ = libc::close(setup.go_fd);
    }
    if status.0 != stage::READY {
        return 1;
    }
    loop {
        nix::unistd::pause();
    }
}

#[cfg(target_os = "linux")]
fn setup_root(setup: &ChildSetup) -> std::result::Result<(), (u8, nix::errno::Errno)> {
    use crate::filesystem::{mount, pivot_root};

    if setup.mount {
        mount::make_rprivate().map_err(|e| (stage::PRIVATE, e))?;
        pivot_root::pivot_root(&setup.rootfs).map_err(|e| (stage::PIVOT, e))?;
        if setup.pid {
            mount::mount_proc().map_err(|e| (stage::PROC, e))?;
        }
    }
    if let Some(name) = &setup.hostname {
        super::uts::set_hostname(name).map_err(|e| (stage::HOSTNAME, e))?;
    }
    Ok(())
}

/// Kills and reaps a holder unless disarmed.
#[cfg(target_os = "linux")]
struct HolderGuard(Option<i32>);

#[cfg(target_os = "linux")]
impl HolderGuard {
    fn disarm(&mut self) -> i32 {
        self.0.take().unwrap_or_default()
    }
}

#[cfg(target_os = "linux")]
impl Drop for HolderGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            tracing::debug!(pid, "unwinding partially created namespaces");
            terminate_holder(pid);
        }
    }
}

#[cfg(target_os = "linux")]
fn terminate_holder(pid: i32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid);
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid = pid.as_raw(), error = %e, "failed to kill namespace holder"),
    }
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => {}
            Ok(_) | Err(_) => break,
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn terminate_holder(_pid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unisolated_handle_has_no_nsenter_args() {
        let handle = NamespaceHandle::unisolated();
        assert!(!handle.is_isolated());
        assert!(handle.nsenter_args(Path::new("/")).is_empty());
    }

    #[test]
    fn release_is_idempotent() {
        let mut handle = NamespaceHandle::unisolated();
        handle.release();
        handle.release();
        assert!(handle.is_released());
    }

    #[test]
    fn nsenter_args_enter_every_namespace() {
        let handle = NamespaceHandle {
            holder: Some(4242),
            kinds: NamespaceFlags::default().kinds(),
            handles: Vec::new(),
            released: true,
        };
        let args = handle.nsenter_args(Path::new("/work/src"));
        assert_eq!(&args[..2], ["--target", "4242"]);
        assert!(args.contains(&"--mount".to_string()));
        assert!(args.contains(&"--net".to_string()));
        assert!(args.contains(&"--root".to_string()));
        assert_eq!(args.last().unwrap(), "--wd=/proc/4242/root/work/src");
    }

    #[test]
    fn empty_flags_yield_unisolated_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flags = NamespaceFlags::none();
        let handle = CloneIsolator
            .establish(&IsolationRequest {
                rootfs: dir.path(),
                flags: &flags,
                id_map: None,
                hostname: None,
            })
            .expect("establish");
        assert!(!handle.is_isolated());
    }

    #[test]
    fn isolation_without_a_mount_namespace_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flags = NamespaceFlags {
            mount: false,
            ..NamespaceFlags::default()
        };
        let result = CloneIsolator.establish(&IsolationRequest {
            rootfs: dir.path(),
            flags: &flags,
            id_map: None,
            hostname: None,
        });
        assert!(matches!(result, Err(ContainervError::InvalidSpec { .. })));
    }

    #[test]
    fn missing_rootfs_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flags = NamespaceFlags::default();
        let result = CloneIsolator.establish(&IsolationRequest {
            rootfs: &dir.path().join("missing"),
            flags: &flags,
            id_map: None,
            hostname: None,
        });
        assert!(matches!(result, Err(ContainervError::NotFound { .. })));
    }
}
