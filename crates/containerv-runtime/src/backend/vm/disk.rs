//! Virtual-disk chains for VM-backed containers.
//!
//! A chain is three disks in the container's VM staging directory: the
//! read-only base image, an application disk holding injected packages, and
//! a writable boot disk the guest runs from. Each disk after the base is a
//! differencing disk backed by the one before it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use containerv_common::constants::{VM_APP_DISK, VM_BOOT_DISK};
use containerv_common::error::{ContainervError, Result};
use containerv_common::types::ContainerId;
use containerv_core::filesystem::mount::{self, SysMounter};
use containerv_core::filesystem::tree;
use containerv_image::layer::{self, Layer, LayerSource};
use containerv_image::storage::StagingRoot;

/// Disk image operations the preparer needs.
pub trait DiskTool: Send + Sync + fmt::Debug {
    /// Creates `child` as a differencing disk over `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails.
    fn create_differencing(&self, base: &Path, child: &Path) -> Result<()>;

    /// Whether [`DiskTool::inject`] is available.
    fn can_inject(&self) -> bool;

    /// Copies the contents of `source` into `disk` at `target`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` without injection support, or the tool's
    /// failure.
    fn inject(&self, disk: &Path, source: &Path, target: &Path) -> Result<()>;
}

/// Image format name `qemu-img` uses for a disk, judged by extension.
#[must_use]
pub fn disk_format(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("vhd" | "vpc") => "vpc",
        Some("vhdx") => "vhdx",
        Some("qcow2") => "qcow2",
        Some("vmdk") => "vmdk",
        _ => "raw",
    }
}

/// [`DiskTool`] driving `qemu-img` and libguestfs' `virt-copy-in`.
#[derive(Debug, Clone)]
pub struct QemuImg {
    qemu_img: PathBuf,
    copy_in: Option<PathBuf>,
}

impl QemuImg {
    /// Finds the tools in `PATH`. `virt-copy-in` is optional.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if `qemu-img` is missing.
    pub fn locate() -> Result<Self> {
        let qemu_img = which::which("qemu-img").map_err(|_| {
            ContainervError::not_supported("qemu-img not found in PATH (install qemu-utils)")
        })?;
        Ok(Self {
            qemu_img,
            copy_in: which::which("virt-copy-in").ok(),
        })
    }

    /// Uses explicit tool paths.
    #[must_use]
    pub const fn new(qemu_img: PathBuf, copy_in: Option<PathBuf>) -> Self {
        Self { qemu_img, copy_in }
    }
}

fn run_tool(command: &mut Command, tool: &Path) -> Result<()> {
    let output = command.output().map_err(|e| ContainervError::io(tool, e))?;
    if output.status.success() {
        return Ok(());
    }
    Err(ContainervError::internal(format!(
        "{} failed ({}): {}",
        tool.display(),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

impl DiskTool for QemuImg {
    fn create_differencing(&self, base: &Path, child: &Path) -> Result<()> {
        tracing::debug!(base = %base.display(), child = %child.display(), "creating differencing disk");
        run_tool(
            Command::new(&self.qemu_img)
                .args(["create", "-q", "-f", disk_format(child), "-F", disk_format(base), "-b"])
                .arg(base)
                .arg(child),
            &self.qemu_img,
        )
    }

    fn can_inject(&self) -> bool {
        self.copy_in.is_some()
    }

    fn inject(&self, disk: &Path, source: &Path, target: &Path) -> Result<()> {
        let copy_in = self
            .copy_in
            .as_ref()
            .ok_or_else(|| ContainervError::not_supported("virt-copy-in not found in PATH"))?;
        let entries = std::fs::read_dir(source)
            .map_err(|e| ContainervError::io(source, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| ContainervError::io(source, e))?;
        if entries.is_empty() {
            return Ok(());
        }
        run_tool(
            Command::new(copy_in)
                .arg("-a")
                .arg(disk)
                .args(&entries)
                .arg(target),
            copy_in,
        )
    }
}

/// Output of [`WinVmPreparer::prepare_layers`].
#[derive(Debug, Default)]
pub struct WinVmPrepareResult {
    /// Staging directory holding the chain, owned until
    /// [`WinVmPreparer::prepare_result_destroy`].
    pub staging_dir: Option<PathBuf>,
    /// Disk the guest boots from.
    pub boot_disk: Option<PathBuf>,
    /// Whether package content was injected into the application disk.
    pub applied_packages: bool,
    /// Layers still to be installed after boot.
    pub layers: Vec<Layer>,
}

/// Stages disk chains for VM-backed containers.
#[derive(Debug, Clone)]
pub struct WinVmPreparer {
    staging: StagingRoot,
    tool: Arc<dyn DiskTool>,
    base_disk: Option<PathBuf>,
}

impl WinVmPreparer {
    /// Preparer staging under `staging` with `tool`.
    #[must_use]
    pub fn new(staging: StagingRoot, tool: Arc<dyn DiskTool>) -> Self {
        Self {
            staging,
            tool,
            base_disk: None,
        }
    }

    /// Base disk used when no layer is an image.
    #[must_use]
    pub fn with_base_disk(mut self, base_disk: Option<PathBuf>) -> Self {
        self.base_disk = base_disk;
        self
    }

    /// Whether `layer` needs disk handling.
    #[must_use]
    pub const fn needs_disk(layer: &Layer) -> bool {
        matches!(layer.source, LayerSource::Image(_) | LayerSource::Package(_))
    }

    /// Stages a disk chain when any layer needs one.
    ///
    /// Without image or package layers this returns the layers unchanged
    /// and no staging directory. Otherwise the base is the image layer, or
    /// the configured base disk; packages are injected into the
    /// application disk when the tool can. On error the staging directory
    /// is gone.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a conflicting layer list or more than one
    /// image, `NotSupported` without any base disk, `NotFound` for a
    /// missing base, or the disk tool's failure.
    pub fn prepare_layers(&self, id: &ContainerId, layers: &[Layer]) -> Result<WinVmPrepareResult> {
        layer::validate_layers(layers)?;
        if !layers.iter().any(Self::needs_disk) {
            tracing::debug!(%id, "no layer needs a disk chain");
            return Ok(WinVmPrepareResult {
                layers: layers.to_vec(),
                ..WinVmPrepareResult::default()
            });
        }
        self.build_chain(id, layers)
    }

    /// Stages a chain over the configured base disk even when no layer
    /// needs one. Used to boot a guest for plain directory layers.
    ///
    /// # Errors
    ///
    /// As [`WinVmPreparer::prepare_layers`].
    pub fn prepare_base(&self, id: &ContainerId, layers: &[Layer]) -> Result<WinVmPrepareResult> {
        layer::validate_layers(layers)?;
        self.build_chain(id, layers)
    }

    /// Deletes the result's staging directory. Call only once the guest
    /// using the chain has stopped. Repeated calls do nothing.
    pub fn prepare_result_destroy(&self, result: &mut WinVmPrepareResult) {
        result.boot_disk = None;
        let Some(dir) = result.staging_dir.take() else {
            return;
        };
        match tree::remove_tree(&dir) {
            Ok(()) => tracing::debug!(path = %dir.display(), "disk chain removed"),
            Err(e) => tracing::warn!(path = %dir.display(), error = %e, "failed to remove disk chain"),
        }
    }

    fn build_chain(&self, id: &ContainerId, layers: &[Layer]) -> Result<WinVmPrepareResult> {
        let dir = self.staging.vm_dir(id);
        if dir.exists() {
            tracing::warn!(%id, path = %dir.display(), "removing stale disk chain");
            mount::detach_all_under(&dir, &SysMounter)?;
            tree::remove_tree(&dir)?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| ContainervError::io(&dir, e))?;

        match self.fill_chain(&dir, layers) {
            Ok(result) => {
                tracing::info!(
                    %id,
                    staging = %dir.display(),
                    injected = result.applied_packages,
                    pending = result.layers.len(),
                    "disk chain staged"
                );
                Ok(result)
            }
            Err(e) => {
                if let Err(rm) = tree::remove_tree(&dir) {
                    tracing::warn!(%id, error = %rm, "failed to remove partial disk chain");
                }
                Err(e)
            }
        }
    }

    fn fill_chain(&self, dir: &Path, layers: &[Layer]) -> Result<WinVmPrepareResult> {
        let images: Vec<&Path> = layers
            .iter()
            .filter_map(|l| match &l.source {
                LayerSource::Image(path) => Some(path.as_path()),
                _ => None,
            })
            .collect();
        if images.len() > 1 {
            return Err(ContainervError::invalid(format!(
                "a VM disk chain takes one image layer, got {}",
                images.len()
            )));
        }
        let base = match images.last() {
            Some(path) => path.to_path_buf(),
            None => self.base_disk.clone().ok_or_else(|| {
                ContainervError::not_supported("no image layer and no base disk configured")
            })?,
        };
        let base = std::fs::canonicalize(&base).map_err(|_| ContainervError::NotFound {
            kind: "base disk",
            id: base.display().to_string(),
        })?;

        let app = dir.join(VM_APP_DISK);
        self.tool.create_differencing(&base, &app)?;

        let mut applied_packages = false;
        let mut pending = Vec::new();
        for (n, layer) in layers.iter().enumerate() {
            match &layer.source {
                LayerSource::Image(_) => {}
                LayerSource::Package(package) if self.tool.can_inject() => {
                    let unpacked = dir.join("packages").join(n.to_string());
                    std::fs::create_dir_all(&unpacked)
                        .map_err(|e| ContainervError::io(&unpacked, e))?;
                    package.unpack_to(&unpacked)?;
                    self.tool.inject(&app, &unpacked, &layer.target)?;
                    applied_packages = true;
                    tracing::debug!(
                        package = package.name(),
                        target = %layer.target.display(),
                        "package injected"
                    );
                }
                _ => pending.push(layer.clone()),
            }
        }

        let boot = dir.join(VM_BOOT_DISK);
        self.tool.create_differencing(&app, &boot)?;
        Ok(WinVmPrepareResult {
            staging_dir: Some(dir.to_path_buf()),
            boot_disk: Some(boot),
            applied_packages,
            layers: pending,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use containerv_image::package::TarPackage;

    use super::*;

    /// Disk tool that writes text files naming their backing disk.
    #[derive(Debug, Default)]
    pub(crate) struct FakeDiskTool {
        pub inject: bool,
        pub fail_boot_disk: bool,
        pub injected: Mutex<Vec<(PathBuf, Vec<String>)>>,
    }

    impl DiskTool for FakeDiskTool {
        fn create_differencing(&self, base: &Path, child: &Path) -> Result<()> {
            if self.fail_boot_disk && child.ends_with(VM_BOOT_DISK) {
                return Err(ContainervError::internal("qemu-img failed"));
            }
            std::fs::write(child, base.display().to_string())
                .map_err(|e| ContainervError::io(child, e))
        }

        fn can_inject(&self) -> bool {
            self.inject
        }

        fn inject(&self, _disk: &Path, source: &Path, target: &Path) -> Result<()> {
            let mut names: Vec<String> = std::fs::read_dir(source)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            self.injected.lock().unwrap().push((target.to_path_buf(), names));
            Ok(())
        }
    }

    fn preparer(root: &Path, tool: FakeDiskTool) -> WinVmPreparer {
        WinVmPreparer::new(StagingRoot::open(root.join("staging")).unwrap(), Arc::new(tool))
    }

    pub(crate) fn write_tar(path: &Path, files: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(std::fs::File::create(path).unwrap());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    fn package(dir: &Path) -> Layer {
        let path = dir.join("tools.tar");
        write_tar(&path, &[("bin/tool.exe", b"MZ")]);
        Layer::new(LayerSource::Package(Arc::new(TarPackage::open(path).unwrap()))).at("/Program Files")
    }

    fn image(dir: &Path) -> Layer {
        let path = dir.join("win.vhd");
        std::fs::write(&path, b"conectix").unwrap();
        Layer::new(LayerSource::Image(path))
    }

    #[test]
    fn no_eligible_layers_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let p = preparer(dir.path(), FakeDiskTool::default());
        let layers = vec![Layer::new(LayerSource::Directory(dir.path().to_path_buf()))];

        let result = p.prepare_layers(&ContainerId::new("c1"), &layers).unwrap();
        assert!(result.staging_dir.is_none());
        assert!(result.boot_disk.is_none());
        assert!(!result.applied_packages);
        assert_eq!(result.layers.len(), 1);
        assert!(!dir.path().join("staging/vm/c1").exists());
    }

    #[test]
    fn chain_links_boot_to_app_to_image() {
        let dir = tempfile::tempdir().unwrap();
        let p = preparer(dir.path(), FakeDiskTool::default());
        let layers = vec![image(dir.path()), package(dir.path())];

        let mut result = p.prepare_layers(&ContainerId::new("c1"), &layers).unwrap();
        let staging = result.staging_dir.clone().unwrap();
        let boot = result.boot_disk.clone().unwrap();
        let app = staging.join(VM_APP_DISK);
        assert_eq!(std::fs::read_to_string(&boot).unwrap(), app.display().to_string());
        assert!(std::fs::read_to_string(&app).unwrap().ends_with("win.vhd"));

        // Without injection the package waits for the guest.
        assert!(!result.applied_packages);
        assert_eq!(result.layers.len(), 1);
        assert!(matches!(result.layers[0].source, LayerSource::Package(_)));

        p.prepare_result_destroy(&mut result);
        assert!(!staging.exists());
        assert!(result.boot_disk.is_none());
        p.prepare_result_destroy(&mut result);
    }

    #[test]
    fn packages_are_injected_when_supported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeDiskTool {
            inject: true,
            ..FakeDiskTool::default()
        });
        let p = WinVmPreparer::new(
            StagingRoot::open(dir.path().join("staging")).unwrap(),
            Arc::clone(&tool) as Arc<dyn DiskTool>,
        );
        let layers = vec![image(dir.path()), package(dir.path())];

        let result = p.prepare_layers(&ContainerId::new("c1"), &layers).unwrap();
        assert!(result.applied_packages);
        assert!(result.layers.is_empty());
        let injected = tool.injected.lock().unwrap();
        assert_eq!(injected[0], (PathBuf::from("/Program Files"), vec!["bin".to_string()]));
    }

    #[test]
    fn configured_base_disk_stands_in_for_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cached.vhd");
        std::fs::write(&base, b"conectix").unwrap();
        let p = preparer(dir.path(), FakeDiskTool::default()).with_base_disk(Some(base));

        let result = p
            .prepare_layers(&ContainerId::new("c1"), &[package(dir.path())])
            .unwrap();
        let app = result.staging_dir.unwrap().join(VM_APP_DISK);
        assert!(std::fs::read_to_string(app).unwrap().ends_with("cached.vhd"));
    }

    #[test]
    fn missing_base_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let p = preparer(dir.path(), FakeDiskTool::default());
        let err = p
            .prepare_layers(&ContainerId::new("c1"), &[package(dir.path())])
            .unwrap_err();
        assert!(err.is_not_supported());
        assert!(!dir.path().join("staging/vm/c1").exists());
    }

    #[test]
    fn two_images_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = preparer(dir.path(), FakeDiskTool::default());
        let other = dir.path().join("other.vhd");
        std::fs::write(&other, b"x").unwrap();
        let layers = vec![image(dir.path()), Layer::new(LayerSource::Image(other))];
        assert!(matches!(
            p.prepare_layers(&ContainerId::new("c1"), &layers),
            Err(ContainervError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn failure_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let p = preparer(
            dir.path(),
            FakeDiskTool {
                fail_boot_disk: true,
                ..FakeDiskTool::default()
            },
        );
        let err = p
            .prepare_layers(&ContainerId::new("c1"), &[image(dir.path())])
            .unwrap_err();
        assert!(matches!(err, ContainervError::Internal { .. }));
        assert!(!dir.path().join("staging/vm/c1").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_chain_with_a_leftover_mount_spares_the_mounted_tree() {
        use containerv_core::filesystem::mount::Mounter;

        if !mount::can_mount() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let precious = dir.path().join("precious");
        std::fs::create_dir_all(&precious).unwrap();
        std::fs::write(precious.join("data"), b"host data").unwrap();
        let leftover = dir.path().join("staging/vm/c1/mnt");
        SysMounter.bind(&precious, &leftover, false).unwrap();

        let mut result = preparer(dir.path(), FakeDiskTool::default())
            .prepare_layers(&ContainerId::new("c1"), &[image(dir.path())])
            .unwrap();
        assert_eq!(std::fs::read(precious.join("data")).unwrap(), b"host data");
        assert!(!leftover.exists());
        preparer(dir.path(), FakeDiskTool::default()).prepare_result_destroy(&mut result);
    }

    #[test]
    fn formats_follow_extensions() {
        assert_eq!(disk_format(Path::new("a.VHD")), "vpc");
        assert_eq!(disk_format(Path::new("a.vhdx")), "vhdx");
        assert_eq!(disk_format(Path::new(VM_BOOT_DISK)), "qcow2");
        assert_eq!(disk_format(Path::new("a.img")), "raw");
    }
}
