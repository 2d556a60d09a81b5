//! Rootfs composition from an ordered layer list.
//!
//! Layers merge left to right: directories merge recursively, files replace
//! wholesale. A layer placed at `/` also contributes to every deeper target,
//! in its position in the list. A writable layer owns its target outright.
//! Two strategies produce the same view:
//!
//! - [`Strategy::Overlay`] mounts each target, as an `OverlayFS` over the
//!   directories visible there with a scratch upper in the staging area, or
//!   as a bind mount when a single directory makes up the target.
//! - [`Strategy::Copy`] materializes every target into the staging rootfs.
//!   It needs no privilege and is what unprivileged hosts and tests use.
//!
//! Every mount is recorded so [`Composer::decompose`] can undo them in
//! exact reverse order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use containerv_common::config::CompositionMode;
use containerv_common::error::{ContainervError, Result};
use containerv_common::types::ContainerId;
use containerv_core::filesystem::mount::{self, MountKind, MountTable, Mounter, SysMounter};
use containerv_core::filesystem::overlayfs::{OverlayConfig, OverlayUpper};
use containerv_core::filesystem::tree::{self, TreeStats};
use containerv_core::identity::UserMapper;

use crate::layer::{self, Layer, LayerSource};
use crate::package;
use crate::storage::{StagingArea, StagingRoot};

/// How layers become a rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Bind and overlay mounts over the layer directories.
    Overlay,
    /// Worklist copy into the staging rootfs.
    Copy,
}

impl Strategy {
    /// Picks a strategy for the configured mode. `Auto` mounts when the
    /// process can.
    #[must_use]
    pub fn select(mode: CompositionMode) -> Self {
        match mode {
            CompositionMode::Overlay => Self::Overlay,
            CompositionMode::Copy => Self::Copy,
            CompositionMode::Auto if mount::can_mount() => Self::Overlay,
            CompositionMode::Auto => Self::Copy,
        }
    }
}

/// A composed rootfs and everything needed to take it apart.
#[derive(Debug)]
pub struct Composition {
    id: ContainerId,
    area: StagingArea,
    mounts: MountTable,
    stats: TreeStats,
    kept_staging: bool,
}

impl Composition {
    /// Owning container.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Path of the composed view. Valid until decomposition.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.area.rootfs()
    }

    /// The container's staging area.
    #[must_use]
    pub const fn staging(&self) -> &StagingArea {
        &self.area
    }

    /// Mounts made for this composition, in creation order.
    #[must_use]
    pub const fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Entry counts of the composed view.
    #[must_use]
    pub const fn stats(&self) -> TreeStats {
        self.stats
    }

    /// Whether the staging area was left behind because a mount inside it
    /// could not be released.
    #[must_use]
    pub const fn kept_staging(&self) -> bool {
        self.kept_staging
    }
}

/// A layer resolved to a host directory.
#[derive(Debug)]
struct Resolved {
    target: PathBuf,
    dir: PathBuf,
    writable: bool,
}

/// Everything visible at one target.
#[derive(Debug)]
struct TargetGroup {
    target: PathBuf,
    /// Bottom to top.
    lowers: Vec<PathBuf>,
    writable: bool,
}

/// Builds rootfs views from layer lists.
#[derive(Debug, Clone)]
pub struct Composer {
    strategy: Strategy,
    staging: StagingRoot,
    mounter: Arc<dyn Mounter>,
    identity: Option<UserMapper>,
}

impl Composer {
    /// Creates a composer that mounts through the real syscalls.
    #[must_use]
    pub fn new(strategy: Strategy, staging: StagingRoot) -> Self {
        Self {
            strategy,
            staging,
            mounter: Arc::new(SysMounter),
            identity: None,
        }
    }

    /// Replaces the mounter.
    #[must_use]
    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    /// Re-owns materialized files to this mapper's real identity.
    #[must_use]
    pub fn with_identity(mut self, identity: UserMapper) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Active strategy.
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Staging root shared by all compositions.
    #[must_use]
    pub const fn staging(&self) -> &StagingRoot {
        &self.staging
    }

    /// Composes `layers` into a rootfs for `id`.
    ///
    /// The layer list is validated before anything is created. On failure
    /// every mount made so far is undone and the staging area deleted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a conflicting layer list, `NotFound` for a
    /// missing source, `Corrupt` for an undecodable package, or the error of
    /// the failing mount or copy.
    pub fn compose(&self, id: &ContainerId, layers: &[Layer]) -> Result<Composition> {
        layer::validate_layers(layers)?;
        let area = self.staging.create_area(id)?;
        let mut mounts = MountTable::new();

        match self.build(&area, layers, &mut mounts) {
            Ok(stats) => {
                tracing::info!(
                    %id,
                    rootfs = %area.rootfs().display(),
                    layers = layers.len(),
                    mounts = mounts.len(),
                    files = stats.files,
                    bytes = stats.bytes,
                    "rootfs composed"
                );
                Ok(Composition {
                    id: id.clone(),
                    area,
                    mounts,
                    stats,
                    kept_staging: false,
                })
            }
            Err(e) => {
                tracing::debug!(%id, error = %e, "composition failed, unwinding");
                let mut partial = Composition {
                    id: id.clone(),
                    area,
                    mounts,
                    stats: TreeStats::default(),
                    kept_staging: false,
                };
                self.decompose(&mut partial);
                Err(e)
            }
        }
    }

    /// Undoes a composition: unmounts in reverse order, then deletes the
    /// staging area. Failures are logged and never returned. Calling it
    /// again does nothing.
    pub fn decompose(&self, composition: &mut Composition) {
        let _ = self.release_mounts(composition);
        self.release_staging(composition);
    }

    /// Unmounts everything the composition mounted, newest first. Returns
    /// how many unmounts failed; a failure keeps the staging area in place.
    pub fn release_mounts(&self, composition: &mut Composition) -> usize {
        let failures = composition.mounts.unwind(self.mounter.as_ref());
        if failures > 0 {
            composition.kept_staging = true;
        }
        failures
    }

    /// Deletes the staging area unless a mount inside it is still live.
    pub fn release_staging(&self, composition: &mut Composition) {
        if composition.kept_staging {
            // A live mount under the area would let the removal reach into
            // the mounted source.
            tracing::warn!(
                id = %composition.id,
                path = %composition.area.path().display(),
                "mounts still active, keeping staging area"
            );
            return;
        }
        if let Err(e) = composition.area.remove() {
            tracing::warn!(id = %composition.id, error = %e, "failed to remove staging area");
        }
    }

    fn build(&self, area: &StagingArea, layers: &[Layer], mounts: &mut MountTable) -> Result<TreeStats> {
        let resolved = layers
            .iter()
            .enumerate()
            .map(|(n, l)| self.resolve(area, n, l))
            .collect::<Result<Vec<_>>>()?;
        let groups = group_by_target(&resolved);
        let rootfs = area.rootfs();

        match self.strategy {
            Strategy::Copy => {
                for group in &groups {
                    let dest = rootfs.join(&group.target);
                    if !group.target.as_os_str().is_empty() {
                        // A nested target starts over from its own lowers,
                        // which already carry what its parents put there.
                        tree::remove_tree(&dest)?;
                    }
                    for dir in &group.lowers {
                        let _ = tree::copy_merge(dir, &dest)?;
                    }
                }
                if let Some(identity) = &self.identity {
                    let _ = identity.fix_ownership(&rootfs)?;
                }
            }
            Strategy::Overlay => {
                for (n, group) in groups.iter().enumerate() {
                    let nested = groups
                        .iter()
                        .any(|g| g.target != group.target && g.target.starts_with(&group.target));
                    self.mount_group(area, n, group, nested, mounts)?;
                }
            }
        }
        tree::tree_stats(&rootfs)
    }

    fn resolve(&self, area: &StagingArea, n: usize, layer: &Layer) -> Result<Resolved> {
        let dir = match &layer.source {
            LayerSource::Directory(path) => {
                if !path.is_dir() {
                    return Err(ContainervError::NotFound {
                        kind: "layer directory",
                        id: path.display().to_string(),
                    });
                }
                path.clone()
            }
            LayerSource::Image(path) if path.is_dir() => path.clone(),
            LayerSource::Image(path) if path.exists() => {
                return Err(ContainervError::not_supported(format!(
                    "disk image layers need the VM-disk backend: {}",
                    path.display()
                )));
            }
            LayerSource::Image(path) => {
                return Err(ContainervError::NotFound {
                    kind: "image",
                    id: path.display().to_string(),
                });
            }
            LayerSource::Package(pkg) => {
                package::unpack_cached(pkg.as_ref(), &self.staging.packages_dir())?
            }
            LayerSource::Files(entries) => {
                let dir = area.layer_dir(n);
                layer::materialize_files(entries, &dir)?;
                if let Some(identity) = &self.identity {
                    let _ = identity.fix_ownership(&dir)?;
                }
                dir
            }
        };
        tracing::debug!(kind = layer.source.kind(), dir = %dir.display(), "layer resolved");
        Ok(Resolved {
            target: layer::normalize_target(&layer.target)?,
            dir,
            writable: layer.writable,
        })
    }

    fn mount_group(
        &self,
        area: &StagingArea,
        n: usize,
        group: &TargetGroup,
        nested: bool,
        mounts: &mut MountTable,
    ) -> Result<()> {
        let mount_point = area.rootfs().join(&group.target);
        std::fs::create_dir_all(&mount_point).map_err(|e| ContainervError::io(&mount_point, e))?;

        let bind = match group.lowers.as_slice() {
            [single] if group.writable => Some((single.clone(), false)),
            [single] if !nested => Some((single.clone(), true)),
            lowers if overlapping(lowers) => Some((self.flatten(area, n, lowers)?, false)),
            _ => None,
        };
        if let Some((source, readonly)) = bind {
            self.mounter.bind(&source, &mount_point, readonly)?;
            mounts.push(mount_point, MountKind::Bind { readonly });
            return Ok(());
        }

        let upper = OverlayUpper {
            upper_dir: area.upper(n),
            work_dir: area.work(n),
        };
        for dir in [&upper.upper_dir, &upper.work_dir] {
            std::fs::create_dir_all(dir).map_err(|e| ContainervError::io(dir, e))?;
        }
        let config = OverlayConfig {
            lower_dirs: group.lowers.clone(),
            upper: Some(upper),
            merged_dir: mount_point.clone(),
        };
        self.mounter.overlay(&config)?;
        mounts.push(mount_point, MountKind::Overlay);
        Ok(())
    }

    /// Merges `lowers` into the target's scratch directory. The kernel
    /// rejects overlay lower directories nested inside one another.
    fn flatten(&self, area: &StagingArea, n: usize, lowers: &[PathBuf]) -> Result<PathBuf> {
        let flat = area.upper(n);
        for dir in lowers {
            let _ = tree::copy_merge(dir, &flat)?;
        }
        if let Some(identity) = &self.identity {
            let _ = identity.fix_ownership(&flat)?;
        }
        tracing::debug!(dir = %flat.display(), lowers = lowers.len(), "overlapping layers flattened");
        Ok(flat)
    }
}

/// Groups layers by target, parents before children, first appearance
/// order otherwise.
fn group_by_target(resolved: &[Resolved]) -> Vec<TargetGroup> {
    let mut targets: Vec<&Path> = Vec::new();
    for r in resolved {
        if !targets.contains(&r.target.as_path()) {
            targets.push(&r.target);
        }
    }
    let mut groups: Vec<TargetGroup> = targets
        .into_iter()
        .map(|target| {
            let owner = resolved.iter().find(|r| r.writable && r.target == target);
            TargetGroup {
                target: target.to_path_buf(),
                lowers: owner.map_or_else(|| lowers_at(resolved, target), |r| vec![r.dir.clone()]),
                writable: owner.is_some(),
            }
        })
        .collect();
    groups.sort_by_key(|g| g.target.components().count());
    groups
}

/// Directories visible at `target` in layer order: the layers placed there
/// and the matching sub-tree of every layer placed above it. A directory
/// listed twice keeps only its later position.
fn lowers_at(resolved: &[Resolved], target: &Path) -> Vec<PathBuf> {
    let mut lowers: Vec<PathBuf> = Vec::new();
    for r in resolved {
        let Ok(rest) = target.strip_prefix(&r.target) else {
            continue;
        };
        let dir = if rest.as_os_str().is_empty() {
            r.dir.clone()
        } else {
            let sub = r.dir.join(rest);
            match std::fs::symlink_metadata(&sub) {
                Ok(meta) if meta.is_dir() => sub,
                _ => continue,
            }
        };
        lowers.retain(|d| *d != dir);
        lowers.push(dir);
    }
    lowers
}

/// Whether any directory sits inside another one of the list.
fn overlapping(dirs: &[PathBuf]) -> bool {
    dirs.iter()
        .enumerate()
        .any(|(i, a)| dirs[i + 1..].iter().any(|b| a.starts_with(b) || b.starts_with(a)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::layer::FileEntry;
    use crate::package::TarPackage;
    use crate::package::tests::write_archive;

    #[derive(Debug, Default)]
    struct FakeMounter {
        log: Mutex<Vec<(&'static str, PathBuf)>>,
        lowers: Mutex<Vec<Vec<PathBuf>>>,
        fail_at: Option<usize>,
    }

    impl FakeMounter {
        fn failing_at(n: usize) -> Self {
            Self {
                fail_at: Some(n),
                ..Self::default()
            }
        }

        fn record(&self, op: &'static str, target: &Path) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            let mounts = log.iter().filter(|(op, _)| *op != "unmount").count();
            if op != "unmount" && self.fail_at == Some(mounts) {
                return Err(ContainervError::PermissionDenied {
                    message: "injected".into(),
                });
            }
            log.push((op, target.to_path_buf()));
            Ok(())
        }

        fn ops(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().iter().map(|(op, _)| *op).collect()
        }
    }

    impl Mounter for FakeMounter {
        fn bind(&self, _source: &Path, target: &Path, readonly: bool) -> Result<()> {
            self.record(if readonly { "bind-ro" } else { "bind-rw" }, target)
        }

        fn overlay(&self, config: &OverlayConfig) -> Result<()> {
            self.record("overlay", &config.merged_dir)?;
            self.lowers.lock().unwrap().push(config.lower_dirs.clone());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.record("unmount", target)
        }
    }

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        tree::walk(root, |path, meta| {
            if meta.is_file() {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                let _ = files.insert(rel, std::fs::read(path).unwrap());
            }
            Ok(())
        })
        .unwrap();
        files
    }

    struct Fixture {
        dir: tempfile::TempDir,
        base: PathBuf,
        app: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let app = dir.path().join("app");
        write(&base.join("etc/os-release"), "base");
        write(&base.join("bin/sh"), "sh");
        write(&app.join("etc/os-release"), "app");
        write(&app.join("srv/app/main"), "main");
        Fixture { dir, base, app }
    }

    fn copy_composer(fx: &Fixture) -> Composer {
        let staging = StagingRoot::open(fx.dir.path().join("staging")).unwrap();
        Composer::new(Strategy::Copy, staging)
    }

    fn overlay_composer(fx: &Fixture, mounter: Arc<FakeMounter>) -> Composer {
        let staging = StagingRoot::open(fx.dir.path().join("staging")).unwrap();
        Composer::new(Strategy::Overlay, staging).with_mounter(mounter)
    }

    /// A directory meant for `/srv` whose `app/main` the root-level `app`
    /// layer later replaces.
    fn tools(fx: &Fixture) -> PathBuf {
        let tools = fx.dir.path().join("tools");
        write(&tools.join("bin/tool"), "tool");
        write(&tools.join("app/main"), "tools");
        tools
    }

    #[test]
    fn later_layers_shadow_earlier_ones() {
        let fx = fixture();
        let composer = copy_composer(&fx);
        let layers = [
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Directory(fx.app.clone())),
        ];

        let comp = composer.compose(&ContainerId::new("c1"), &layers).expect("compose");
        let root = comp.rootfs();
        assert_eq!(std::fs::read_to_string(root.join("etc/os-release")).unwrap(), "app");
        assert!(root.join("bin/sh").is_file());
        assert!(root.join("srv/app/main").is_file());
        assert_eq!(comp.stats().files, 3);
    }

    #[test]
    fn composing_an_unchanged_layer_set_is_idempotent() {
        let fx = fixture();
        let composer = copy_composer(&fx);
        let archive = fx.dir.path().join("tools.tar.gz");
        write_archive(&archive, &[("bin/tool", b"tool")], true);
        let pkg = Arc::new(TarPackage::open(&archive).unwrap());
        let layers = [
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Package(pkg)).at("/opt/tools"),
        ];
        let id = ContainerId::new("c1");

        let mut first = composer.compose(&id, &layers).expect("first");
        let before = snapshot(&first.rootfs());
        composer.decompose(&mut first);
        let second = composer.compose(&id, &layers).expect("second");

        assert_eq!(snapshot(&second.rootfs()), before);
        assert!(before.contains_key(Path::new("opt/tools/bin/tool")));
    }

    #[test]
    fn file_lists_are_materialized() {
        let fx = fixture();
        let composer = copy_composer(&fx);
        let conf = fx.dir.path().join("resolv.conf");
        write(&conf, "nameserver 10.0.0.1");
        let layers = [
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Files(vec![
                FileEntry {
                    host: conf,
                    dest: "resolv.conf".into(),
                },
                FileEntry {
                    host: fx.app.join("srv"),
                    dest: "srv".into(),
                },
            ]))
            .at("/etc"),
        ];

        let comp = composer.compose(&ContainerId::new("c1"), &layers).expect("compose");
        let root = comp.rootfs();
        assert!(root.join("etc/resolv.conf").is_file());
        assert!(root.join("etc/srv/app/main").is_file());
        assert!(root.join("etc/os-release").is_file());
    }

    #[test]
    fn image_with_file_list_fails_before_staging() {
        let fx = fixture();
        let composer = copy_composer(&fx);
        let layers = [
            Layer::new(LayerSource::Image(fx.base.clone())),
            Layer::new(LayerSource::Files(Vec::new())),
        ];
        let id = ContainerId::new("c1");

        let err = composer.compose(&id, &layers).expect_err("conflict");
        assert!(matches!(err, ContainervError::InvalidSpec { .. }));
        assert!(!composer.staging().container_dir(&id).exists());
    }

    #[test]
    fn missing_source_is_not_found_and_leaves_nothing() {
        let fx = fixture();
        let composer = copy_composer(&fx);
        let layers = [
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Directory(fx.dir.path().join("missing"))),
        ];
        let id = ContainerId::new("c1");

        let err = composer.compose(&id, &layers).expect_err("missing");
        assert!(matches!(err, ContainervError::NotFound { .. }));
        assert!(!composer.staging().container_dir(&id).exists());
    }

    #[test]
    fn corrupt_package_is_reported() {
        let fx = fixture();
        let composer = copy_composer(&fx);
        let archive = fx.dir.path().join("broken.tar");
        std::fs::write(&archive, "garbage ".repeat(200)).unwrap();
        let layers = [Layer::new(LayerSource::Package(Arc::new(
            TarPackage::open(&archive).unwrap(),
        )))];

        let err = composer.compose(&ContainerId::new("c1"), &layers).expect_err("corrupt");
        assert!(matches!(err, ContainervError::Corrupt { .. }));
    }

    #[test]
    fn overlay_strategy_records_mounts_parents_first() {
        let fx = fixture();
        let out = fx.dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let composer = overlay_composer(&fx, mounter.clone());
        let layers = [
            Layer::new(LayerSource::Directory(tools(&fx))).at("/srv"),
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Directory(fx.app.clone())),
            Layer::new(LayerSource::Directory(out)).at("/out").writable(),
        ];

        let mut comp = composer.compose(&ContainerId::new("c1"), &layers).expect("compose");
        assert_eq!(mounter.ops(), ["overlay", "overlay", "bind-rw"]);
        let targets: Vec<_> = comp.mounts().records().iter().map(|r| r.target.clone()).collect();
        assert_eq!(targets[0], comp.rootfs());
        assert!(comp.staging().upper(0).is_dir());

        composer.decompose(&mut comp);
        let log = mounter.log.lock().unwrap();
        let unmounted: Vec<_> = log
            .iter()
            .filter(|(op, _)| *op == "unmount")
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(unmounted, targets.into_iter().rev().collect::<Vec<_>>());
        assert!(!comp.staging().exists());
    }

    #[test]
    fn nested_target_merges_parent_layers_in_layer_order() {
        let fx = fixture();
        let tools = tools(&fx);
        let layers = [
            Layer::new(LayerSource::Directory(tools.clone())).at("/srv"),
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Directory(fx.app.clone())),
        ];

        let mounter = Arc::new(FakeMounter::default());
        let _mounted = overlay_composer(&fx, mounter.clone())
            .compose(&ContainerId::new("c1"), &layers)
            .expect("overlay");
        assert_eq!(
            *mounter.lowers.lock().unwrap(),
            vec![
                vec![fx.base.clone(), fx.app.clone()],
                vec![tools, fx.app.join("srv")],
            ]
        );

        let copied = copy_composer(&fx)
            .compose(&ContainerId::new("c2"), &layers)
            .expect("copy");
        let root = copied.rootfs();
        assert_eq!(std::fs::read_to_string(root.join("srv/app/main")).unwrap(), "main");
        assert!(root.join("srv/bin/tool").is_file());
        assert_eq!(std::fs::read_to_string(root.join("etc/os-release")).unwrap(), "app");
    }

    #[test]
    fn file_list_below_a_root_layer_keeps_its_siblings() {
        let fx = fixture();
        let conf = fx.dir.path().join("resolv.conf");
        write(&conf, "nameserver 10.0.0.1");
        let layers = [
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Files(vec![FileEntry {
                host: conf,
                dest: "resolv.conf".into(),
            }]))
            .at("/etc"),
        ];

        let mounter = Arc::new(FakeMounter::default());
        let comp = overlay_composer(&fx, mounter.clone())
            .compose(&ContainerId::new("c1"), &layers)
            .expect("compose");
        assert_eq!(mounter.ops(), ["overlay", "overlay"]);
        assert_eq!(
            mounter.lowers.lock().unwrap()[1],
            vec![fx.base.join("etc"), comp.staging().layer_dir(1)]
        );
    }

    #[test]
    fn reused_directory_is_flattened() {
        let fx = fixture();
        let mounter = Arc::new(FakeMounter::default());
        let layers = [
            Layer::new(LayerSource::Directory(fx.app.clone())).at("/srv"),
            Layer::new(LayerSource::Directory(fx.app.clone())),
        ];

        let comp = overlay_composer(&fx, mounter.clone())
            .compose(&ContainerId::new("c1"), &layers)
            .expect("compose");
        assert_eq!(mounter.ops(), ["overlay", "bind-rw"]);
        let flat = comp.staging().upper(1);
        assert!(flat.join("etc/os-release").is_file());
        assert!(flat.join("srv/app/main").is_file());
        assert!(flat.join("app/main").is_file());
    }

    #[test]
    fn single_root_layer_with_nested_target_gets_overlay() {
        let fx = fixture();
        let mounter = Arc::new(FakeMounter::default());
        let composer = Composer::new(
            Strategy::Overlay,
            StagingRoot::open(fx.dir.path().join("staging")).unwrap(),
        )
        .with_mounter(mounter.clone());
        let layers = [
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Directory(fx.app.clone())).at("/srv"),
        ];

        let _comp = composer.compose(&ContainerId::new("c1"), &layers).expect("compose");
        assert_eq!(mounter.ops(), ["overlay", "bind-ro"]);
    }

    #[test]
    fn failed_mount_unwinds_earlier_mounts() {
        let fx = fixture();
        let mounter = Arc::new(FakeMounter::failing_at(1));
        let composer = Composer::new(
            Strategy::Overlay,
            StagingRoot::open(fx.dir.path().join("staging")).unwrap(),
        )
        .with_mounter(mounter.clone());
        let layers = [
            Layer::new(LayerSource::Directory(fx.base.clone())),
            Layer::new(LayerSource::Directory(fx.app.clone())).at("/srv"),
        ];
        let id = ContainerId::new("c1");

        let err = composer.compose(&id, &layers).expect_err("injected failure");
        assert!(matches!(err, ContainervError::PermissionDenied { .. }));
        assert_eq!(mounter.ops(), ["overlay", "unmount"]);
        assert!(!composer.staging().container_dir(&id).exists());
    }

    #[test]
    fn decompose_twice_is_a_noop() {
        let fx = fixture();
        let composer = copy_composer(&fx);
        let layers = [Layer::new(LayerSource::Directory(fx.base.clone()))];
        let mut comp = composer.compose(&ContainerId::new("c1"), &layers).expect("compose");

        composer.decompose(&mut comp);
        composer.decompose(&mut comp);
        assert!(!comp.staging().exists());
        assert!(!comp.kept_staging());
    }

    fn staging_mounts(composer: &Composer) -> Vec<PathBuf> {
        let root = std::fs::canonicalize(composer.staging().root()).unwrap();
        mount::mounts_under(&root).unwrap()
    }

    #[test]
    fn mounted_view_matches_copied_view() {
        if !mount::can_mount() {
            return;
        }
        let fx = fixture();
        let conf = fx.dir.path().join("resolv.conf");
        write(&conf, "nameserver 10.0.0.1");
        let cases = [
            vec![
                Layer::new(LayerSource::Directory(fx.base.clone())),
                Layer::new(LayerSource::Files(vec![FileEntry {
                    host: conf,
                    dest: "resolv.conf".into(),
                }]))
                .at("/etc"),
            ],
            vec![
                Layer::new(LayerSource::Directory(tools(&fx))).at("/srv"),
                Layer::new(LayerSource::Directory(fx.base.clone())),
                Layer::new(LayerSource::Directory(fx.app.clone())),
            ],
            vec![
                Layer::new(LayerSource::Directory(fx.app.clone())).at("/srv"),
                Layer::new(LayerSource::Directory(fx.app.clone())),
            ],
        ];
        let copier = copy_composer(&fx);
        let overlay = Composer::new(
            Strategy::Overlay,
            StagingRoot::open(fx.dir.path().join("mounted")).unwrap(),
        );

        for (n, layers) in cases.iter().enumerate() {
            let id = ContainerId::new(format!("c{n}"));
            let mut copied = copier.compose(&id, layers).expect("copy");
            let mut mounted = overlay.compose(&id, layers).expect("overlay");
            assert_eq!(snapshot(&mounted.rootfs()), snapshot(&copied.rootfs()), "case {n}");

            overlay.decompose(&mut mounted);
            copier.decompose(&mut copied);
            assert!(!mounted.kept_staging());
            assert!(!mounted.staging().exists());
        }
        assert!(staging_mounts(&overlay).is_empty());
        assert_eq!(std::fs::read_to_string(fx.base.join("etc/os-release")).unwrap(), "base");
    }

    #[test]
    fn stale_area_mounts_are_detached_before_removal() {
        if !mount::can_mount() {
            return;
        }
        let fx = fixture();
        let composer = copy_composer(&fx);
        let id = ContainerId::new("c1");
        let precious = fx.dir.path().join("precious");
        write(&precious.join("data"), "host data");
        let leftover = composer.staging().container_dir(&id).join("rootfs/out");
        SysMounter.bind(&precious, &leftover, false).expect("bind");

        let mut comp = composer
            .compose(&id, &[Layer::new(LayerSource::Directory(fx.base.clone()))])
            .expect("compose");
        assert_eq!(std::fs::read_to_string(precious.join("data")).unwrap(), "host data");
        assert!(!comp.rootfs().join("out").exists());
        assert!(staging_mounts(&composer).is_empty());
        composer.decompose(&mut comp);
    }

    #[test]
    fn auto_mode_matches_mount_capability() {
        let expected = if mount::can_mount() {
            Strategy::Overlay
        } else {
            Strategy::Copy
        };
        assert_eq!(Strategy::select(CompositionMode::Auto), expected);
        assert_eq!(Strategy::select(CompositionMode::Copy), Strategy::Copy);
    }
}
