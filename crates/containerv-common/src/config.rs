//! Global configuration model for the containerv runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{ContainervError, Result};

/// How layer sets are turned into a rootfs on the namespace backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositionMode {
    /// Overlay when the process may mount, copy otherwise.
    #[default]
    Auto,
    /// Always use overlay/bind mounts.
    Overlay,
    /// Always materialize layers by copying.
    Copy,
}

/// Settings for the VM-disk backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Cached base disk used when a layer set carries no disk image.
    pub base_disk: Option<PathBuf>,
    /// TCP port of the in-guest agent.
    pub guest_port: u16,
    /// Guest memory in MiB.
    pub memory_mb: u32,
    /// Guest CPU count.
    pub cpus: u32,
    /// Seconds to wait for the guest agent after boot.
    pub boot_timeout_secs: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            base_disk: None,
            guest_port: constants::DEFAULT_GUEST_PORT,
            memory_mb: constants::DEFAULT_VM_MEMORY_MB,
            cpus: constants::DEFAULT_VM_CPUS,
            boot_timeout_secs: constants::DEFAULT_VM_BOOT_TIMEOUT_SECS,
        }
    }
}

/// Root configuration for the containerv runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainervConfig {
    /// Base directory for containerv data.
    pub data_dir: PathBuf,
    /// Root of per-container staging directories.
    pub staging_dir: PathBuf,
    /// bpffs directory holding pinned policy maps.
    pub bpf_pin_dir: PathBuf,
    /// Grace period between SIGTERM and SIGKILL during teardown.
    pub grace_period_ms: u64,
    /// Rootfs composition strategy.
    pub composition: CompositionMode,
    /// VM-disk backend settings.
    pub vm: VmConfig,
}

impl Default for ContainervConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::data_dir().clone(),
            staging_dir: constants::default_staging_dir(),
            bpf_pin_dir: PathBuf::from(constants::DEFAULT_BPF_PIN_DIR),
            grace_period_ms: constants::DEFAULT_GRACE_PERIOD_MS,
            composition: CompositionMode::default(),
            vm: VmConfig::default(),
        }
    }
}

impl ContainervConfig {
    /// Loads configuration from a JSON file.
    ///
    /// A missing file yields the defaults; fields absent from the file keep
    /// their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ContainervError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Returns a configuration rooted under `root`, used by tests and
    /// embedded daemons that own a private directory.
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.to_path_buf(),
            staging_dir: root.join("staging"),
            bpf_pin_dir: root.join("bpf"),
            ..Self::default()
        }
    }

    /// Grace period as a [`Duration`].
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = ContainervConfig::load(&dir.path().join("absent.json")).expect("load");
        assert_eq!(cfg.grace_period_ms, constants::DEFAULT_GRACE_PERIOD_MS);
        assert_eq!(cfg.composition, CompositionMode::Auto);
    }

    #[test]
    fn load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "grace_period_ms": 10, "composition": "copy", "vm": { "cpus": 4 } }"#,
        )
        .expect("write");

        let cfg = ContainervConfig::load(&path).expect("load");
        assert_eq!(cfg.grace_period(), Duration::from_millis(10));
        assert_eq!(cfg.composition, CompositionMode::Copy);
        assert_eq!(cfg.vm.cpus, 4);
        assert_eq!(cfg.vm.guest_port, constants::DEFAULT_GUEST_PORT);
    }

    #[test]
    fn load_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            ContainervConfig::load(&path),
            Err(ContainervError::Serialization { .. })
        ));
    }

    #[test]
    fn rooted_at_places_everything_under_root() {
        let cfg = ContainervConfig::rooted_at(Path::new("/tmp/x"));
        assert_eq!(cfg.staging_dir, Path::new("/tmp/x/staging"));
        assert_eq!(cfg.bpf_pin_dir, Path::new("/tmp/x/bpf"));
    }
}
