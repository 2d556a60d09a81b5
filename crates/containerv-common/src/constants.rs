//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for containerv data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/containerv";

/// Returns the data directory, preferring the system path when it is
/// writable and falling back to `$HOME/.containerv` otherwise.
fn resolve_data_dir() -> PathBuf {
    let system = PathBuf::from(SYSTEM_DATA_DIR);
    if std::fs::create_dir_all(&system).is_ok() {
        return system;
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        let user_dir = PathBuf::from(home).join(".containerv");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    std::env::temp_dir().join("containerv")
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this process.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default staging root for composed rootfs trees and disk chains.
pub fn default_staging_dir() -> PathBuf {
    data_dir().join("staging")
}

/// Default path of the JSON configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/containerv/config.json";

/// bpffs directory holding the pinned policy maps.
pub const DEFAULT_BPF_PIN_DIR: &str = "/sys/fs/bpf/containerv";

/// Name of the pinned rule map (destination allow-list entries).
pub const POLICY_RULE_MAP: &str = "policy_rules";

/// Name of the pinned quota/counter map.
pub const POLICY_QUOTA_MAP: &str = "policy_quota";

/// Grace period between SIGTERM and SIGKILL during teardown.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2000;

/// Poll interval while waiting for processes to exit after SIGTERM.
pub const REAP_POLL_INTERVAL_MS: u64 = 50;

/// Marker written once a package layer has been fully unpacked.
pub const UNPACK_COMPLETE_MARKER: &str = ".containerv-unpacked";

/// File name of the composed boot disk inside a VM staging directory.
pub const VM_BOOT_DISK: &str = "boot.qcow2";

/// File name of the application-layer disk inside a VM staging directory.
pub const VM_APP_DISK: &str = "app.qcow2";

/// Default TCP port the guest agent listens on.
pub const DEFAULT_GUEST_PORT: u16 = 10809;

/// Default guest memory in MiB.
pub const DEFAULT_VM_MEMORY_MB: u32 = 1024;

/// Default guest CPU count.
pub const DEFAULT_VM_CPUS: u32 = 2;

/// Default time to wait for a guest agent to answer after boot.
pub const DEFAULT_VM_BOOT_TIMEOUT_SECS: u64 = 60;

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Maximum number of layers in a single container.
pub const MAX_LAYERS: usize = 128;

/// Application name used in log fields and directory names.
pub const APP_NAME: &str = "containerv";
