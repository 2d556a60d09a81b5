//! Policy backends.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use containerv_common::error::{ContainervError, Result};
use containerv_common::types::ContainerId;
use serde::{Deserialize, Serialize};

use crate::maps::{self, MapStore, QuotaEntry, RuleKey};
use crate::spec::PolicySpec;

/// Whether policy can be enforced on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyStatus {
    /// No enforcement mechanism exists; containers run unrestricted.
    NotSupported,
    /// Rules are enforced.
    Available,
    /// A mechanism exists but failed to initialize.
    Error,
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported => write!(f, "not-supported"),
            Self::Available => write!(f, "available"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Totals across every container with a policy entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetrics {
    /// Containers with an entry.
    pub containers: usize,
    /// Installed allow rules.
    pub rules: usize,
    /// Bytes sent.
    pub bytes: u64,
    /// Packets sent.
    pub packets: u64,
}

/// Policy state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    /// Container.
    pub id: ContainerId,
    /// Installed allow rules.
    pub rules: usize,
    /// Bytes sent.
    pub bytes_used: u64,
    /// Packets sent.
    pub packets: u64,
    /// Byte limit, 0 for unlimited.
    pub max_bytes: u64,
    /// Rate limit, 0 for unlimited.
    pub rate_bytes_per_sec: u64,
}

/// Enforcement operations of a policy mechanism.
pub trait PolicyBackend: Send + Sync + fmt::Debug {
    /// Status this backend reports.
    fn status(&self) -> PolicyStatus;

    /// Installs `spec` for `id`, replacing any earlier policy of `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` if a destination does not resolve, or the
    /// backend's failure. Nothing is left installed on error.
    fn populate_policy(&self, id: &ContainerId, rootfs: &Path, spec: &PolicySpec) -> Result<()>;

    /// Removes the policy of `id`. Succeeds if none was installed.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    fn cleanup_policy(&self, id: &ContainerId) -> Result<()>;

    /// Reads totals without resetting counters.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    fn get_metrics(&self) -> Result<PolicyMetrics>;

    /// Reads one container's state without resetting counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a container without an entry.
    fn get_container_metrics(&self, id: &ContainerId) -> Result<ContainerMetrics>;

    /// Verifies the backing objects exist and open. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns the first missing object.
    fn sanity_check_pins(&self) -> Result<()>;
}

/// Backend for hosts without enforcement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPolicyBackend;

impl PolicyBackend for NoOpPolicyBackend {
    fn status(&self) -> PolicyStatus {
        PolicyStatus::NotSupported
    }

    fn populate_policy(&self, id: &ContainerId, _rootfs: &Path, _spec: &PolicySpec) -> Result<()> {
        Err(ContainervError::not_supported(format!(
            "policy enforcement unavailable for {id}"
        )))
    }

    fn cleanup_policy(&self, _id: &ContainerId) -> Result<()> {
        Ok(())
    }

    fn get_metrics(&self) -> Result<PolicyMetrics> {
        Err(ContainervError::not_supported("policy metrics unavailable"))
    }

    fn get_container_metrics(&self, _id: &ContainerId) -> Result<ContainerMetrics> {
        Err(ContainervError::not_supported("policy metrics unavailable"))
    }

    fn sanity_check_pins(&self) -> Result<()> {
        Ok(())
    }
}

/// Backend that writes rules into a [`MapStore`].
#[derive(Debug)]
pub struct BpfPolicyBackend<S> {
    store: Mutex<S>,
}

impl<S: MapStore> BpfPolicyBackend<S> {
    /// Wraps a map store.
    pub const fn new(store: S) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>> {
        self.store
            .lock()
            .map_err(|_| ContainervError::internal("policy map lock poisoned"))
    }
}

#[cfg(unix)]
fn rootfs_inode(rootfs: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(rootfs).map_or(0, |m| m.ino())
}

#[cfg(not(unix))]
fn rootfs_inode(_rootfs: &Path) -> u64 {
    0
}

impl<S: MapStore> PolicyBackend for BpfPolicyBackend<S> {
    fn status(&self) -> PolicyStatus {
        PolicyStatus::Available
    }

    fn populate_policy(&self, id: &ContainerId, rootfs: &Path, spec: &PolicySpec) -> Result<()> {
        let cookie = maps::cookie(id);
        let mut keys = Vec::new();
        for dest in &spec.destinations {
            for addr in dest.resolve()? {
                keys.push(RuleKey::new(cookie, addr, dest.prefix, dest.port));
            }
        }
        let entry = QuotaEntry {
            max_bytes: spec.quota.max_bytes.unwrap_or(0),
            rate_bytes_per_sec: spec.quota.rate_bytes_per_sec.unwrap_or(0),
            rootfs_inode: rootfs_inode(rootfs),
            ..QuotaEntry::default()
        };

        let mut store = self.lock()?;
        let _ = store.remove_rules(cookie)?;
        let installed = keys
            .iter()
            .try_for_each(|k| store.insert_rule(*k))
            .and_then(|()| store.put_quota(cookie, entry));
        if let Err(e) = installed {
            let _ = store.remove_rules(cookie);
            let _ = store.remove_quota(cookie);
            return Err(e);
        }
        tracing::info!(%id, rules = keys.len(), "policy installed");
        Ok(())
    }

    fn cleanup_policy(&self, id: &ContainerId) -> Result<()> {
        let cookie = maps::cookie(id);
        let mut store = self.lock()?;
        let rules = store.remove_rules(cookie)?;
        let had_entry = store.remove_quota(cookie)?;
        if had_entry || rules > 0 {
            tracing::debug!(%id, rules, "policy removed");
        }
        Ok(())
    }

    fn get_metrics(&self) -> Result<PolicyMetrics> {
        let store = self.lock()?;
        let quotas = store.quotas()?;
        Ok(PolicyMetrics {
            containers: quotas.len(),
            rules: store.rule_count(None)?,
            bytes: quotas.iter().map(|(_, q)| q.bytes_used).sum(),
            packets: quotas.iter().map(|(_, q)| q.packets).sum(),
        })
    }

    fn get_container_metrics(&self, id: &ContainerId) -> Result<ContainerMetrics> {
        let cookie = maps::cookie(id);
        let store = self.lock()?;
        let entry = store.quota(cookie)?.ok_or_else(|| ContainervError::NotFound {
            kind: "policy entry",
            id: id.to_string(),
        })?;
        Ok(ContainerMetrics {
            id: id.clone(),
            rules: store.rule_count(Some(cookie))?,
            bytes_used: entry.bytes_used,
            packets: entry.packets,
            max_bytes: entry.max_bytes,
            rate_bytes_per_sec: entry.rate_bytes_per_sec,
        })
    }

    fn sanity_check_pins(&self) -> Result<()> {
        self.lock()?.check_pins()
    }
}
