//! Policy map layout and stores.
//!
//! Two maps hold every container's policy, keyed per container by a
//! 64-bit cookie derived from its id:
//!
//! - rules: `(cookie, address, prefix, port)` → allow flag,
//! - quota: `cookie` → limits, counters, and the rootfs inode.
//!
//! [`MemoryMapStore`] keeps the same layout in process memory for hosts
//! without pinned maps and for tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;

use containerv_common::error::Result;
use containerv_common::types::ContainerId;
use sha2::{Digest, Sha256};

/// Derives the per-container map cookie from a container id.
#[must_use]
pub fn cookie(id: &ContainerId) -> u64 {
    let digest = Sha256::digest(id.as_str().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Address family tag stored in [`RuleKey::family`].
pub const FAMILY_INET: u8 = 4;
/// IPv6 family tag.
pub const FAMILY_INET6: u8 = 6;

/// Key of one allow rule.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    /// Owning container.
    pub cookie: u64,
    /// Address bytes; IPv4 uses the first four.
    pub addr: [u8; 16],
    /// Prefix length in bits.
    pub prefix: u8,
    /// [`FAMILY_INET`] or [`FAMILY_INET6`].
    pub family: u8,
    /// Port, 0 for any.
    pub port: u16,
    pad: [u8; 4],
}

impl RuleKey {
    /// Builds a rule for `addr`. A missing prefix covers the single address.
    #[must_use]
    pub fn new(cookie: u64, addr: IpAddr, prefix: Option<u8>, port: Option<u16>) -> Self {
        let mut bytes = [0u8; 16];
        let (family, full) = match addr {
            IpAddr::V4(v4) => {
                bytes[..4].copy_from_slice(&v4.octets());
                (FAMILY_INET, 32)
            }
            IpAddr::V6(v6) => {
                bytes.copy_from_slice(&v6.octets());
                (FAMILY_INET6, 128)
            }
        };
        Self {
            cookie,
            addr: bytes,
            prefix: prefix.unwrap_or(full),
            family,
            port: port.unwrap_or(0),
            pad: [0; 4],
        }
    }
}

/// Limits and counters of one container.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaEntry {
    /// Byte limit, 0 for unlimited.
    pub max_bytes: u64,
    /// Rate limit, 0 for unlimited.
    pub rate_bytes_per_sec: u64,
    /// Bytes sent so far.
    pub bytes_used: u64,
    /// Packets sent so far.
    pub packets: u64,
    /// Inode of the container's rootfs, tying the entry to one composition.
    pub rootfs_inode: u64,
}

/// Storage for the rule and quota maps.
pub trait MapStore: Send + fmt::Debug {
    /// Inserts or overwrites a rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the map update fails.
    fn insert_rule(&mut self, key: RuleKey) -> Result<()>;

    /// Removes every rule of `cookie`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be iterated or updated.
    fn remove_rules(&mut self, cookie: u64) -> Result<usize>;

    /// Counts the rules of `cookie`, or all rules for `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be iterated.
    fn rule_count(&self, cookie: Option<u64>) -> Result<usize>;

    /// Inserts or overwrites the quota entry of `cookie`.
    ///
    /// # Errors
    ///
    /// Returns an error if the map update fails.
    fn put_quota(&mut self, cookie: u64, entry: QuotaEntry) -> Result<()>;

    /// Reads the quota entry of `cookie`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails for a reason other than absence.
    fn quota(&self, cookie: u64) -> Result<Option<QuotaEntry>>;

    /// Removes the quota entry of `cookie`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the map update fails.
    fn remove_quota(&mut self, cookie: u64) -> Result<bool>;

    /// Every quota entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be iterated.
    fn quotas(&self) -> Result<Vec<(u64, QuotaEntry)>>;

    /// Verifies the backing objects are present and can be opened.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first object that is missing.
    fn check_pins(&self) -> Result<()>;
}

/// Process-local map store.
#[derive(Debug, Default)]
pub struct MemoryMapStore {
    rules: HashSet<RuleKey>,
    quota: HashMap<u64, QuotaEntry>,
}

impl MemoryMapStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MapStore for MemoryMapStore {
    fn insert_rule(&mut self, key: RuleKey) -> Result<()> {
        let _ = self.rules.insert(key);
        Ok(())
    }

    fn remove_rules(&mut self, cookie: u64) -> Result<usize> {
        let before = self.rules.len();
        self.rules.retain(|k| k.cookie != cookie);
        Ok(before - self.rules.len())
    }

    fn rule_count(&self, cookie: Option<u64>) -> Result<usize> {
        Ok(match cookie {
            Some(c) => self.rules.iter().filter(|k| k.cookie == c).count(),
            None => self.rules.len(),
        })
    }

    fn put_quota(&mut self, cookie: u64, entry: QuotaEntry) -> Result<()> {
        let _ = self.quota.insert(cookie, entry);
        Ok(())
    }

    fn quota(&self, cookie: u64) -> Result<Option<QuotaEntry>> {
        Ok(self.quota.get(&cookie).copied())
    }

    fn remove_quota(&mut self, cookie: u64) -> Result<bool> {
        Ok(self.quota.remove(&cookie).is_some())
    }

    fn quotas(&self) -> Result<Vec<(u64, QuotaEntry)>> {
        Ok(self.quota.iter().map(|(c, e)| (*c, *e)).collect())
    }

    fn check_pins(&self) -> Result<()> {
        Ok(())
    }
}
