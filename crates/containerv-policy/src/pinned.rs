//! Map store backed by BPF maps pinned in bpffs.
//!
//! The maps are created and pinned by the policy loader; this store only
//! opens them by path and edits entries.

use std::path::{Path, PathBuf};

use aya::Pod;
use aya::maps::{HashMap as BpfHashMap, Map, MapData, MapError};
use containerv_common::constants::{POLICY_QUOTA_MAP, POLICY_RULE_MAP};
use containerv_common::error::{ContainervError, Result};

use crate::maps::{MapStore, QuotaEntry, RuleKey};

// SAFETY: both types are `repr(C)`, `Copy`, and made only of integers and
// byte arrays with no implicit padding, so every bit pattern is valid.
#[allow(unsafe_code)]
unsafe impl Pod for RuleKey {}
// SAFETY: see above.
#[allow(unsafe_code)]
unsafe impl Pod for QuotaEntry {}

/// Rule and quota maps opened from their pins.
#[derive(Debug)]
pub struct PinnedMapStore {
    pin_dir: PathBuf,
    rules: BpfHashMap<MapData, RuleKey, u8>,
    quota: BpfHashMap<MapData, u64, QuotaEntry>,
}

impl PinnedMapStore {
    /// Opens the pinned maps under `pin_dir`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a pin is missing or is not a hash map with the
    /// expected key and value sizes.
    pub fn open(pin_dir: &Path) -> Result<Self> {
        let store = Self {
            pin_dir: pin_dir.to_path_buf(),
            rules: open_map(&pin_dir.join(POLICY_RULE_MAP))?,
            quota: open_map(&pin_dir.join(POLICY_QUOTA_MAP))?,
        };
        tracing::info!(pin_dir = %pin_dir.display(), "pinned policy maps opened");
        Ok(store)
    }
}

fn open_map<K: Pod, V: Pod>(path: &Path) -> Result<BpfHashMap<MapData, K, V>> {
    let data = MapData::from_pin(path).map_err(|e| map_error("open pin", path, &e))?;
    BpfHashMap::try_from(Map::HashMap(data)).map_err(|e| map_error("open map", path, &e))
}

fn map_error(op: &str, path: &Path, e: &MapError) -> ContainervError {
    ContainervError::internal(format!("{op} {}: {e}", path.display()))
}

impl MapStore for PinnedMapStore {
    fn insert_rule(&mut self, key: RuleKey) -> Result<()> {
        self.rules
            .insert(key, 1u8, 0)
            .map_err(|e| map_error("insert rule", &self.pin_dir, &e))
    }

    fn remove_rules(&mut self, cookie: u64) -> Result<usize> {
        let keys = self
            .rules
            .keys()
            .filter_map(std::result::Result::ok)
            .filter(|k| k.cookie == cookie)
            .collect::<Vec<_>>();
        for key in &keys {
            match self.rules.remove(key) {
                Ok(()) | Err(MapError::KeyNotFound) => {}
                Err(e) => return Err(map_error("remove rule", &self.pin_dir, &e)),
            }
        }
        Ok(keys.len())
    }

    fn rule_count(&self, cookie: Option<u64>) -> Result<usize> {
        let mut count = 0;
        for key in self.rules.keys() {
            let key = key.map_err(|e| map_error("iterate rules", &self.pin_dir, &e))?;
            if cookie.is_none_or(|c| c == key.cookie) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn put_quota(&mut self, cookie: u64, entry: QuotaEntry) -> Result<()> {
        self.quota
            .insert(cookie, entry, 0)
            .map_err(|e| map_error("insert quota", &self.pin_dir, &e))
    }

    fn quota(&self, cookie: u64) -> Result<Option<QuotaEntry>> {
        match self.quota.get(&cookie, 0) {
            Ok(entry) => Ok(Some(entry)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(map_error("read quota", &self.pin_dir, &e)),
        }
    }

    fn remove_quota(&mut self, cookie: u64) -> Result<bool> {
        match self.quota.remove(&cookie) {
            Ok(()) => Ok(true),
            Err(MapError::KeyNotFound) => Ok(false),
            Err(e) => Err(map_error("remove quota", &self.pin_dir, &e)),
        }
    }

    fn quotas(&self) -> Result<Vec<(u64, QuotaEntry)>> {
        self.quota
            .iter()
            .map(|item| item.map_err(|e| map_error("iterate quota", &self.pin_dir, &e)))
            .collect()
    }

    fn check_pins(&self) -> Result<()> {
        for name in [POLICY_RULE_MAP, POLICY_QUOTA_MAP] {
            let path = self.pin_dir.join(name);
            let _ = MapData::from_pin(&path).map_err(|e| map_error("open pin", &path, &e))?;
        }
        Ok(())
    }
}
