//! YAML-backed policy store.
//!
//! Every mutation is applied in memory first and then persisted
//! synchronously. A failed write is reported to the caller but the in-memory
//! change stays; the two converge on the next successful write or `reload`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use bwlimit_core::error::{BwError, Result};
use bwlimit_core::BandwidthLimit;

use crate::session::ConnectionId;

/// Maps a human alias to the connection currently using it.
pub trait AliasResolver {
    fn resolve_alias(&self, alias: &str) -> Option<ConnectionId>;
}

/// Resolver that knows no aliases.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAliases;

impl AliasResolver for NoAliases {
    fn resolve_alias(&self, _alias: &str) -> Option<ConnectionId> {
        None
    }
}

/// On-disk layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    pub default_limit: BandwidthLimit,
    #[serde(default)]
    pub overrides: BTreeMap<String, BandwidthLimit>,
}

#[derive(Debug, Clone)]
struct PolicyState {
    default: BandwidthLimit,
    overrides: HashMap<ConnectionId, BandwidthLimit>,
    /// Alias keys that matched no live connection at load time.
    unresolved: BTreeMap<String, BandwidthLimit>,
}

impl PolicyState {
    fn empty(default: BandwidthLimit) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            unresolved: BTreeMap::new(),
        }
    }

    fn from_file(file: PolicyFile, resolver: &dyn AliasResolver) -> Self {
        let mut state = Self::empty(file.default_limit);
        for (key, limit) in file.overrides {
            if let Ok(id) = key.parse::<ConnectionId>() {
                state.overrides.insert(id, limit);
            } else if let Some(id) = resolver.resolve_alias(&key) {
                tracing::debug!(alias = %key, conn_id = %id, "policy alias resolved");
                state.overrides.insert(id, limit);
            } else {
                state.unresolved.insert(key, limit);
            }
        }
        state
    }

    fn to_file(&self) -> PolicyFile {
        let mut overrides = self.unresolved.clone();
        for (id, limit) in &self.overrides {
            overrides.insert(id.to_string(), *limit);
        }
        PolicyFile {
            default_limit: self.default,
            overrides,
        }
    }
}

pub struct PolicyStore {
    path: PathBuf,
    fallback_default: BandwidthLimit,
    state: RwLock<PolicyState>,
    persist_lock: Mutex<()>,
}

impl PolicyStore {
    /// Load the policy at `path`. A missing file yields `fallback_default`
    /// and no overrides; the file is created on the first mutation.
    pub fn open(
        path: impl Into<PathBuf>,
        fallback_default: BandwidthLimit,
        resolver: &dyn AliasResolver,
    ) -> Result<Self> {
        let path = path.into();
        let state = read_state(&path, fallback_default, resolver)?;
        tracing::info!(
            path = %path.display(),
            default_limit = state.default.bytes_per_sec(),
            overrides = state.overrides.len(),
            unresolved = state.unresolved.len(),
            "policy loaded"
        );
        Ok(Self {
            path,
            fallback_default,
            state: RwLock::new(state),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &ConnectionId) -> Option<BandwidthLimit> {
        self.read().overrides.get(id).copied()
    }

    /// Override if present, else the default.
    pub fn effective(&self, id: &ConnectionId) -> BandwidthLimit {
        let state = self.read();
        state.overrides.get(id).copied().unwrap_or(state.default)
    }

    pub fn set(&self, id: ConnectionId, limit: BandwidthLimit) -> Result<()> {
        self.write().overrides.insert(id, limit);
        self.persist()
    }

    /// Drop an override. `Ok(false)` when there was none (nothing is written).
    pub fn remove(&self, id: &ConnectionId) -> Result<bool> {
        if self.write().overrides.remove(id).is_none() {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn get_default(&self) -> BandwidthLimit {
        self.read().default
    }

    pub fn set_default(&self, limit: BandwidthLimit) -> Result<()> {
        self.write().default = limit;
        self.persist()
    }

    /// Replace in-memory state with what is on disk. Does not touch live
    /// connections.
    pub fn reload(&self, resolver: &dyn AliasResolver) -> Result<()> {
        let fresh = read_state(&self.path, self.fallback_default, resolver)?;
        tracing::info!(
            path = %self.path.display(),
            default_limit = fresh.default.bytes_per_sec(),
            overrides = fresh.overrides.len(),
            unresolved = fresh.unresolved.len(),
            "policy reloaded"
        );
        *self.write() = fresh;
        Ok(())
    }

    pub fn overrides(&self) -> Vec<(ConnectionId, BandwidthLimit)> {
        let mut out: Vec<_> = self
            .read()
            .overrides
            .iter()
            .map(|(id, l)| (*id, *l))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn unresolved_aliases(&self) -> BTreeMap<String, BandwidthLimit> {
        self.read().unresolved.clone()
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = self.read().to_file();
        write_atomic(&self.path, &file).map_err(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "policy persist failed");
            e
        })
    }
}

fn read_state(
    path: &Path,
    fallback_default: BandwidthLimit,
    resolver: &dyn AliasResolver,
) -> Result<PolicyState> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PolicyState::empty(fallback_default));
        }
        Err(e) => {
            return Err(BwError::Persistence(format!(
                "read {} failed: {e}",
                path.display()
            )))
        }
    };
    let file: PolicyFile = serde_yaml::from_str(&text)
        .map_err(|e| BwError::BadConfig(format!("invalid policy file {}: {e}", path.display())))?;
    Ok(PolicyState::from_file(file, resolver))
}

fn write_atomic(path: &Path, file: &PolicyFile) -> Result<()> {
    let text = serde_yaml::to_string(file)
        .map_err(|e| BwError::Internal(format!("policy serialize failed: {e}")))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .map_err(|e| BwError::Persistence(format!("create {} failed: {e}", dir.display())))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, text)
        .map_err(|e| BwError::Persistence(format!("write {} failed: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| BwError::Persistence(format!("rename to {} failed: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(n: u64) -> BandwidthLimit {
        BandwidthLimit::from_bps(n).unwrap()
    }

    #[test]
    fn file_round_trip_keeps_unresolved_aliases() {
        let id = ConnectionId::new_random();
        let yaml = format!("default_limit: 1000\noverrides:\n  \"{id}\": 10\n  alice: 20\n");
        let file: PolicyFile = serde_yaml::from_str(&yaml).unwrap();
        let state = PolicyState::from_file(file, &NoAliases);

        assert_eq!(state.overrides.get(&id), Some(&limit(10)));
        assert_eq!(state.unresolved.get("alice"), Some(&limit(20)));

        let back = state.to_file();
        assert_eq!(back.overrides.len(), 2);
        assert_eq!(back.overrides.get("alice"), Some(&limit(20)));
    }

    #[test]
    fn zero_and_unknown_fields_rejected() {
        assert!(serde_yaml::from_str::<PolicyFile>("default_limit: 0\n").is_err());
        assert!(serde_yaml::from_str::<PolicyFile>("default_limit: 5\nextra: 1\n").is_err());
        assert!(serde_yaml::from_str::<PolicyFile>("default_limit: 5\noverrides:\n  bob: 0\n").is_err());
    }

    struct OneAlias(ConnectionId);

    impl AliasResolver for OneAlias {
        fn resolve_alias(&self, alias: &str) -> Option<ConnectionId> {
            (alias == "alice").then_some(self.0)
        }
    }

    #[test]
    fn live_alias_becomes_connection_override() {
        let id = ConnectionId::new_random();
        let file: PolicyFile =
            serde_yaml::from_str("default_limit: 1000\noverrides:\n  alice: 20\n  bob: 30\n").unwrap();
        let state = PolicyState::from_file(file, &OneAlias(id));
        assert_eq!(state.overrides.get(&id), Some(&limit(20)));
        assert_eq!(state.unresolved.len(), 1);
        assert!(state.unresolved.contains_key("bob"));
    }
}
