use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use dashmap::{DashMap, DashSet};

use bwlimit_core::error::{BwError, Result};

use crate::policy::AliasResolver;
use crate::session::{ConnectionId, ContextHandle};

#[derive(Debug, Clone)]
struct SessionEntry {
    alias: Option<String>,
    handle: ContextHandle,
    bypass: bool,
    created_seq: u64,
}

/// Snapshot of one live session.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub conn_id: ConnectionId,
    pub alias: Option<String>,
    pub bypass: bool,
}

/// Live sessions:
/// - `conn_id -> SessionEntry`
/// - `alias -> {conn_id...}`
#[derive(Default)]
pub struct SessionDirectory {
    sessions: DashMap<ConnectionId, SessionEntry>,
    alias_index: DashMap<String, DashSet<ConnectionId>>,
    seq: AtomicU64,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            alias_index: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    /// Register a session. A live session with the same id is an error.
    pub fn insert(
        &self,
        conn_id: ConnectionId,
        alias: Option<String>,
        handle: ContextHandle,
        bypass: bool,
    ) -> Result<()> {
        let created_seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.sessions.entry(conn_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BwError::InvalidArgument(format!(
                    "connection {conn_id} is already live"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(SessionEntry {
                    alias: alias.clone(),
                    handle,
                    bypass,
                    created_seq,
                });
            }
        }
        if let Some(alias) = alias {
            self.alias_index
                .entry(alias)
                .or_insert_with(DashSet::new)
                .insert(conn_id);
        }
        Ok(())
    }

    pub fn remove(&self, conn_id: &ConnectionId) -> Option<ContextHandle> {
        let (_, entry) = self.sessions.remove(conn_id)?;
        if let Some(alias) = &entry.alias {
            if let Some(set) = self.alias_index.get(alias) {
                set.remove(conn_id);
                if set.is_empty() {
                    drop(set);
                    self.alias_index.remove(alias);
                }
            }
        }
        Some(entry.handle)
    }

    pub fn handle(&self, conn_id: &ConnectionId) -> Option<ContextHandle> {
        self.sessions.get(conn_id).map(|r| r.value().handle.clone())
    }

    pub fn get(&self, conn_id: &ConnectionId) -> Option<SessionView> {
        self.sessions.get(conn_id).map(|r| SessionView {
            conn_id: *r.key(),
            alias: r.value().alias.clone(),
            bypass: r.value().bypass,
        })
    }

    /// All live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionView> {
        let mut rows: Vec<(u64, SessionView)> = self
            .sessions
            .iter()
            .map(|r| {
                (
                    r.value().created_seq,
                    SessionView {
                        conn_id: *r.key(),
                        alias: r.value().alias.clone(),
                        bypass: r.value().bypass,
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queue `msg` on every session except `from`. Returns how many accepted it.
    pub fn broadcast_except(&self, from: &ConnectionId, msg: &Message) -> usize {
        let targets: Vec<ContextHandle> = self
            .sessions
            .iter()
            .filter(|r| r.key() != from)
            .map(|r| r.value().handle.clone())
            .collect();
        targets
            .into_iter()
            .filter(|h| h.write(msg.clone()).is_ok())
            .count()
    }
}

impl AliasResolver for SessionDirectory {
    /// Oldest live session carrying `alias`.
    fn resolve_alias(&self, alias: &str) -> Option<ConnectionId> {
        let set = self.alias_index.get(alias)?;
        let ids: Vec<ConnectionId> = set.iter().map(|id| *id.key()).collect();
        drop(set);

        ids.into_iter()
            .filter_map(|id| self.sessions.get(&id).map(|e| (e.value().created_seq, id)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, id)| id)
    }
}
