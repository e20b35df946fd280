#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;

use bwlimit_core::BandwidthLimit;
use bwlimit_gateway::policy::{AliasResolver, NoAliases, PolicyFile, PolicyStore};
use bwlimit_gateway::session::ConnectionId;

fn limit(n: u64) -> BandwidthLimit {
    BandwidthLimit::from_bps(n).unwrap()
}

#[test]
fn missing_file_uses_fallback_until_first_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.yaml");
    let store = PolicyStore::open(&path, limit(512_000), &NoAliases).unwrap();

    assert_eq!(store.get_default(), limit(512_000));
    assert!(store.overrides().is_empty());
    assert!(!path.exists());

    let id = ConnectionId::new_random();
    store.set(id, limit(1000)).unwrap();
    assert!(path.exists());

    let reopened = PolicyStore::open(&path, limit(1), &NoAliases).unwrap();
    assert_eq!(reopened.get_default(), limit(512_000));
    assert_eq!(reopened.get(&id), Some(limit(1000)));
}

#[test]
fn effective_is_override_or_default() {
    let dir = tempfile::tempdir().unwrap();
    let store = PolicyStore::open(dir.path().join("p.yaml"), limit(500), &NoAliases).unwrap();
    let id = ConnectionId::new_random();

    assert_eq!(store.effective(&id), limit(500));
    store.set(id, limit(100)).unwrap();
    assert_eq!(store.effective(&id), limit(100));
    store.set_default(limit(900)).unwrap();
    assert_eq!(store.effective(&id), limit(100));

    assert!(store.remove(&id).unwrap());
    assert!(!store.remove(&id).unwrap());
    assert_eq!(store.effective(&id), limit(900));
}

#[test]
fn reload_discards_memory_and_keeps_unresolved_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.yaml");
    let pinned = ConnectionId::new_random();
    fs::write(
        &path,
        format!("default_limit: 2048\noverrides:\n  \"{pinned}\": 64\n  alice: 128\n"),
    )
    .unwrap();

    let store = PolicyStore::open(&path, limit(1), &NoAliases).unwrap();
    assert_eq!(store.get(&pinned), Some(limit(64)));
    assert_eq!(store.unresolved_aliases().get("alice"), Some(&limit(128)));

    let other = ConnectionId::new_random();
    store.set(other, limit(7)).unwrap();

    // the write-back keeps the alias entry
    let on_disk: PolicyFile = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk.overrides.get("alice"), Some(&limit(128)));
    assert_eq!(on_disk.overrides.len(), 3);

    fs::write(&path, "default_limit: 4096\n").unwrap();
    store.reload(&NoAliases).unwrap();
    assert_eq!(store.get_default(), limit(4096));
    assert_eq!(store.get(&other), None);
    assert_eq!(store.get(&pinned), None);
    assert!(store.unresolved_aliases().is_empty());
}

struct Live(ConnectionId);

impl AliasResolver for Live {
    fn resolve_alias(&self, alias: &str) -> Option<ConnectionId> {
        (alias == "bob").then_some(self.0)
    }
}

#[test]
fn reload_resolves_live_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.yaml");
    fs::write(&path, "default_limit: 2048\noverrides:\n  bob: 300\n").unwrap();
    let store = PolicyStore::open(&path, limit(1), &NoAliases).unwrap();

    let bob = ConnectionId::new_random();
    assert_eq!(store.effective(&bob), limit(2048));

    store.reload(&Live(bob)).unwrap();
    assert_eq!(store.effective(&bob), limit(300));
    assert!(store.unresolved_aliases().is_empty());
}

#[test]
fn malformed_or_zero_policy_is_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.yaml");

    fs::write(&path, "default_limit: 0\n").unwrap();
    let err = PolicyStore::open(&path, limit(1), &NoAliases).err().unwrap();
    assert_eq!(err.kind().as_str(), "BAD_CONFIG");

    fs::write(&path, "default_limit: [1, 2]\n").unwrap();
    let err = PolicyStore::open(&path, limit(1), &NoAliases).err().unwrap();
    assert_eq!(err.kind().as_str(), "BAD_CONFIG");
}

#[test]
fn persistence_failure_keeps_in_memory_change() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("sub");
    let store = PolicyStore::open(sub.join("policy.yaml"), limit(500), &NoAliases).unwrap();
    // a plain file where the policy directory should be
    fs::write(&sub, "x").unwrap();

    let id = ConnectionId::new_random();
    let err = store.set(id, limit(50)).unwrap_err();
    assert_eq!(err.kind().as_str(), "PERSISTENCE_FAILED");
    assert_eq!(store.effective(&id), limit(50));

    let err = store.set_default(limit(60)).unwrap_err();
    assert_eq!(err.kind().as_str(), "PERSISTENCE_FAILED");
    assert_eq!(store.get_default(), limit(60));
}
