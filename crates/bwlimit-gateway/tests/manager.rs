#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

//! Bandwidth manager driven against real connection contexts on a paused
//! clock.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::time::Instant;

use bwlimit_core::BandwidthLimit;
use bwlimit_gateway::bandwidth::{GatewayManager, ShapingStatus, STAGE_NAME};
use bwlimit_gateway::obs::metrics::GatewayMetrics;
use bwlimit_gateway::policy::{NoAliases, PolicyStore};
use bwlimit_gateway::session::{
    ConnectionContext, ConnectionId, ContextDiscovery, ContextHandle, SessionDirectory,
};

// 996 payload bytes + 4 header bytes = 1000 on the wire.
const FRAME: usize = 996;

struct Harness {
    manager: GatewayManager,
    metrics: Arc<GatewayMetrics>,
    policy_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        Self::open(dir, path)
    }

    fn open(dir: tempfile::TempDir, policy_path: PathBuf) -> Self {
        let policy = PolicyStore::open(
            &policy_path,
            BandwidthLimit::from_bps(512_000).unwrap(),
            &NoAliases,
        )
        .unwrap();
        let metrics = Arc::new(GatewayMetrics::default());
        let manager = GatewayManager::new(
            Arc::new(policy),
            ContextDiscovery,
            Duration::from_secs(1),
            Arc::clone(&metrics),
        );
        Self {
            manager,
            metrics,
            policy_path,
            _dir: dir,
        }
    }

    fn connect(&self, id: ConnectionId) -> (ContextHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4096);
        let (handle, _) = ConnectionContext::new(id, tx, Arc::clone(&self.metrics)).spawn();
        self.manager
            .on_connection_established(id, handle.clone(), false)
            .unwrap();
        (handle, rx)
    }
}

fn limit(n: u64) -> BandwidthLimit {
    BandwidthLimit::from_bps(n).unwrap()
}

fn numbered(i: u16) -> Message {
    let mut payload = vec![0u8; FRAME];
    payload[..2].copy_from_slice(&i.to_be_bytes());
    Message::Binary(payload)
}

fn number_of(msg: &Message) -> u16 {
    match msg {
        Message::Binary(b) => u16::from_be_bytes([b[0], b[1]]),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn install_uninstall_install_yields_one_stage() {
    let h = Harness::new();
    let id = ConnectionId::new_random();
    let (handle, _rx) = h.connect(id);

    assert!(h.manager.uninstall(&id));
    h.manager.install(id, &handle).unwrap();
    h.manager.install(id, &handle).unwrap();

    assert_eq!(handle.stage_names().await.unwrap(), vec!["encoder", STAGE_NAME]);
    assert_eq!(h.manager.installed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_is_unknown_until_first_window_completes() {
    let h = Harness::new();
    let id = ConnectionId::new_random();
    let (_handle, _rx) = h.connect(id);

    assert_eq!(h.manager.current_rate(&id), None);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(h.manager.current_rate(&id), Some(0));
}

#[tokio::test(start_paused = true)]
async fn megabyte_burst_is_split_across_windows_in_order() {
    let h = Harness::new();
    let id = ConnectionId::new_random();
    let (handle, mut rx) = h.connect(id);

    for i in 0..1000u16 {
        handle.write(numbered(i)).unwrap();
    }

    let start = Instant::now();
    let mut arrivals: BTreeMap<u64, usize> = BTreeMap::new();
    for expected in 0..1000u16 {
        let msg = rx.recv().await.unwrap();
        assert_eq!(number_of(&msg), expected);
        *arrivals.entry((Instant::now() - start).as_secs()).or_default() += 1;
    }

    assert_eq!(arrivals.get(&0), Some(&512));
    assert_eq!(arrivals.get(&1), Some(&488));
    assert_eq!(h.manager.current_rate(&id), Some(512_000));
    assert_eq!(h.metrics.writes.get(&[("path", "delayed")]), 488);
    assert_eq!(h.metrics.write_delay.count(&[]), 488);

    handle.record_read(300).unwrap();
    handle.stage_names().await.unwrap();
    let info = h.manager.info(&id);
    assert_eq!(info.total_written_bytes, Some(1_000_000));
    assert_eq!(info.total_read_bytes, Some(300));
}

#[tokio::test(start_paused = true)]
async fn override_slows_live_connection_without_disconnect() {
    let h = Harness::new();
    let id = ConnectionId::new_random();
    let (handle, mut rx) = h.connect(id);

    for i in 0..1000u16 {
        handle.write(numbered(i)).unwrap();
    }
    h.manager.set_override(id, limit(128_000)).unwrap();

    let start = Instant::now();
    let mut arrivals: BTreeMap<u64, usize> = BTreeMap::new();
    for expected in 0..1000u16 {
        let msg = rx.recv().await.unwrap();
        assert_eq!(number_of(&msg), expected);
        *arrivals.entry((Instant::now() - start).as_secs()).or_default() += 1;
    }

    assert_eq!(arrivals.get(&0), Some(&512));
    for (window, count) in arrivals.iter().skip(1) {
        assert!(*count <= 128, "window {window} carried {count} frames");
    }
    // two more windows roll past the limit change
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.manager.current_rate(&id).unwrap() <= 128_000);
    assert!(!handle.is_closed());
    assert_eq!(
        handle.stage_limits(STAGE_NAME).await.unwrap(),
        Some((128_000, 0))
    );
}

#[tokio::test(start_paused = true)]
async fn uninstall_flushes_queue_and_keeps_effective_limit() {
    let h = Harness::new();
    let id = ConnectionId::new_random();
    let (handle, mut rx) = h.connect(id);
    h.manager.set_override(id, limit(10_000)).unwrap();

    for i in 0..50u16 {
        handle.write(numbered(i)).unwrap();
    }
    assert!(h.manager.uninstall(&id));

    let start = Instant::now();
    for expected in 0..50u16 {
        assert_eq!(number_of(&rx.recv().await.unwrap()), expected);
    }
    assert_eq!(Instant::now(), start);

    assert_eq!(handle.stage_names().await.unwrap(), vec!["encoder"]);
    assert_eq!(h.manager.effective_limit(&id), limit(10_000));
    assert_eq!(h.manager.current_rate(&id), None);
    assert_eq!(h.manager.info(&id).status, ShapingStatus::NotInstalled);
}

#[tokio::test(start_paused = true)]
async fn install_on_closed_connection_is_unavailable() {
    let h = Harness::new();
    let id = ConnectionId::new_random();
    let (handle, _rx) = h.connect(id);
    h.manager.uninstall(&id);

    handle.close();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let err = h.manager.install(id, &handle).unwrap_err();
    assert_eq!(err.kind().as_str(), "CONNECTION_UNAVAILABLE");
    assert!(!h.manager.is_installed(&id));
}

#[tokio::test(start_paused = true)]
async fn default_change_reaches_connections_without_override() {
    let h = Harness::new();
    let plain = ConnectionId::new_random();
    let pinned = ConnectionId::new_random();
    let (hp, _rp) = h.connect(plain);
    let (hq, _rq) = h.connect(pinned);
    h.manager.set_override(pinned, limit(64_000)).unwrap();

    h.manager.set_default(limit(100_000)).unwrap();
    h.manager.set_default(limit(200_000)).unwrap();

    assert_eq!(h.manager.effective_limit(&plain), limit(200_000));
    assert_eq!(hp.stage_limits(STAGE_NAME).await.unwrap(), Some((200_000, 0)));
    assert_eq!(h.manager.effective_limit(&pinned), limit(64_000));
    assert_eq!(hq.stage_limits(STAGE_NAME).await.unwrap(), Some((64_000, 0)));

    h.manager.clear_override(&pinned).unwrap();
    assert_eq!(hq.stage_limits(STAGE_NAME).await.unwrap(), Some((200_000, 0)));
}

#[tokio::test(start_paused = true)]
async fn reconfigure_heals_missing_stage() {
    let h = Harness::new();
    let id = ConnectionId::new_random();
    let (handle, _rx) = h.connect(id);
    h.manager.uninstall(&id);

    h.manager.reconfigure(&id).unwrap();
    assert!(h.manager.is_installed(&id));
    assert_eq!(handle.stage_names().await.unwrap(), vec!["encoder", STAGE_NAME]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_detaches_everything_once() {
    let h = Harness::new();
    let a = ConnectionId::new_random();
    let b = ConnectionId::new_random();
    let (ha, _ra) = h.connect(a);
    let (_hb, _rb) = h.connect(b);

    h.manager.shutdown();
    h.manager.shutdown();

    assert_eq!(h.manager.installed_count(), 0);
    assert_eq!(h.manager.active_count(), 0);
    assert_eq!(ha.stage_names().await.unwrap(), vec!["encoder"]);
    assert_eq!(h.metrics.stage_uninstalls.get(&[]), 2);
}

#[tokio::test(start_paused = true)]
async fn reload_retunes_live_connections_and_resolves_aliases() {
    let h = Harness::new();
    let directory = SessionDirectory::new();
    let alice = ConnectionId::new_random();
    let bob = ConnectionId::new_random();
    let (ha, _ra) = h.connect(alice);
    let (hb, _rb) = h.connect(bob);
    directory.insert(alice, Some("alice".into()), ha.clone(), false).unwrap();
    directory.insert(bob, Some("bob".into()), hb.clone(), false).unwrap();

    fs::write(
        &h.policy_path,
        "default_limit: 100000\noverrides:\n  alice: 64000\n  carol: 32000\n",
    )
    .unwrap();
    let outcome = h.manager.reload(&directory).unwrap();

    assert_eq!(outcome.reconfigured, 2);
    assert!(outcome.failed.is_empty());
    assert_eq!(h.manager.effective_limit(&alice), limit(64_000));
    assert_eq!(ha.stage_limits(STAGE_NAME).await.unwrap(), Some((64_000, 0)));
    assert_eq!(hb.stage_limits(STAGE_NAME).await.unwrap(), Some((100_000, 0)));
    assert!(h.manager.policy().unresolved_aliases().contains_key("carol"));
}

#[tokio::test(start_paused = true)]
async fn failed_persist_keeps_change_and_retunes_stage() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("sub");
    let h = Harness::open(dir, sub.join("policy.yaml"));
    let id = ConnectionId::new_random();
    let (handle, _rx) = h.connect(id);
    // a plain file where the policy directory should be
    fs::write(&sub, "x").unwrap();

    let err = h.manager.set_override(id, limit(64_000)).unwrap_err();
    assert_eq!(err.kind().as_str(), "PERSISTENCE_FAILED");
    assert_eq!(h.manager.effective_limit(&id), limit(64_000));
    assert_eq!(handle.stage_limits(STAGE_NAME).await.unwrap(), Some((64_000, 0)));

    let other = ConnectionId::new_random();
    let (other_handle, _ro) = h.connect(other);
    let err = h.manager.set_default(limit(300_000)).unwrap_err();
    assert_eq!(err.kind().as_str(), "PERSISTENCE_FAILED");
    assert_eq!(h.manager.policy().get_default(), limit(300_000));
    assert_eq!(
        other_handle.stage_limits(STAGE_NAME).await.unwrap(),
        Some((300_000, 0))
    );
    assert_eq!(h.metrics.policy_persist_failures.get(&[]), 2);
}
