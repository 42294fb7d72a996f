//! `wg` and `iptables` argv through a recording runner

use std::sync::Arc;

use router_fleet::alloc::{AddressPool, PortPool, ProxyPortAllocator, TunnelAddressAllocator};
use router_fleet::lock::RouterLocks;
use router_fleet::model::RouterId;
use router_fleet::nat::{IptablesFirewall, NatRuleManager, DEFAULT_MANAGEMENT_PORT};
use router_fleet::peer::{PeerLifecycleManager, WgCommandControl, DEFAULT_INTERFACE, DEFAULT_KEEPALIVE};
use router_fleet::store::MemoryStore;
use router_fleet::sync::SyncOrchestrator;
use router_fleet::system::{CommandOutput, RecordingCommandRunner};

use super::fixtures::{onboarded, HUB, KEYS, PUBLIC_HOST};

const ABSENT: &str = "iptables: Bad rule (does a matching rule exist in that chain?).\n";

fn peers_over(store: &Arc<MemoryStore>, runner: &Arc<RecordingCommandRunner>) -> Arc<PeerLifecycleManager> {
    let vpn = Arc::new(WgCommandControl::new(
        runner.clone(),
        "wg",
        vec!["wg-quick".into(), "save".into(), "{interface}".into()],
    ));
    Arc::new(PeerLifecycleManager::new(
        store.clone(),
        vpn,
        Arc::new(RouterLocks::default()),
        DEFAULT_INTERFACE,
        DEFAULT_KEEPALIVE,
    ))
}

fn nat_over(store: &Arc<MemoryStore>, runner: &Arc<RecordingCommandRunner>) -> NatRuleManager {
    NatRuleManager::new(
        store.clone(),
        Arc::new(TunnelAddressAllocator::new(
            AddressPool::new("10.100.0.0/24".parse().unwrap(), HUB).unwrap(),
            store.clone(),
        )),
        Arc::new(ProxyPortAllocator::new(
            PortPool::new(50000, 59999, []).unwrap(),
            PUBLIC_HOST,
            store.clone(),
        )),
        Arc::new(IptablesFirewall::new(runner.clone(), "iptables")),
        HUB,
        DEFAULT_MANAGEMENT_PORT,
    )
}

#[tokio::test]
async fn test_sync_runs_wg_then_one_save() {
    let mut first = onboarded(1);
    first.public_key = Some(KEYS[0].into());
    let mut second = onboarded(2);
    second.public_key = Some(KEYS[1].into());
    let store = Arc::new(MemoryStore::with_routers([first, second]));
    let runner = Arc::new(RecordingCommandRunner::new());
    let sync = SyncOrchestrator::new(store.clone(), peers_over(&store, &runner));

    let report = sync.sync_all().await.unwrap();
    assert!(report.is_clean());

    let mut lines = runner.command_lines();
    assert_eq!(lines.pop().as_deref(), Some("wg-quick save wg0"));
    lines.sort();
    let mut expected: Vec<String> = KEYS[..2]
        .iter()
        .map(|key| {
            format!("wg set wg0 peer {key} allowed-ips 10.100.0.0/24 persistent-keepalive 25")
        })
        .collect();
    expected.sort();
    assert_eq!(lines, expected);
}

#[tokio::test]
async fn test_failed_wg_leaves_router_failed() {
    let mut router = onboarded(1);
    router.public_key = Some(KEYS[0].into());
    let store = Arc::new(MemoryStore::with_routers([router]));
    let runner = Arc::new(RecordingCommandRunner::new());
    runner.push_output(Ok(CommandOutput::failed(1, "Unable to modify interface: No such device")));
    let peers = peers_over(&store, &runner);

    assert!(peers.apply(RouterId(1)).await.is_err());
    // No reload after a failed set
    assert_eq!(runner.command_lines().len(), 1);
}

#[tokio::test]
async fn test_remove_runs_wg_remove_and_save() {
    let mut router = onboarded(1);
    router.public_key = Some(KEYS[0].into());
    let store = Arc::new(MemoryStore::with_routers([router]));
    let runner = Arc::new(RecordingCommandRunner::new());

    peers_over(&store, &runner).remove(RouterId(1)).await.unwrap();
    assert_eq!(
        runner.command_lines(),
        vec![format!("wg set wg0 peer {} remove", KEYS[0]), "wg-quick save wg0".to_string()]
    );
}

#[tokio::test]
async fn test_ensure_mapping_iptables_sequence() {
    let store = Arc::new(MemoryStore::with_routers([onboarded(1)]));
    let runner = Arc::new(RecordingCommandRunner::new());
    // Fresh kernel table: each delete finds nothing, each insert succeeds
    for _ in 0..3 {
        runner.push_output(Ok(CommandOutput::failed(1, ABSENT)));
        runner.push_output(Ok(CommandOutput::ok()));
    }
    let nat = nat_over(&store, &runner);

    let report = nat.ensure_mapping(RouterId(1)).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.stats.absent, 3);
    assert_eq!(report.stats.installed, 3);

    assert_eq!(
        runner.command_lines(),
        vec![
            "iptables -w -t nat -D PREROUTING -p tcp --dport 50000 -j DNAT --to-destination 10.100.0.2:8291",
            "iptables -w -t nat -I PREROUTING -p tcp --dport 50000 -j DNAT --to-destination 10.100.0.2:8291",
            "iptables -w -t nat -D POSTROUTING -p tcp -d 10.100.0.2 --dport 8291 -j SNAT --to-source 10.100.0.1",
            "iptables -w -t nat -I POSTROUTING -p tcp -d 10.100.0.2 --dport 8291 -j SNAT --to-source 10.100.0.1",
            "iptables -w -t filter -D FORWARD -p tcp -d 10.100.0.2 --dport 8291 -j ACCEPT",
            "iptables -w -t filter -I FORWARD -p tcp -d 10.100.0.2 --dport 8291 -j ACCEPT",
        ]
    );
}

#[tokio::test]
async fn test_iptables_failure_counted_not_raised() {
    let store = Arc::new(MemoryStore::with_routers([onboarded(1)]));
    let runner = Arc::new(RecordingCommandRunner::new());
    runner.push_output(Ok(CommandOutput::failed(1, ABSENT)));
    runner.push_output(Ok(CommandOutput::failed(4, "iptables: Resource temporarily unavailable.")));
    let nat = nat_over(&store, &runner);

    let report = nat.ensure_mapping(RouterId(1)).await.unwrap();
    assert_eq!(report.stats.errors, 1);
    assert_eq!(report.stats.installed, 2);
    assert_eq!(runner.command_lines().len(), 6);
}
