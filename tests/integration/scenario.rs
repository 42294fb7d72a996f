//! Two routers from onboarding to reconciled sessions

use std::net::Ipv4Addr;

use router_fleet::alloc::TunnelAddressAllocator;
use router_fleet::model::{RouterId, SessionStatus};
use router_fleet::nat::{Chain, PortMapping};
use router_fleet::store::{RouterStore, SessionStore, StoreWrite, SubscriberStore};

use super::fixtures::{onboarded, Fleet, HUB, PUBLIC_HOST, TENANT};

const A: RouterId = RouterId(1);
const B: RouterId = RouterId(2);

async fn allocate_both(addresses: &TunnelAddressAllocator) -> (Ipv4Addr, Ipv4Addr) {
    let a = addresses.allocate(A).await.unwrap();
    let b = addresses.allocate(B).await.unwrap();
    (a, b)
}

#[tokio::test]
async fn test_addresses_and_ports_in_order() {
    let fleet = Fleet::new([onboarded(1), onboarded(2)]);

    let (a, b) = allocate_both(&fleet.addresses).await;
    assert_eq!(a, Ipv4Addr::new(10, 100, 0, 2));
    assert_eq!(b, Ipv4Addr::new(10, 100, 0, 3));

    assert_eq!(fleet.ports.allocate(A).await.unwrap(), 50000);
    assert_eq!(fleet.ports.allocate(B).await.unwrap(), 50001);

    let record = fleet.store.get_router(A).await.unwrap();
    assert_eq!(record.public_host.as_deref(), Some(PUBLIC_HOST));
}

#[tokio::test]
async fn test_ensure_mapping_installs_rule_triple() {
    let fleet = Fleet::new([onboarded(1), onboarded(2)]);
    allocate_both(&fleet.addresses).await;

    let report = fleet.nat.ensure_mapping(A).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.proxy_port, Some(50000));
    assert_eq!(report.tunnel_address, Some(Ipv4Addr::new(10, 100, 0, 2)));

    let rendered: Vec<String> = fleet.firewall.rules().iter().map(ToString::to_string).collect();
    assert_eq!(rendered.len(), 3);
    assert!(rendered.contains(
        &"-t nat PREROUTING -p tcp --dport 50000 -j DNAT --to-destination 10.100.0.2:8291".to_string()
    ));
    assert!(rendered.contains(
        &"-t nat POSTROUTING -p tcp -d 10.100.0.2 --dport 8291 -j SNAT --to-source 10.100.0.1"
            .to_string()
    ));
    assert!(rendered
        .contains(&"-t filter FORWARD -p tcp -d 10.100.0.2 --dport 8291 -j ACCEPT".to_string()));

    let forward = fleet
        .firewall
        .rules()
        .into_iter()
        .filter(|r| r.chain == Chain::Forward)
        .count();
    assert_eq!(forward, 1);
}

#[tokio::test]
async fn test_ensure_mapping_allocates_missing_resources() {
    let fleet = Fleet::new([onboarded(1)]);

    let report = fleet.nat.ensure_mapping(A).await.unwrap();
    let expected = PortMapping {
        proxy_port: 50000,
        tunnel_address: Ipv4Addr::new(10, 100, 0, 2),
        management_port: 8291,
        hub_address: HUB,
    };
    assert_eq!(report.proxy_port, Some(expected.proxy_port));
    for rule in expected.rules() {
        assert_eq!(fleet.firewall.count(&rule), 1, "{rule}");
    }
}

#[tokio::test]
async fn test_reconcile_cycles() {
    let fleet = Fleet::new([onboarded(1), onboarded(2)]);
    fleet.add_subscribers(&["alice", "bob"]);
    allocate_both(&fleet.addresses).await;
    fleet.transport.add_device("10.100.0.2");
    fleet.transport.add_device("10.100.0.3");

    // Cycle 1: both users appear on A
    fleet.transport.set_active_users("10.100.0.2", &["alice"], &["bob"]);
    let report = fleet.reconciler.reconcile_router(A).await.unwrap();
    assert_eq!(report.came_online, vec!["alice", "bob"]);
    assert_eq!(fleet.store.subscriber_online(TENANT, "alice").await.unwrap(), Some(true));
    assert_eq!(fleet.store.subscriber_online(TENANT, "bob").await.unwrap(), Some(true));

    // Cycle 2: bob leaves
    fleet.store.clear_journal();
    fleet.transport.set_active_users("10.100.0.2", &["alice"], &[]);
    let report = fleet.reconciler.reconcile_router(A).await.unwrap();
    assert_eq!(report.went_offline, vec!["bob"]);
    assert_eq!(report.unchanged, 1);

    let bob = fleet.store.session(A, "bob").await.unwrap().unwrap();
    assert_eq!(bob.status, SessionStatus::Deactivated);
    assert_eq!(fleet.store.subscriber_online(TENANT, "bob").await.unwrap(), Some(false));

    // alice received zero writes
    assert!(fleet.store.session_writes().iter().all(|w| match w {
        StoreWrite::SessionUpserted { username, .. }
        | StoreWrite::SessionDeactivated { username, .. }
        | StoreWrite::SubscriberOnlineSet { username, .. } => username != "alice",
        _ => true,
    }));
}

#[tokio::test]
async fn test_api_goes_through_tunnel_address() {
    let mut router = onboarded(1);
    router.public_host = Some("203.0.113.7".into());
    let fleet = Fleet::new([router]);
    fleet.addresses.allocate(A).await.unwrap();
    fleet.transport.add_device("10.100.0.2");

    fleet.reconciler.reconcile_router(A).await.unwrap();

    let connections = fleet.transport.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].host, Ipv4Addr::new(10, 100, 0, 2));
    assert_eq!(connections[0].port, 8728);
    assert_eq!(connections[0].credentials.username, "fleet-api");
}
