//! Forwarding rule sets stay exact across repeated ensures and rebuilds

use router_fleet::model::RouterId;
use router_fleet::nat::Chain;
use router_fleet::store::{RouterStore, StoreWrite};

use super::fixtures::{onboarded, Fleet};

const A: RouterId = RouterId(1);

#[tokio::test]
async fn test_double_ensure_leaves_one_triple() {
    let fleet = Fleet::new([onboarded(1)]);

    fleet.nat.ensure_mapping(A).await.unwrap();
    let second = fleet.nat.ensure_mapping(A).await.unwrap();

    assert_eq!(fleet.firewall.rules().len(), 3);
    assert_eq!(second.stats.deleted, 3);
    assert_eq!(second.stats.installed, 3);
}

#[tokio::test]
async fn test_second_ensure_allocates_nothing() {
    let fleet = Fleet::new([onboarded(1)]);
    fleet.nat.ensure_mapping(A).await.unwrap();
    fleet.store.clear_journal();

    fleet.nat.ensure_mapping(A).await.unwrap();
    assert!(fleet.store.writes().iter().all(|w| !w.is_pool_write()));
    assert!(!fleet.store.writes().contains(&StoreWrite::PublicHostSet(A)));
}

#[tokio::test]
async fn test_rebuild_after_restart() {
    let fleet = Fleet::new([onboarded(1), onboarded(2), onboarded(3)]);
    fleet.nat.ensure_mapping(A).await.unwrap();
    fleet.nat.ensure_mapping(RouterId(2)).await.unwrap();

    // Same records, empty kernel tables
    let restarted = Fleet::with_store(fleet.store.clone());
    fleet.store.clear_journal();
    let report = restarted.nat.rebuild_all().await.unwrap();

    assert_eq!(report.rebuilt, vec![A, RouterId(2)]);
    assert_eq!(report.skipped, 1);
    assert_eq!(restarted.firewall.rules().len(), 6);
    assert!(fleet.store.writes().is_empty(), "rebuild must not allocate");

    // Rebuilding again keeps exactly one copy of each rule
    restarted.nat.rebuild_all().await.unwrap();
    assert_eq!(restarted.firewall.rules().len(), 6);
}

#[tokio::test]
async fn test_rule_failure_does_not_abort() {
    let fleet = Fleet::new([onboarded(1)]);
    fleet.firewall.fail_inserts_into(Chain::Forward);

    let report = fleet.nat.ensure_mapping(A).await.unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.stats.installed, 2);
    assert_eq!(report.stats.errors, 1);
    assert_eq!(fleet.firewall.rules().len(), 2);
}

#[tokio::test]
async fn test_remove_mapping_releases_port_keeps_address() {
    let fleet = Fleet::new([onboarded(1), onboarded(2)]);
    fleet.nat.ensure_mapping(A).await.unwrap();

    let report = fleet.nat.remove_mapping(A).await.unwrap();
    assert_eq!(report.stats.deleted, 3);
    assert!(fleet.firewall.rules().is_empty());

    let record = fleet.store.get_router(A).await.unwrap();
    assert!(record.proxy_port.is_none());
    assert!(record.public_host.is_none());
    assert_eq!(record.tunnel_address.as_deref(), Some("10.100.0.2"));

    // The freed port goes to the next router
    assert_eq!(fleet.ports.allocate(RouterId(2)).await.unwrap(), 50000);

    // Removing twice is harmless
    let again = fleet.nat.remove_mapping(A).await.unwrap();
    assert_eq!(again.stats.deleted, 0);
}
