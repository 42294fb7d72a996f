//! Reconciliation against live devices through the API client

use router_fleet::model::{RouterId, SessionStatus};
use router_fleet::reconcile::{SessionReconciler, UnreachablePolicy};
use router_fleet::store::{RouterStore, SessionStore, StoreWrite, SubscriberStore};

use super::fixtures::{onboarded, Fleet, TENANT};

const R1: &str = "10.100.0.2";
const R2: &str = "10.100.0.3";

async fn two_router_fleet() -> Fleet {
    let fleet = Fleet::new([onboarded(1), onboarded(2)]);
    fleet.add_subscribers(&["alice", "bob", "carol"]);
    fleet.addresses.allocate(RouterId(1)).await.unwrap();
    fleet.addresses.allocate(RouterId(2)).await.unwrap();
    fleet.transport.add_device(R1);
    fleet.transport.add_device(R2);
    fleet
}

async fn online(fleet: &Fleet, name: &str) -> Option<bool> {
    fleet.store.subscriber_online(TENANT, name).await.unwrap()
}

#[tokio::test]
async fn test_device_names_are_normalized() {
    let fleet = two_router_fleet().await;
    fleet.transport.set_active_users(R1, &["  Alice"], &["BOB "]);

    let report = fleet.reconciler.reconcile_router(RouterId(1)).await.unwrap();
    assert_eq!(report.came_online, vec!["alice", "bob"]);

    let active = fleet.store.active_usernames(RouterId(1)).await.unwrap();
    assert!(active.contains("alice") && active.contains("bob"));
}

#[tokio::test]
async fn test_roaming_user_stays_online() {
    let fleet = two_router_fleet().await;
    fleet.transport.set_active_users(R1, &["alice"], &[]);
    fleet.reconciler.reconcile_fleet().await.unwrap();

    // alice moves from R1 to R2 between cycles
    fleet.transport.set_active_users(R1, &[], &[]);
    fleet.transport.set_active_users(R2, &[], &["alice"]);
    fleet.store.clear_journal();
    let fleet_report = fleet.reconciler.reconcile_fleet().await.unwrap();

    assert!(fleet_report.failed.is_empty());
    assert_eq!(online(&fleet, "alice").await, Some(true));
    assert!(!fleet.store.writes().contains(&StoreWrite::SubscriberOnlineSet {
        tenant: TENANT,
        username: "alice".into(),
        online: false,
    }));
    let on_r1 = fleet.store.session(RouterId(1), "alice").await.unwrap().unwrap();
    assert_eq!(on_r1.status, SessionStatus::Deactivated);
    let on_r2 = fleet.store.session(RouterId(2), "alice").await.unwrap().unwrap();
    assert_eq!(on_r2.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_steady_state_cycle_writes_no_sessions() {
    let fleet = two_router_fleet().await;
    fleet.transport.set_active_users(R1, &["alice", "bob"], &[]);
    fleet.transport.set_active_users(R2, &["carol"], &[]);
    fleet.reconciler.reconcile_fleet().await.unwrap();
    fleet.store.clear_journal();

    let report = fleet.reconciler.reconcile_fleet().await.unwrap();
    assert!(fleet.store.session_writes().is_empty());
    assert_eq!(report.reports.iter().map(|r| r.unchanged).sum::<usize>(), 3);

    // Poll outcomes are still recorded
    assert!(fleet
        .store
        .writes()
        .contains(&StoreWrite::PollRecorded { router: RouterId(1), online: true }));
}

#[tokio::test]
async fn test_unreachable_router_default_policy() {
    let fleet = two_router_fleet().await;
    fleet.transport.set_active_users(R1, &["alice"], &[]);
    fleet.transport.set_active_users(R2, &["bob"], &[]);
    fleet.reconciler.reconcile_fleet().await.unwrap();

    fleet.transport.set_unreachable(R1, true);
    let report = fleet.reconciler.reconcile_fleet().await.unwrap();

    assert_eq!(report.unreachable(), 1);
    assert_eq!(online(&fleet, "alice").await, Some(false));
    assert_eq!(online(&fleet, "bob").await, Some(true));
    assert!(!fleet.store.get_router(RouterId(1)).await.unwrap().online);
    assert!(fleet.store.get_router(RouterId(2)).await.unwrap().online);
}

#[tokio::test]
async fn test_unreachable_router_skip_policy() {
    let fleet = two_router_fleet().await;
    fleet.transport.set_active_users(R1, &["alice"], &[]);
    let reconciler = SessionReconciler::new(
        fleet.store.clone(),
        fleet.store.clone(),
        fleet.store.clone(),
        fleet.client.clone(),
    )
    .with_policy(UnreachablePolicy::Skip);
    reconciler.reconcile_fleet().await.unwrap();

    fleet.transport.set_unreachable(R1, true);
    let report = reconciler.reconcile_router(RouterId(1)).await.unwrap();

    assert!(report.skipped);
    assert_eq!(online(&fleet, "alice").await, Some(true));
}

#[tokio::test]
async fn test_router_without_address_is_unreachable_not_fatal() {
    let fleet = Fleet::new([onboarded(1), onboarded(2)]);
    fleet.add_subscribers(&["alice"]);
    // Only router 2 gets an address: the first in the pool
    fleet.addresses.allocate(RouterId(2)).await.unwrap();
    let r2_host = R1;
    fleet.transport.add_device(r2_host);
    fleet.transport.set_active_users(r2_host, &["alice"], &[]);

    let report = fleet.reconciler.reconcile_fleet().await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(report.reports[0].router_id, RouterId(1));
    assert!(!report.reports[0].reachable);
    assert!(report.reports[1].reachable);
    assert_eq!(report.reports[1].came_online, vec!["alice"]);

    // Router 1 has no tunnel address, so only router 2's host was dialled
    let connections = fleet.transport.connections();
    assert_eq!(connections.len(), 1);
    assert!(connections.iter().all(|c| c.host.to_string() == r2_host));
    assert_eq!(online(&fleet, "alice").await, Some(true));
}
