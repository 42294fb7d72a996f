//! Two-phase sync and peer removal across a fleet

use std::sync::Arc;
use std::time::Duration;

use router_fleet::lock::RouterLocks;
use router_fleet::model::{PeerStatus, RouterId};
use router_fleet::peer::{PeerError, PeerLifecycleManager, VpnCall, DEFAULT_INTERFACE, DEFAULT_KEEPALIVE};
use router_fleet::retry::RetryPolicy;
use router_fleet::store::RouterStore;
use router_fleet::sync::SyncOrchestrator;

use super::fixtures::{onboarded, Fleet, KEYS};

fn keyed(id: u64, key: &str) -> router_fleet::model::Router {
    let mut router = onboarded(id);
    router.public_key = Some(key.to_string());
    router
}

#[tokio::test]
async fn test_sync_applies_all_then_reloads_once() {
    let fleet = Fleet::new([keyed(1, KEYS[0]), keyed(2, KEYS[1]), keyed(3, KEYS[2])]);

    let report = fleet.sync.sync_all().await.unwrap();
    assert_eq!(report.applied.len(), 3);
    assert!(report.is_clean());

    // Every set precedes the single reload
    let calls = fleet.vpn.calls();
    assert_eq!(calls.len(), 4);
    assert!(matches!(calls.last(), Some(VpnCall::Reload { .. })));
    assert_eq!(fleet.vpn.reload_count(), 1);

    // A second pass finds nothing to do
    let again = fleet.sync.sync_all().await.unwrap();
    assert!(again.applied.is_empty());
    assert!(again.reload.is_none());
    assert_eq!(fleet.vpn.reload_count(), 1);
}

#[tokio::test]
async fn test_failed_router_isolated_and_retried_next_pass() {
    let fleet = Fleet::new([keyed(1, KEYS[0]), keyed(2, KEYS[1])]);
    fleet.vpn.fail_key(KEYS[1]);

    let report = fleet.sync.sync_all().await.unwrap();
    assert_eq!(report.applied, vec![RouterId(1)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(
        fleet.store.get_router(RouterId(2)).await.unwrap().peer_status,
        PeerStatus::Failed
    );

    fleet.vpn.heal_key(KEYS[1]);
    let report = fleet.sync.sync_all().await.unwrap();
    assert_eq!(report.applied, vec![RouterId(2)]);
    assert_eq!(fleet.vpn.reload_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_busy_router_skipped() {
    let fleet = Fleet::new([keyed(1, KEYS[0]), keyed(2, KEYS[1])]);
    let locks = fleet.peers.locks().clone();

    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let holder = tokio::spawn(async move {
        locks
            .run_exclusive(RouterId(1), async move {
                let _ = held_tx.send(());
                let _ = release_rx.await;
            })
            .await
    });
    held_rx.await.unwrap();

    let report = fleet.sync.sync_all().await.unwrap();
    assert_eq!(report.skipped, vec![RouterId(1)]);
    assert_eq!(report.applied, vec![RouterId(2)]);
    assert_eq!(
        fleet.store.get_router(RouterId(1)).await.unwrap().peer_status,
        PeerStatus::Pending
    );

    release_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_single_apply_with_retry_recovers() {
    let fleet = Fleet::new([keyed(1, KEYS[0])]);
    fleet.vpn.fail_key(KEYS[0]);

    let vpn = fleet.vpn.clone();
    let healer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        vpn.heal_key(KEYS[0]);
    });

    let policy = RetryPolicy::new(3, Duration::from_secs(5));
    fleet.peers.apply_with_retry(RouterId(1), &policy).await.unwrap();
    healer.await.unwrap();

    assert_eq!(fleet.vpn.set_peer_count(), 3);
    assert_eq!(
        fleet.store.get_router(RouterId(1)).await.unwrap().peer_status,
        PeerStatus::Active
    );
}

#[tokio::test]
async fn test_remove_after_sync() {
    let fleet = Fleet::new([keyed(1, KEYS[0]), keyed(2, KEYS[1])]);
    fleet.sync.sync_all().await.unwrap();

    fleet.peers.remove(RouterId(1)).await.unwrap();
    assert!(!fleet.vpn.has_peer(KEYS[0]));
    assert!(fleet.vpn.has_peer(KEYS[1]));

    let record = fleet.store.get_router(RouterId(1)).await.unwrap();
    assert!(record.public_key.is_none());
    assert!(!record.needs_peer());

    // Safe to repeat
    fleet.peers.remove(RouterId(1)).await.unwrap();
}

#[tokio::test]
async fn test_missing_key_never_reaches_vpn() {
    let fleet = Fleet::new([onboarded(1)]);

    let err = fleet.peers.apply(RouterId(1)).await.unwrap_err();
    assert!(matches!(err, PeerError::MissingPublicKey(_)));
    assert!(fleet.vpn.calls().is_empty());
}

#[tokio::test]
async fn test_sync_shares_locks_with_manager() {
    let fleet = Fleet::new([keyed(1, KEYS[0])]);
    let locks = Arc::new(RouterLocks::default());
    let peers = Arc::new(PeerLifecycleManager::new(
        fleet.store.clone(),
        fleet.vpn.clone(),
        locks.clone(),
        DEFAULT_INTERFACE,
        DEFAULT_KEEPALIVE,
    ));
    let sync = SyncOrchestrator::new(fleet.store.clone(), peers.clone());

    sync.sync_all().await.unwrap();
    assert!(Arc::ptr_eq(peers.locks(), &locks));
    assert!(!locks.is_locked(RouterId(1)));
}

#[tokio::test]
async fn test_failed_reload_requeues_whole_batch() {
    let fleet = Fleet::new([keyed(1, KEYS[0]), keyed(2, KEYS[1])]);
    fleet.vpn.fail_reloads(true);

    let report = fleet.sync.sync_all().await.unwrap();
    assert!(matches!(report.reload, Some(Err(_))));
    for id in [1, 2] {
        assert_eq!(
            fleet.store.get_router(RouterId(id)).await.unwrap().peer_status,
            PeerStatus::Failed
        );
    }

    fleet.vpn.fail_reloads(false);
    let report = fleet.sync.sync_all().await.unwrap();
    assert_eq!(report.applied, vec![RouterId(1), RouterId(2)]);
    assert!(report.is_clean());
    assert_eq!(fleet.vpn.reload_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_busy_apply_keeps_lock_owner_result() {
    let fleet = Fleet::new([keyed(1, KEYS[0])]);
    let locks = fleet.peers.locks().clone();
    let store = fleet.store.clone();

    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let owner = tokio::spawn(async move {
        locks
            .run_exclusive(RouterId(1), async move {
                let _ = held_tx.send(());
                let _ = release_rx.await;
                store.set_peer_status(RouterId(1), PeerStatus::Active).await.unwrap();
            })
            .await
    });
    held_rx.await.unwrap();

    let err = fleet
        .peers
        .apply_with_retry(RouterId(1), &RetryPolicy::once())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Busy(RouterId(1))));

    release_tx.send(()).unwrap();
    owner.await.unwrap().unwrap();
    assert_eq!(
        fleet.store.get_router(RouterId(1)).await.unwrap().peer_status,
        PeerStatus::Active
    );
}
