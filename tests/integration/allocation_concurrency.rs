//! Allocation uniqueness under concurrent tasks

use std::collections::HashSet;
use std::sync::Arc;

use router_fleet::alloc::{
    AddressPool, AllocationError, PortPool, ProxyPortAllocator, TunnelAddressAllocator,
};
use router_fleet::model::RouterId;
use router_fleet::store::{MemoryStore, StoreWrite};

use super::fixtures::{onboarded, HUB, PUBLIC_HOST};

fn store(count: u64) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_routers((1..=count).map(onboarded)).with_journal())
}

fn address_allocator(store: &Arc<MemoryStore>, subnet: &str) -> Arc<TunnelAddressAllocator> {
    Arc::new(TunnelAddressAllocator::new(
        AddressPool::new(subnet.parse().unwrap(), HUB).unwrap(),
        store.clone(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_address_allocation_is_unique() {
    let store = store(40);
    // Two allocators over one store behave like two hub processes
    let first = address_allocator(&store, "10.100.0.0/24");
    let second = address_allocator(&store, "10.100.0.0/24");

    let mut handles = Vec::new();
    for id in 1..=40u64 {
        let allocator = if id % 2 == 0 { first.clone() } else { second.clone() };
        handles.push(tokio::spawn(async move {
            allocator.allocate(RouterId(id)).await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let addr = handle.await.unwrap().unwrap();
        assert!(seen.insert(addr), "duplicate address {addr}");
        assert_ne!(addr, HUB);
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_port_allocation_is_unique() {
    let store = store(30);
    let ports = Arc::new(ProxyPortAllocator::new(
        PortPool::new(50000, 50029, []).unwrap(),
        PUBLIC_HOST,
        store.clone(),
    ));

    let mut handles = Vec::new();
    for id in 1..=30u64 {
        let ports = ports.clone();
        handles.push(tokio::spawn(async move { ports.allocate(RouterId(id)).await }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.await.unwrap().unwrap()));
    }
    assert_eq!(seen, (50000..=50029).collect::<HashSet<u16>>());
}

#[tokio::test]
async fn test_exhausted_pool_reports_error() {
    let store = store(3);
    // /30 holds two hosts; the hub takes one
    let addresses = address_allocator(&store, "10.100.0.0/30");

    assert_eq!(
        addresses.allocate(RouterId(1)).await.unwrap().to_string(),
        "10.100.0.2"
    );
    let err = addresses.allocate(RouterId(2)).await.unwrap_err();
    assert!(matches!(err, AllocationError::PoolExhausted { .. }));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn test_repeat_allocation_writes_nothing() {
    let store = store(1);
    let addresses = address_allocator(&store, "10.100.0.0/24");

    let first = addresses.allocate(RouterId(1)).await.unwrap();
    store.clear_journal();

    let again = addresses.allocate(RouterId(1)).await.unwrap();
    assert_eq!(first, again);
    assert!(store.writes().iter().all(|w| !w.is_pool_write()));
    assert!(!store
        .writes()
        .contains(&StoreWrite::AddressClaimed { router: RouterId(1), address: first }));
}

#[tokio::test]
async fn test_released_address_is_reused() {
    let store = store(2);
    let addresses = address_allocator(&store, "10.100.0.0/24");

    let a = addresses.allocate(RouterId(1)).await.unwrap();
    addresses.release(RouterId(1)).await.unwrap();
    let b = addresses.allocate(RouterId(2)).await.unwrap();
    assert_eq!(a, b);
}
