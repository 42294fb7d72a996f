//! Shared fleet wiring for integration tests
//!
//! Builds every component on top of one `MemoryStore` and the in-crate
//! mocks, the same way `router-fleetd` wires the real back-ends.

use std::net::Ipv4Addr;
use std::sync::Arc;

use router_fleet::alloc::{AddressPool, PortPool, ProxyPortAllocator, TunnelAddressAllocator};
use router_fleet::api::{ApiSettings, MockTransport, RouterApiClient};
use router_fleet::lock::RouterLocks;
use router_fleet::model::{Credentials, Router, RouterId, Subscriber, TenantId};
use router_fleet::nat::{MockFirewall, NatRuleManager, DEFAULT_MANAGEMENT_PORT};
use router_fleet::peer::{MockVpnControl, PeerLifecycleManager, DEFAULT_INTERFACE, DEFAULT_KEEPALIVE};
use router_fleet::reconcile::SessionReconciler;
use router_fleet::store::MemoryStore;
use router_fleet::sync::SyncOrchestrator;

pub const HUB: Ipv4Addr = Ipv4Addr::new(10, 100, 0, 1);
pub const PUBLIC_HOST: &str = "hub.example.net";
pub const TENANT: TenantId = TenantId(1);

pub const KEYS: [&str; 3] = [
    "YNqHbfBQKaGvzefSSMufuG6egfeqVLK0OELQB+cKOGs=",
    "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=",
    "aPxj1r1T8K2Wm5xQ0D3dpDZ4J6nC9nVZ3fW1yqkJmnE=",
];

/// A freshly onboarded router: tenant and credentials, nothing allocated
pub fn onboarded(id: u64) -> Router {
    let mut router = Router::new(RouterId(id), format!("router-{id}"));
    router.tenant_id = Some(TENANT);
    router.automation_credentials = Some(Credentials::new("fleet-api", "secret"));
    router.allowed_routes = "10.100.0.0/24".into();
    router
}

pub struct Fleet {
    pub store: Arc<MemoryStore>,
    pub addresses: Arc<TunnelAddressAllocator>,
    pub ports: Arc<ProxyPortAllocator>,
    pub firewall: Arc<MockFirewall>,
    pub nat: NatRuleManager,
    pub vpn: Arc<MockVpnControl>,
    pub peers: Arc<PeerLifecycleManager>,
    pub sync: SyncOrchestrator,
    pub transport: MockTransport,
    pub client: Arc<RouterApiClient>,
    pub reconciler: SessionReconciler,
}

impl Fleet {
    pub fn new(routers: impl IntoIterator<Item = Router>) -> Self {
        Self::with_store(Arc::new(MemoryStore::with_routers(routers).with_journal()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let addresses = Arc::new(TunnelAddressAllocator::new(
            AddressPool::new("10.100.0.0/24".parse().unwrap(), HUB).unwrap(),
            store.clone(),
        ));
        let ports = Arc::new(ProxyPortAllocator::new(
            PortPool::new(50000, 59999, []).unwrap(),
            PUBLIC_HOST,
            store.clone(),
        ));
        let firewall = Arc::new(MockFirewall::new());
        let nat = NatRuleManager::new(
            store.clone(),
            addresses.clone(),
            ports.clone(),
            firewall.clone(),
            HUB,
            DEFAULT_MANAGEMENT_PORT,
        );

        let vpn = Arc::new(MockVpnControl::new());
        let peers = Arc::new(PeerLifecycleManager::new(
            store.clone(),
            vpn.clone(),
            Arc::new(RouterLocks::default()),
            DEFAULT_INTERFACE,
            DEFAULT_KEEPALIVE,
        ));
        let sync = SyncOrchestrator::new(store.clone(), peers.clone());

        let transport = MockTransport::new();
        let client = Arc::new(RouterApiClient::new(
            store.clone(),
            Arc::new(transport.clone()),
            ApiSettings::default(),
        ));
        let reconciler =
            SessionReconciler::new(store.clone(), store.clone(), store.clone(), client.clone());

        Self {
            store,
            addresses,
            ports,
            firewall,
            nat,
            vpn,
            peers,
            sync,
            transport,
            client,
            reconciler,
        }
    }

    pub fn add_subscribers(&self, names: &[&str]) {
        for name in names {
            self.store.insert_subscriber(Subscriber {
                tenant_id: TENANT,
                username: (*name).to_string(),
                online: false,
            });
        }
    }
}
