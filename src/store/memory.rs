//! In-memory fleet store
//!
//! Holds routers, session records and subscriber flags behind one
//! `parking_lot::Mutex`, which makes every claim a serialized
//! check-and-commit. A store built with [`MemoryStore::with_journal`] also
//! appends every mutation to a journal so tests can audit exactly which
//! writes a job performed.
//!
//! The daemon seeds this store from a JSON inventory file at start-up.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ClaimOutcome, RouterStore, SessionStore, StoreError, SubscriberStore};
use crate::model::{
    ActiveSession, PeerStatus, Router, RouterId, SessionStatus, Subscriber, TenantId,
};

/// A single mutation recorded by [`MemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    RouterInserted(RouterId),
    AddressClaimed { router: RouterId, address: Ipv4Addr },
    AddressReleased(RouterId),
    PortClaimed { router: RouterId, port: u16 },
    PublicHostSet(RouterId),
    ProxyMappingCleared(RouterId),
    PeerStatusSet { router: RouterId, status: PeerStatus },
    PeerCleared(RouterId),
    PollRecorded { router: RouterId, online: bool },
    SessionUpserted { router: RouterId, username: String },
    SessionDeactivated { router: RouterId, username: String },
    SubscriberOnlineSet { tenant: TenantId, username: String, online: bool },
}

impl StoreWrite {
    /// Writes that touch session or subscriber state
    pub fn is_session_write(&self) -> bool {
        matches!(
            self,
            Self::SessionUpserted { .. }
                | Self::SessionDeactivated { .. }
                | Self::SubscriberOnlineSet { .. }
        )
    }

    /// Writes that touch the address or port pools
    pub fn is_pool_write(&self) -> bool {
        matches!(
            self,
            Self::AddressClaimed { .. }
                | Self::AddressReleased(_)
                | Self::PortClaimed { .. }
                | Self::ProxyMappingCleared(_)
        )
    }
}

#[derive(Default)]
struct Inner {
    routers: BTreeMap<RouterId, Router>,
    sessions: HashMap<(RouterId, String), ActiveSession>,
    subscribers: HashMap<(TenantId, String), Subscriber>,
    journal: Option<Vec<StoreWrite>>,
}

impl Inner {
    fn router_mut(&mut self, id: RouterId) -> Result<&mut Router, StoreError> {
        self.routers.get_mut(&id).ok_or(StoreError::RouterNotFound(id))
    }

    fn record(&mut self, write: StoreWrite) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(write);
        }
    }
}

/// Mutex-backed store implementing all three store traits
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with routers
    pub fn with_routers(routers: impl IntoIterator<Item = Router>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for router in routers {
                inner.routers.insert(router.id, router);
            }
        }
        store
    }

    /// Load a JSON array of routers
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the file cannot be read or parsed,
    /// and `StoreError::Duplicate` if two entries share an id.
    pub fn load_inventory(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Backend(format!("read {}: {e}", path.display())))?;
        let routers: Vec<Router> = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Backend(format!("parse {}: {e}", path.display())))?;

        let mut seen = HashSet::new();
        for router in &routers {
            if !seen.insert(router.id) {
                return Err(StoreError::Duplicate(format!("router id {}", router.id)));
            }
        }

        info!(path = %path.display(), routers = routers.len(), "Inventory loaded");
        Ok(Self::with_routers(routers))
    }

    /// Register a subscriber record
    pub fn insert_subscriber(&self, subscriber: Subscriber) {
        let key = (subscriber.tenant_id, subscriber.username.clone());
        self.inner.lock().subscribers.insert(key, subscriber);
    }

    /// Start recording every mutation from now on
    #[must_use]
    pub fn with_journal(self) -> Self {
        self.inner.lock().journal.get_or_insert_with(Vec::new);
        self
    }

    /// Snapshot of the write journal; empty unless journaling is on
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.inner.lock().journal.clone().unwrap_or_default()
    }

    /// Snapshot of session and subscriber writes only
    pub fn session_writes(&self) -> Vec<StoreWrite> {
        self.inner
            .lock()
            .journal
            .iter()
            .flatten()
            .filter(|w| w.is_session_write())
            .cloned()
            .collect()
    }

    /// Forget recorded writes
    pub fn clear_journal(&self) {
        if let Some(journal) = self.inner.lock().journal.as_mut() {
            journal.clear();
        }
    }

    /// All session records for a router (any status)
    pub fn sessions_for(&self, router: RouterId) -> Vec<ActiveSession> {
        let mut sessions: Vec<_> = self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.router_id == router)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.username.cmp(&b.username));
        sessions
    }
}

#[async_trait]
impl RouterStore for MemoryStore {
    async fn get_router(&self, id: RouterId) -> Result<Router, StoreError> {
        self.inner
            .lock()
            .routers
            .get(&id)
            .cloned()
            .ok_or(StoreError::RouterNotFound(id))
    }

    async fn list_routers(&self) -> Result<Vec<Router>, StoreError> {
        Ok(self.inner.lock().routers.values().cloned().collect())
    }

    async fn insert_router(&self, router: Router) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.routers.contains_key(&router.id) {
            return Err(StoreError::Duplicate(format!("router id {}", router.id)));
        }
        let id = router.id;
        inner.routers.insert(id, router);
        inner.record(StoreWrite::RouterInserted(id));
        Ok(())
    }

    async fn allocated_addresses(&self) -> Result<HashSet<Ipv4Addr>, StoreError> {
        Ok(self
            .inner
            .lock()
            .routers
            .values()
            .filter_map(Router::tunnel_ipv4)
            .collect())
    }

    async fn claim_tunnel_address(
        &self,
        id: RouterId,
        addr: Ipv4Addr,
    ) -> Result<ClaimOutcome<String>, StoreError> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.router_mut(id)?.tunnel_address.clone() {
            return Ok(ClaimOutcome::AlreadyAssigned(existing));
        }

        let taken = inner
            .routers
            .values()
            .any(|r| r.id != id && r.tunnel_ipv4() == Some(addr));
        if taken {
            debug!(router_id = %id, address = %addr, "Address claim lost");
            return Ok(ClaimOutcome::Taken);
        }

        inner.router_mut(id)?.tunnel_address = Some(addr.to_string());
        inner.record(StoreWrite::AddressClaimed {
            router: id,
            address: addr,
        });
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_tunnel_address(&self, id: RouterId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.router_mut(id)?.tunnel_address = None;
        inner.record(StoreWrite::AddressReleased(id));
        Ok(())
    }

    async fn allocated_ports(&self) -> Result<HashSet<u16>, StoreError> {
        Ok(self
            .inner
            .lock()
            .routers
            .values()
            .filter_map(|r| r.proxy_port)
            .collect())
    }

    async fn claim_proxy_port(
        &self,
        id: RouterId,
        port: u16,
        public_host: &str,
    ) -> Result<ClaimOutcome<u16>, StoreError> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.router_mut(id)?.proxy_port {
            return Ok(ClaimOutcome::AlreadyAssigned(existing));
        }

        let taken = inner
            .routers
            .values()
            .any(|r| r.id != id && r.proxy_port == Some(port));
        if taken {
            debug!(router_id = %id, port, "Port claim lost");
            return Ok(ClaimOutcome::Taken);
        }

        let router = inner.router_mut(id)?;
        router.proxy_port = Some(port);
        router.public_host = Some(public_host.to_string());
        inner.record(StoreWrite::PortClaimed { router: id, port });
        Ok(ClaimOutcome::Claimed)
    }

    async fn set_public_host(&self, id: RouterId, host: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let router = inner.router_mut(id)?;
        if router.public_host.as_deref() == Some(host) {
            return Ok(());
        }
        router.public_host = Some(host.to_string());
        inner.record(StoreWrite::PublicHostSet(id));
        Ok(())
    }

    async fn clear_proxy_mapping(&self, id: RouterId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let router = inner.router_mut(id)?;
        router.proxy_port = None;
        router.public_host = None;
        inner.record(StoreWrite::ProxyMappingCleared(id));
        Ok(())
    }

    async fn set_peer_status(&self, id: RouterId, status: PeerStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.router_mut(id)?.peer_status = status;
        inner.record(StoreWrite::PeerStatusSet { router: id, status });
        Ok(())
    }

    async fn clear_peer(&self, id: RouterId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let router = inner.router_mut(id)?;
        router.public_key = None;
        router.peer_status = PeerStatus::Pending;
        inner.record(StoreWrite::PeerCleared(id));
        Ok(())
    }

    async fn record_poll(
        &self,
        id: RouterId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let router = inner.router_mut(id)?;
        router.online = online;
        if online {
            router.last_seen = Some(at);
        }
        inner.record(StoreWrite::PollRecorded { router: id, online });
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn active_usernames(&self, router: RouterId) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.router_id == router && s.status == SessionStatus::Active)
            .map(|s| s.username.clone())
            .collect())
    }

    async fn upsert_active(
        &self,
        router: RouterId,
        username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .sessions
            .entry((router, username.to_string()))
            .and_modify(|s| {
                s.status = SessionStatus::Active;
                s.last_seen = at;
            })
            .or_insert_with(|| ActiveSession {
                router_id: router,
                username: username.to_string(),
                status: SessionStatus::Active,
                last_seen: at,
            });
        inner.record(StoreWrite::SessionUpserted {
            router,
            username: username.to_string(),
        });
        Ok(())
    }

    async fn deactivate(
        &self,
        router: RouterId,
        username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(&(router, username.to_string())) {
            session.status = SessionStatus::Deactivated;
            session.last_seen = at;
            inner.record(StoreWrite::SessionDeactivated {
                router,
                username: username.to_string(),
            });
        }
        Ok(())
    }

    async fn is_active_elsewhere(
        &self,
        username: &str,
        excluding: RouterId,
        tenant: Option<TenantId>,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock();
        let active = inner.sessions.values().any(|s| {
            s.router_id != excluding
                && s.username == username
                && s.status == SessionStatus::Active
                && match tenant {
                    Some(t) => inner
                        .routers
                        .get(&s.router_id)
                        .is_some_and(|r| r.tenant_id == Some(t)),
                    None => true,
                }
        });
        Ok(active)
    }

    async fn session(
        &self,
        router: RouterId,
        username: &str,
    ) -> Result<Option<ActiveSession>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .get(&(router, username.to_string()))
            .cloned())
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn subscriber_online(
        &self,
        tenant: TenantId,
        username: &str,
    ) -> Result<Option<bool>, StoreError> {
        Ok(self
            .inner
            .lock()
            .subscribers
            .get(&(tenant, username.to_string()))
            .map(|s| s.online))
    }

    async fn set_subscriber_online(
        &self,
        tenant: TenantId,
        username: &str,
        online: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .entry((tenant, username.to_string()))
            .and_modify(|s| s.online = online)
            .or_insert_with(|| Subscriber {
                tenant_id: tenant,
                username: username.to_string(),
                online,
            });
        inner.record(StoreWrite::SubscriberOnlineSet {
            tenant,
            username: username.to_string(),
            online,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn store_with(ids: &[u64]) -> MemoryStore {
        MemoryStore::with_routers(ids.iter().map(|&id| Router::new(RouterId(id), format!("r{id}"))))
            .with_journal()
    }

    #[tokio::test]
    async fn test_claim_address_exclusive() {
        let store = store_with(&[1, 2]);
        let addr = Ipv4Addr::new(10, 100, 0, 2);

        assert_eq!(
            store.claim_tunnel_address(RouterId(1), addr).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_tunnel_address(RouterId(2), addr).await.unwrap(),
            ClaimOutcome::Taken
        );
        assert_eq!(
            store.claim_tunnel_address(RouterId(1), Ipv4Addr::new(10, 100, 0, 9)).await.unwrap(),
            ClaimOutcome::AlreadyAssigned("10.100.0.2".to_string())
        );
    }

    #[tokio::test]
    async fn test_claim_port_records_host() {
        let store = store_with(&[1]);
        store.claim_proxy_port(RouterId(1), 50000, "hub.example.net").await.unwrap();

        let router = store.get_router(RouterId(1)).await.unwrap();
        assert_eq!(router.proxy_port, Some(50000));
        assert_eq!(router.public_host.as_deref(), Some("hub.example.net"));
    }

    #[tokio::test]
    async fn test_unknown_router() {
        let store = store_with(&[]);
        let result = store.get_router(RouterId(5)).await;
        assert!(matches!(result, Err(StoreError::RouterNotFound(RouterId(5)))));
    }

    #[tokio::test]
    async fn test_sessions_never_deleted() {
        let store = store_with(&[1]);
        let now = Utc::now();
        store.upsert_active(RouterId(1), "alice", now).await.unwrap();
        store.deactivate(RouterId(1), "alice", now).await.unwrap();

        let session = store.session(RouterId(1), "alice").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Deactivated);
        assert!(store.active_usernames(RouterId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_missing_is_silent() {
        let store = store_with(&[1]);
        store.deactivate(RouterId(1), "ghost", Utc::now()).await.unwrap();
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_journal_off_by_default() {
        let store = MemoryStore::with_routers([Router::new(RouterId(1), "r1")]);
        for _ in 0..100 {
            store.record_poll(RouterId(1), true, Utc::now()).await.unwrap();
        }
        store.upsert_active(RouterId(1), "alice", Utc::now()).await.unwrap();

        assert!(store.writes().is_empty());
        assert!(store.inner.lock().journal.is_none());
        assert!(store.get_router(RouterId(1)).await.unwrap().online);
    }

    #[tokio::test]
    async fn test_active_elsewhere_scoped_by_tenant() {
        let mut r1 = Router::new(RouterId(1), "r1");
        r1.tenant_id = Some(TenantId(1));
        let mut r2 = Router::new(RouterId(2), "r2");
        r2.tenant_id = Some(TenantId(2));
        let store = MemoryStore::with_routers([r1, r2]);

        store.upsert_active(RouterId(2), "alice", Utc::now()).await.unwrap();

        assert!(store
            .is_active_elsewhere("alice", RouterId(1), None)
            .await
            .unwrap());
        assert!(!store
            .is_active_elsewhere("alice", RouterId(1), Some(TenantId(1)))
            .await
            .unwrap());
    }

    #[test]
    fn test_load_inventory() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"[{"id": 1, "name": "north"}, {"id": 2}]"#).unwrap();

        let store = MemoryStore::load_inventory(file.path()).unwrap();
        assert_eq!(store.inner.lock().routers.len(), 2);
    }

    #[test]
    fn test_load_inventory_duplicate_ids() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"[{"id": 1}, {"id": 1}]"#).unwrap();

        let result = MemoryStore::load_inventory(file.path());
        assert!(matches!(result, Err(StoreError::Duplicate(_))));
    }
}
