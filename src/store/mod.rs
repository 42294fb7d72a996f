//! Storage seams for routers, sessions and subscribers
//!
//! The back-office owns persistence; this crate only needs keyed reads and a
//! handful of writes. Resource claims (`claim_tunnel_address`,
//! `claim_proxy_port`) must be atomic check-and-set operations in every
//! implementation: two concurrent claims for the same value must never both
//! report [`ClaimOutcome::Claimed`]. A relational backend maps this to a
//! unique index plus a conditional update; [`MemoryStore`] uses a single
//! mutex.
//!
//! # Submodules
//!
//! - [`memory`]: In-process store with a write journal

pub mod memory;

use std::collections::HashSet;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{ActiveSession, PeerStatus, Router, RouterId, TenantId};

pub use memory::{MemoryStore, StoreWrite};

/// Error types for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Router does not exist
    #[error("Router not found: {0}")]
    RouterNotFound(RouterId),

    /// Record already exists
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Backend failure (connection lost, deadlock, ...)
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Backend hiccups can be retried; missing or duplicate rows cannot
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Result of an atomic resource claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome<T> {
    /// The value now belongs to the router
    Claimed,
    /// Another router holds the value
    Taken,
    /// The router already held a value; nothing was written
    AlreadyAssigned(T),
}

/// Router configuration store
#[async_trait]
pub trait RouterStore: Send + Sync {
    /// Fetch a single router
    async fn get_router(&self, id: RouterId) -> Result<Router, StoreError>;

    /// All routers in the fleet, ordered by id
    async fn list_routers(&self) -> Result<Vec<Router>, StoreError>;

    /// Insert a newly onboarded router
    async fn insert_router(&self, router: Router) -> Result<(), StoreError>;

    /// Fleet-wide set of assigned tunnel addresses
    async fn allocated_addresses(&self) -> Result<HashSet<Ipv4Addr>, StoreError>;

    /// Atomically assign `addr` to the router if it has none and nobody else holds it
    async fn claim_tunnel_address(
        &self,
        id: RouterId,
        addr: Ipv4Addr,
    ) -> Result<ClaimOutcome<String>, StoreError>;

    /// Clear the router's tunnel address
    async fn release_tunnel_address(&self, id: RouterId) -> Result<(), StoreError>;

    /// Fleet-wide set of assigned proxy ports
    async fn allocated_ports(&self) -> Result<HashSet<u16>, StoreError>;

    /// Atomically assign `port` (and record `public_host`) if the router has none
    async fn claim_proxy_port(
        &self,
        id: RouterId,
        port: u16,
        public_host: &str,
    ) -> Result<ClaimOutcome<u16>, StoreError>;

    /// Record the externally reachable host of the proxy
    async fn set_public_host(&self, id: RouterId, host: &str) -> Result<(), StoreError>;

    /// Clear proxy port and public host
    async fn clear_proxy_mapping(&self, id: RouterId) -> Result<(), StoreError>;

    /// Update the hub-side peer status
    async fn set_peer_status(&self, id: RouterId, status: PeerStatus) -> Result<(), StoreError>;

    /// Clear router-side peer fields after the peer was removed
    async fn clear_peer(&self, id: RouterId) -> Result<(), StoreError>;

    /// Record the outcome of a management poll
    async fn record_poll(
        &self,
        id: RouterId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Router-scoped active session records
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Usernames currently recorded active on `router`
    async fn active_usernames(&self, router: RouterId) -> Result<HashSet<String>, StoreError>;

    /// Create or reactivate the `(router, username)` record
    async fn upsert_active(
        &self,
        router: RouterId,
        username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark the `(router, username)` record deactivated
    async fn deactivate(
        &self,
        router: RouterId,
        username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Whether any router other than `excluding` holds an active record for
    /// `username`. When `tenant` is given only that tenant's routers count.
    async fn is_active_elsewhere(
        &self,
        username: &str,
        excluding: RouterId,
        tenant: Option<TenantId>,
    ) -> Result<bool, StoreError>;

    /// Fetch a single session record
    async fn session(
        &self,
        router: RouterId,
        username: &str,
    ) -> Result<Option<ActiveSession>, StoreError>;
}

/// Subscriber aggregate flags, owned by the tenant store
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Current online flag; `None` if the subscriber is unknown
    async fn subscriber_online(
        &self,
        tenant: TenantId,
        username: &str,
    ) -> Result<Option<bool>, StoreError>;

    /// Set the online flag
    async fn set_subscriber_online(
        &self,
        tenant: TenantId,
        username: &str,
        online: bool,
    ) -> Result<(), StoreError>;
}
