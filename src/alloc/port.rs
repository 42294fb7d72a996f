//! Proxy port allocator
//!
//! Each router gets one externally reachable TCP port on the hub, forwarded
//! to the router's management port over the tunnel:
//! `(public_host:port) -> (tunnel_address:management_port)`.
//!
//! # Port Range
//!
//! Ports are allocated from 50000-59999 by default. Ports listed as
//! reserved in the configuration are skipped.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::AllocationError;
use crate::model::RouterId;
use crate::store::{ClaimOutcome, RouterStore};

/// Minimum proxy port
pub const DEFAULT_MIN_PROXY_PORT: u16 = 50000;

/// Maximum proxy port
pub const DEFAULT_MAX_PROXY_PORT: u16 = 59999;

const POOL_NAME: &str = "proxy-port";

/// Inclusive port range minus reserved ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPool {
    min_port: u16,
    max_port: u16,
    reserved: HashSet<u16>,
}

impl PortPool {
    /// # Errors
    ///
    /// Returns `AllocationError::InvalidPool` if the range is empty or
    /// starts at port 0.
    pub fn new(
        min_port: u16,
        max_port: u16,
        reserved: impl IntoIterator<Item = u16>,
    ) -> Result<Self, AllocationError> {
        if min_port == 0 || min_port > max_port {
            return Err(AllocationError::InvalidPool(format!(
                "invalid port range {min_port}-{max_port}"
            )));
        }
        Ok(Self {
            min_port,
            max_port,
            reserved: reserved.into_iter().collect(),
        })
    }

    pub fn min_port(&self) -> u16 {
        self.min_port
    }

    pub fn max_port(&self) -> u16 {
        self.max_port
    }

    /// Whether `port` can be handed to a router
    pub fn is_assignable(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port) && !self.reserved.contains(&port)
    }

    /// Assignable ports in ascending order
    pub fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        (self.min_port..=self.max_port).filter(move |p| !self.reserved.contains(p))
    }

    /// Number of assignable ports
    pub fn capacity(&self) -> usize {
        let total = usize::from(self.max_port - self.min_port) + 1;
        let reserved_in_range = self
            .reserved
            .iter()
            .filter(|&&p| p >= self.min_port && p <= self.max_port)
            .count();
        total - reserved_in_range
    }
}

/// Allocates proxy ports against the router store
pub struct ProxyPortAllocator {
    pool: PortPool,
    public_host: String,
    store: Arc<dyn RouterStore>,
    scan_lock: Mutex<()>,
}

impl ProxyPortAllocator {
    /// `public_host` is recorded on every router that receives a port
    pub fn new(pool: PortPool, public_host: impl Into<String>, store: Arc<dyn RouterStore>) -> Self {
        Self {
            pool,
            public_host: public_host.into(),
            store,
            scan_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    /// Externally reachable host recorded alongside allocated ports
    pub fn public_host(&self) -> &str {
        &self.public_host
    }

    /// Ensure the router has a proxy port and return it
    ///
    /// # Errors
    ///
    /// - `AllocationError::PoolExhausted` when no port is free
    /// - `AllocationError::Store` on store failures
    pub async fn allocate(&self, id: RouterId) -> Result<u16, AllocationError> {
        let router = self.store.get_router(id).await?;
        if let Some(existing) = router.proxy_port {
            return Ok(existing);
        }

        let _guard = self.scan_lock.lock().await;
        let allocated = self.store.allocated_ports().await?;

        for candidate in self.pool.candidates() {
            if allocated.contains(&candidate) {
                continue;
            }

            match self
                .store
                .claim_proxy_port(id, candidate, &self.public_host)
                .await?
            {
                ClaimOutcome::Claimed => {
                    info!(
                        router_id = %id,
                        port = candidate,
                        public_host = %self.public_host,
                        "Proxy port allocated"
                    );
                    return Ok(candidate);
                }
                ClaimOutcome::Taken => {
                    debug!(router_id = %id, port = candidate, "Candidate taken concurrently");
                }
                ClaimOutcome::AlreadyAssigned(existing) => return Ok(existing),
            }
        }

        warn!(
            router_id = %id,
            min = self.pool.min_port,
            max = self.pool.max_port,
            "Proxy port pool exhausted"
        );
        Err(AllocationError::PoolExhausted {
            pool: POOL_NAME.to_string(),
        })
    }

    /// Number of ports still free
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::Store` on store failures.
    pub async fn available_count(&self) -> Result<usize, AllocationError> {
        let allocated = self.store.allocated_ports().await?;
        let used = allocated
            .iter()
            .filter(|p| self.pool.is_assignable(**p))
            .count();
        Ok(self.pool.capacity().saturating_sub(used))
    }
}
