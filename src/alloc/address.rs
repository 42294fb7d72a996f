//! Tunnel address allocator
//!
//! Assigns each router a unique IPv4 address on the flat overlay network.
//!
//! # Subnet Layout
//!
//! By default tunnel addresses come from 10.100.0.0/24. The network address
//! (.0), the broadcast address (.255) and the hub gateway (.1 unless
//! configured otherwise) are never handed out, so the first router gets
//! 10.100.0.2.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::AllocationError;
use crate::model::RouterId;
use crate::store::{ClaimOutcome, RouterStore};

/// Default tunnel subnet
pub const DEFAULT_TUNNEL_SUBNET: &str = "10.100.0.0/24";

const POOL_NAME: &str = "tunnel-address";

/// Address range with its reserved members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Net,
    gateway: Ipv4Addr,
}

impl AddressPool {
    /// Create a pool for `network` with `gateway` reserved for the hub
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::InvalidPool` if the subnet has no room for
    /// hosts beyond the gateway, or the gateway lies outside it.
    pub fn new(network: Ipv4Net, gateway: Ipv4Addr) -> Result<Self, AllocationError> {
        let network = network.trunc();
        if network.prefix_len() > 30 {
            return Err(AllocationError::InvalidPool(format!(
                "{network} is too small for a hub and routers"
            )));
        }
        if !network.contains(&gateway)
            || gateway == network.network()
            || gateway == network.broadcast()
        {
            return Err(AllocationError::InvalidPool(format!(
                "gateway {gateway} is not a host address of {network}"
            )));
        }
        Ok(Self { network, gateway })
    }

    /// Pool whose gateway is the first host of the subnet
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::InvalidPool` for unparsable or tiny subnets.
    pub fn from_cidr(subnet: &str) -> Result<Self, AllocationError> {
        let network: Ipv4Net = subnet
            .parse()
            .map_err(|_| AllocationError::InvalidPool(format!("invalid subnet {subnet:?}")))?;
        let gateway = Ipv4Addr::from(u32::from(network.trunc().network()) + 1);
        Self::new(network, gateway)
    }

    /// The subnet
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// The reserved hub address
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Whether `addr` can ever be handed to a router
    pub fn is_assignable(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
            && addr != self.network.network()
            && addr != self.network.broadcast()
            && addr != self.gateway
    }

    /// Assignable addresses in ascending order
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let first = u32::from(self.network.network()) + 1;
        let last = u32::from(self.network.broadcast()) - 1;
        (first..=last)
            .map(Ipv4Addr::from)
            .filter(move |addr| *addr != self.gateway)
    }

    /// Number of assignable addresses
    pub fn capacity(&self) -> usize {
        let hosts = (u32::from(self.network.broadcast()) - u32::from(self.network.network()) - 1)
            as usize;
        hosts - 1
    }
}

/// Allocates tunnel addresses against the router store
pub struct TunnelAddressAllocator {
    pool: AddressPool,
    store: Arc<dyn RouterStore>,
    /// Serializes local scans; the store claim is the real exclusion
    scan_lock: Mutex<()>,
}

impl TunnelAddressAllocator {
    pub fn new(pool: AddressPool, store: Arc<dyn RouterStore>) -> Self {
        Self {
            pool,
            store,
            scan_lock: Mutex::new(()),
        }
    }

    /// The pool this allocator draws from
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Ensure the router has a tunnel address and return it
    ///
    /// Calling this on a router that already has an address returns that
    /// address without writing anything.
    ///
    /// # Errors
    ///
    /// - `AllocationError::PoolExhausted` when no address is free
    /// - `AllocationError::InvalidStoredAddress` when the existing value does not parse
    /// - `AllocationError::Store` on store failures
    pub async fn allocate(&self, id: RouterId) -> Result<Ipv4Addr, AllocationError> {
        let router = self.store.get_router(id).await?;
        if let Some(existing) = router.tunnel_address.as_deref() {
            return parse_existing(id, existing);
        }

        let _guard = self.scan_lock.lock().await;
        let allocated: HashSet<Ipv4Addr> = self.store.allocated_addresses().await?;

        for candidate in self.pool.candidates() {
            if allocated.contains(&candidate) {
                continue;
            }

            match self.store.claim_tunnel_address(id, candidate).await? {
                ClaimOutcome::Claimed => {
                    info!(router_id = %id, address = %candidate, "Tunnel address allocated");
                    return Ok(candidate);
                }
                ClaimOutcome::Taken => {
                    debug!(router_id = %id, address = %candidate, "Candidate taken concurrently");
                }
                ClaimOutcome::AlreadyAssigned(existing) => {
                    return parse_existing(id, &existing);
                }
            }
        }

        warn!(
            router_id = %id,
            subnet = %self.pool.network(),
            "Tunnel address pool exhausted"
        );
        Err(AllocationError::PoolExhausted {
            pool: POOL_NAME.to_string(),
        })
    }

    /// Clear the router's address, returning it to the pool
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::Store` on store failures.
    pub async fn release(&self, id: RouterId) -> Result<(), AllocationError> {
        let _guard = self.scan_lock.lock().await;
        self.store.release_tunnel_address(id).await?;
        info!(router_id = %id, "Tunnel address released");
        Ok(())
    }

    /// Number of addresses still free
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::Store` on store failures.
    pub async fn available_count(&self) -> Result<usize, AllocationError> {
        let allocated = self.store.allocated_addresses().await?;
        let used = allocated
            .iter()
            .filter(|addr| self.pool.is_assignable(**addr))
            .count();
        Ok(self.pool.capacity().saturating_sub(used))
    }
}

fn parse_existing(id: RouterId, value: &str) -> Result<Ipv4Addr, AllocationError> {
    value
        .trim()
        .parse()
        .map_err(|_| AllocationError::InvalidStoredAddress {
            router: id,
            value: value.to_string(),
        })
}
