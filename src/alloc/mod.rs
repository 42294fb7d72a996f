//! Fleet-wide resource allocation
//!
//! Tunnel addresses and proxy ports are scarce, globally unique resources.
//! Both allocators follow the same shape:
//!
//! 1. Return the router's existing value untouched if it has one
//! 2. Take the in-process pool mutex
//! 3. Read the fleet-wide allocated set from the store
//! 4. Walk the pool in order and commit the first free value with the
//!    store's atomic claim; a lost race moves on to the next candidate
//!
//! The store claim is what guarantees uniqueness across processes; the
//! mutex only keeps local callers from racing each other for the same slot.
//!
//! # Submodules
//!
//! - [`address`]: Tunnel IPv4 address allocation
//! - [`port`]: Proxy port allocation

pub mod address;
pub mod port;

use crate::model::RouterId;
use crate::store::StoreError;

pub use address::{AddressPool, TunnelAddressAllocator, DEFAULT_TUNNEL_SUBNET};
pub use port::{PortPool, ProxyPortAllocator, DEFAULT_MAX_PROXY_PORT, DEFAULT_MIN_PROXY_PORT};

/// Error types for resource allocation
#[derive(Debug, Clone, thiserror::Error)]
pub enum AllocationError {
    /// Every value in the pool is assigned
    #[error("Pool exhausted: {pool}")]
    PoolExhausted { pool: String },

    /// Pool definition is unusable
    #[error("Invalid pool: {0}")]
    InvalidPool(String),

    /// The router already holds a value that is not a valid address
    #[error("Router {router} holds invalid tunnel address {value:?}")]
    InvalidStoredAddress { router: RouterId, value: String },

    /// Store failure during allocation
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocationError {
    /// Exhaustion and bad pools need an operator; store hiccups can be retried
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
            Self::PoolExhausted { .. } | Self::InvalidPool(_) | Self::InvalidStoredAddress { .. } => {
                false
            }
        }
    }
}
