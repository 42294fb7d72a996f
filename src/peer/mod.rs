//! Peer management module
//!
//! Hub-side `WireGuard` peers for every router in the fleet.
//!
//! # Overview
//!
//! The peer module handles:
//! - Public key validation before any command is issued
//! - Applying and removing peers on the hub interface
//! - Tracking per-router peer status (pending, active, failed)
//!
//! # Submodules
//!
//! - [`validation`]: Key and allowed-routes validation
//! - [`wireguard`]: `VpnControl` seam, `wg` command implementation and a mock
//! - [`manager`]: `PeerLifecycleManager`

pub mod manager;
pub mod validation;
pub mod wireguard;

use crate::lock::LockError;
use crate::model::RouterId;
use crate::retry::Recoverable;
use crate::store::StoreError;
use crate::system::CommandError;

pub use manager::{PeerLifecycleManager, DEFAULT_INTERFACE, DEFAULT_KEEPALIVE};
pub use validation::{validate_allowed_routes, validate_wg_key, ValidationError, WG_KEY_LENGTH};
pub use wireguard::{MockVpnControl, VpnCall, VpnControl, WgCommandControl};

/// Error types for peer operations
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Router has no public key to install
    #[error("Router {0} has no WireGuard public key")]
    MissingPublicKey(RouterId),

    /// Router's public key is malformed
    #[error("Router {router} has an invalid public key: {source}")]
    InvalidPublicKey {
        router: RouterId,
        source: ValidationError,
    },

    /// Another job holds the router
    #[error("Router {0} is busy")]
    Busy(RouterId),

    /// Operation overran the lock hold timeout
    #[error("Peer operation on router {0} was abandoned after the hold timeout")]
    LockExpired(RouterId),

    /// `wg` or the reload command failed
    #[error("VPN control failed: {0}")]
    Vpn(#[from] CommandError),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PeerError {
    /// Missing or malformed keys need the record fixed; the rest may pass on retry
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::MissingPublicKey(_) | Self::InvalidPublicKey { .. } => false,
            Self::Busy(_) | Self::LockExpired(_) => true,
            Self::Vpn(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
        }
    }
}

impl From<LockError> for PeerError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy { router, .. } => Self::Busy(router),
            LockError::Expired { router, .. } => Self::LockExpired(router),
        }
    }
}

impl Recoverable for PeerError {
    fn is_recoverable(&self) -> bool {
        PeerError::is_recoverable(self)
    }
}
