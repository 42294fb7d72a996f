//! Router management API
//!
//! # Submodules
//!
//! - [`connection`]: Tunnel-only connection parameter resolution
//! - [`transport`]: `ApiTransport`/`ApiSession` seams and a mock fleet
//! - [`routeros`]: RouterOS API wire codec and TCP transport
//! - [`client`]: `RouterApiClient` primitives

pub mod client;
pub mod connection;
pub mod routeros;
pub mod transport;

use crate::model::RouterId;
use crate::retry::Recoverable;
use crate::store::StoreError;

pub use client::{AccessMethod, ApiSettings, LiveSession, RouterApiClient, SubscriberCredential};
pub use connection::{resolve_connection, ConnectionParams, DEFAULT_API_PORT};
pub use routeros::RouterOsTransport;
pub use transport::{ApiCommand, ApiSession, ApiTransport, MockTransport, Row, TransportError};

/// Error types for router API calls
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Router has no tunnel address; the public address is never used
    #[error("Router {0} has no tunnel address")]
    MissingTunnelAddress(RouterId),

    /// Stored tunnel address is not an IPv4 literal
    #[error("Router {router} has invalid tunnel address {value:?}")]
    InvalidAddress { router: RouterId, value: String },

    /// Neither automation nor admin credentials are configured
    #[error("Router {0} has no API credentials")]
    MissingCredentials(RouterId),

    /// The credential to modify does not exist on the router
    #[error("Credential {username:?} not found on router {router}")]
    CredentialNotFound { router: RouterId, username: String },

    /// Connection or command failure
    #[error("Router {router}: {source}")]
    Transport {
        router: RouterId,
        source: TransportError,
    },

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// Record problems need fixing; network failures may clear up
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::MissingTunnelAddress(_)
            | Self::InvalidAddress { .. }
            | Self::MissingCredentials(_)
            | Self::CredentialNotFound { .. } => false,
        }
    }
}

impl Recoverable for ApiError {
    fn is_recoverable(&self) -> bool {
        ApiError::is_recoverable(self)
    }
}
