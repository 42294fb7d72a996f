//! Error types for router-fleet
//!
//! Each subsystem owns its error enum next to its code; this module holds
//! the configuration error and the top-level [`FleetError`] that the
//! scheduler and binary work with. Every error reports whether retrying the
//! same operation can succeed.

use std::io;

use thiserror::Error;

use crate::alloc::AllocationError;
use crate::api::ApiError;
use crate::nat::NatError;
use crate::peer::PeerError;
use crate::reconcile::ReconcileError;
use crate::store::StoreError;
use crate::system::CommandError;

/// Top-level error type for router-fleet
#[derive(Debug, Error)]
pub enum FleetError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Address or port pool errors
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// VPN peer lifecycle errors
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// Firewall mapping errors
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    /// Router management API errors
    #[error("Router API error: {0}")]
    Api(#[from] ApiError),

    /// Session reconciliation errors
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Storage errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Local command execution errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FleetError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Allocation(e) => e.is_recoverable(),
            Self::Peer(e) => e.is_recoverable(),
            Self::Nat(e) => e.is_recoverable(),
            Self::Api(e) => e.is_recoverable(),
            Self::Reconcile(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Command(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, FleetError>;
