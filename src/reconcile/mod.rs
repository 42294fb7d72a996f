//! Session reconciliation
//!
//! # Submodules
//!
//! - [`diff`]: Pure live-versus-recorded username diffing
//! - [`reconciler`]: `SessionReconciler` and the `LiveSessionSource` seam

pub mod diff;
pub mod reconciler;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

pub use diff::{diff, normalize_all, SessionDiff};
pub use reconciler::{
    FleetReconcileReport, LiveSessionSource, ReconcileReport, SessionReconciler,
    DEFAULT_POLL_CONCURRENCY,
};

/// What to do with a router whose live snapshot cannot be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachablePolicy {
    /// Reconcile against an empty live set, deactivating every record
    #[default]
    TreatAsEmpty,
    /// Leave records untouched until the router answers again
    Skip,
}

/// Error types for reconciliation
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
        }
    }
}
