//! Management port forwarding on the hub
//!
//! # Submodules
//!
//! - [`rule`]: Rule model and the per-router DNAT/SNAT/FORWARD triple
//! - [`firewall`]: `Firewall` seam, iptables implementation and a mock
//! - [`manager`]: `NatRuleManager`

pub mod firewall;
pub mod manager;
pub mod rule;

use crate::alloc::AllocationError;
use crate::store::StoreError;

pub use firewall::{DeleteOutcome, Firewall, IptablesFirewall, MockFirewall};
pub use manager::{MappingReport, NatRuleManager, RebuildReport, RuleStats, DEFAULT_MANAGEMENT_PORT};
pub use rule::{Chain, FirewallRule, PortMapping, Table};

/// Error types for NAT mapping operations
#[derive(Debug, thiserror::Error)]
pub enum NatError {
    /// Address or port could not be allocated
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl NatError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Allocation(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
        }
    }
}
