//! router-fleet: Connectivity and session reconciliation for a router fleet
//!
//! A central hub keeps a fleet of remote routers reachable over a `WireGuard`
//! tunnel, forwards an external proxy port to each router's management port,
//! and keeps the back-office's record of authenticated subscribers in line
//! with what the routers actually report.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────── SyncOrchestrator ────────────┐
//!                 │        apply all  →  reload once         │
//!                 └───────────────┬──────────────────────────┘
//!                                 ↓
//! AddressAllocator → PeerLifecycleManager → wg (hub interface)
//!        ↓
//! PortAllocator → NatRuleManager → iptables DNAT/SNAT/FORWARD
//!
//! RouterApiClient (tunnel only) → SessionReconciler → session/subscriber stores
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use router_fleet::api::{MockTransport, RouterApiClient, ApiSettings};
//! use router_fleet::reconcile::SessionReconciler;
//! use router_fleet::store::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::load_inventory("/etc/router-fleet/routers.json")?);
//! let client = Arc::new(RouterApiClient::new(
//!     store.clone(),
//!     Arc::new(MockTransport::new()),
//!     ApiSettings::default(),
//! ));
//!
//! let reconciler = SessionReconciler::new(store.clone(), store.clone(), store, client);
//! let report = reconciler.reconcile_fleet().await?;
//! println!("{} routers reconciled", report.reports.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`alloc`]: Tunnel address and proxy port allocation
//! - [`api`]: Router management API client and wire codec
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`lock`]: Per-router exclusive execution
//! - [`model`]: Fleet records
//! - [`nat`]: Proxy port forwarding rules
//! - [`peer`]: Hub-side VPN peer lifecycle
//! - [`reconcile`]: Session reconciliation
//! - [`retry`]: Bounded retries
//! - [`scheduler`]: Periodic jobs
//! - [`store`]: Storage seams and the in-memory store
//! - [`sync`]: Fleet-wide peer sync
//! - [`system`]: Local command execution

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod alloc;
pub mod api;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod nat;
pub mod peer;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod system;

// Re-export commonly used types at the crate root
pub use alloc::{AllocationError, ProxyPortAllocator, TunnelAddressAllocator};
pub use api::{ApiError, RouterApiClient};
pub use config::Config;
pub use error::{ConfigError, FleetError, Result};
pub use lock::RouterLocks;
pub use model::{PeerStatus, Router, RouterId, TenantId};
pub use nat::{NatError, NatRuleManager};
pub use peer::{PeerError, PeerLifecycleManager};
pub use reconcile::{ReconcileError, SessionReconciler, UnreachablePolicy};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, RouterStore, SessionStore, SubscriberStore};
pub use sync::{SyncOrchestrator, SyncReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
