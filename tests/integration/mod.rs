//! Integration tests for router-fleet
//!
//! This module contains integration tests that wire the allocators, the
//! peer and NAT managers, the API client and the reconciler together over a
//! shared `MemoryStore` and the in-crate mocks.
//!
//! # Test Organization
//!
//! - `fixtures`: Shared fleet wiring
//! - `scenario`: Onboarding through reconciliation for two routers
//! - `allocation_concurrency`: Uniqueness under concurrent tasks
//! - `nat_idempotence`: Rule sets after repeated ensures and rebuilds
//! - `peer_sync`: Two-phase sync and peer removal
//! - `session_reconcile`: Reconciliation against live devices
//! - `command_backends`: `wg` and `iptables` argv through a recording runner
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests scenario
//! ```

pub mod allocation_concurrency;
pub mod command_backends;
pub mod fixtures;
pub mod nat_idempotence;
pub mod peer_sync;
pub mod scenario;
pub mod session_reconcile;
