//! Configuration module for router-fleet
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use router_fleet::config::{load_config, Config};
//!
//! let config = load_config("/etc/router-fleet/config.json").unwrap();
//! println!("Hub interface: {}", config.hub.interface);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    AllocationConfig, ApiConfig, Config, HubConfig, LogConfig, NatConfig, PeerConfig,
    ReconcileConfig, SchedulerConfig, StoreConfig,
};
