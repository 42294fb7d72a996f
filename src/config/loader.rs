//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: interface={}, subnet={}, inventory={:?}",
        config.hub.interface,
        config.allocation.tunnel_subnet,
        config.store.inventory
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `ROUTER_FLEET_LOG_LEVEL`: Override log level
/// - `ROUTER_FLEET_INVENTORY`: Override inventory path
/// - `ROUTER_FLEET_HUB_ADDRESS`: Override hub tunnel address
/// - `ROUTER_FLEET_WG_INTERFACE`: Override hub interface
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from `lookup`, then re-validate
fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(level) = lookup("ROUTER_FLEET_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(inventory) = lookup("ROUTER_FLEET_INVENTORY") {
        config.store.inventory = inventory.into();
        debug!("Inventory overridden to {:?}", config.store.inventory);
    }

    if let Some(addr) = lookup("ROUTER_FLEET_HUB_ADDRESS") {
        config.hub.address = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "ROUTER_FLEET_HUB_ADDRESS".into(),
            reason: format!("Invalid IPv4 address: {addr}"),
        })?;
        debug!("Hub address overridden to {}", config.hub.address);
    }

    if let Some(interface) = lookup("ROUTER_FLEET_WG_INTERFACE") {
        config.hub.interface = interface;
        debug!("Interface overridden to {}", config.hub.interface);
    }

    // Re-validate after overrides
    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
