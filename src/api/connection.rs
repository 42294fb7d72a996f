//! Connection parameter resolution
//!
//! Management traffic only ever travels through the tunnel: the router's
//! public address is never used, even when the tunnel address is missing.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::model::{Credentials, Router};

/// Default RouterOS API port
pub const DEFAULT_API_PORT: u16 = 8728;

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: Ipv4Addr,
    pub port: u16,
    pub credentials: Credentials,
}

/// Resolve connection parameters for `router`
///
/// Explicit parameters win. Otherwise the tunnel address must be present
/// and a valid IPv4 literal, and credentials come from the automation
/// account with the admin account as fallback.
///
/// # Errors
///
/// - `ApiError::MissingTunnelAddress`
/// - `ApiError::InvalidAddress`
/// - `ApiError::MissingCredentials`
pub fn resolve_connection(
    router: &Router,
    explicit: Option<&ConnectionParams>,
    api_port: u16,
) -> Result<ConnectionParams, ApiError> {
    if let Some(params) = explicit {
        return Ok(params.clone());
    }

    let raw = router
        .tunnel_address
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or(ApiError::MissingTunnelAddress(router.id))?;

    let host: Ipv4Addr = raw.parse().map_err(|_| ApiError::InvalidAddress {
        router: router.id,
        value: raw.to_string(),
    })?;

    let credentials = usable_credentials(router)
        .map(|(_, c)| c.clone())
        .ok_or(ApiError::MissingCredentials(router.id))?;

    Ok(ConnectionParams {
        host,
        port: api_port,
        credentials,
    })
}

/// Which account [`resolve_connection`] would pick, for logging
pub fn credential_source(router: &Router) -> Option<&'static str> {
    usable_credentials(router).map(|(source, _)| source)
}

fn usable_credentials(router: &Router) -> Option<(&'static str, &Credentials)> {
    let usable = |c: &&Credentials| !c.username.is_empty();
    router
        .automation_credentials
        .as_ref()
        .filter(usable)
        .map(|c| ("automation", c))
        .or_else(|| {
            router
                .admin_credentials
                .as_ref()
                .filter(usable)
                .map(|c| ("admin", c))
        })
}
