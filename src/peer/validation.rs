//! Input validation for peer operations
//!
//! Router public keys come from onboarding forms and imported records, so
//! they are checked before they are ever placed on a `wg` command line.
//!
//! # Validation Rules
//!
//! - **`WireGuard` Keys**: Base64 encoded, 44 characters (32 bytes)
//! - **Allowed routes**: Comma-separated IPv4 CIDRs
//!
//! # Examples
//!
//! ```
//! use router_fleet::peer::validation::{validate_allowed_routes, validate_wg_key};
//!
//! assert!(validate_wg_key("YNqHbfBQKaGvzefSSMufuG6egfeqVLK0OELQB+cKOGs=").is_ok());
//! assert!(validate_wg_key("short").is_err());
//! assert!(validate_allowed_routes("10.100.0.0/24").is_ok());
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::Ipv4Net;
use thiserror::Error;

/// `WireGuard` key length in bytes (before Base64 encoding)
pub const WG_KEY_LENGTH: usize = 32;

/// `WireGuard` key Base64 length (32 bytes = 44 chars in Base64 with padding)
pub const WG_KEY_BASE64_LENGTH: usize = 44;

/// Validation error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Key has the wrong length
    #[error("WireGuard key must be {WG_KEY_BASE64_LENGTH} characters, got {length}")]
    InvalidKeyLength { length: usize },

    /// Key is not valid Base64 for 32 bytes
    #[error("WireGuard key is not valid Base64")]
    InvalidKeyEncoding,

    /// Allowed routes are empty
    #[error("Allowed routes cannot be empty")]
    EmptyAllowedRoutes,

    /// Allowed routes contain something other than IPv4 CIDRs
    #[error("Invalid allowed route: {0}")]
    InvalidAllowedRoute(String),
}

/// Validate a `WireGuard` public key
///
/// # Errors
///
/// Returns `ValidationError::InvalidKeyLength` or
/// `ValidationError::InvalidKeyEncoding`.
pub fn validate_wg_key(key: &str) -> Result<(), ValidationError> {
    if key.len() != WG_KEY_BASE64_LENGTH {
        return Err(ValidationError::InvalidKeyLength { length: key.len() });
    }

    // 43 Base64 chars + '=' padding
    if !key.ends_with('=') {
        return Err(ValidationError::InvalidKeyEncoding);
    }

    match STANDARD.decode(key) {
        Ok(bytes) if bytes.len() == WG_KEY_LENGTH => Ok(()),
        _ => Err(ValidationError::InvalidKeyEncoding),
    }
}

/// Validate a comma-separated allowed-IPs value
///
/// # Errors
///
/// Returns `ValidationError::EmptyAllowedRoutes` or
/// `ValidationError::InvalidAllowedRoute` naming the first bad entry.
pub fn validate_allowed_routes(routes: &str) -> Result<(), ValidationError> {
    let mut count = 0;
    for entry in routes.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        entry
            .parse::<Ipv4Net>()
            .map_err(|_| ValidationError::InvalidAllowedRoute(entry.to_string()))?;
        count += 1;
    }
    if count == 0 {
        return Err(ValidationError::EmptyAllowedRoutes);
    }
    Ok(())
}
