//! Fleet data model
//!
//! Plain records shared by every subsystem. Persistence is owned by the
//! implementations in [`crate::store`]; these types carry no behaviour
//! beyond small accessors.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Router identifier (primary key in the router configuration store)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterId(pub u64);

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hub-side VPN peer status for a router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Peer not yet applied (or removed)
    #[default]
    Pending,
    /// Peer applied to the hub interface
    Active,
    /// Last apply attempt failed
    Failed,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Username/password pair for the router management API
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Never print passwords
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A managed remote router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,

    #[serde(default)]
    pub name: String,

    /// Owning tenant; `None` while the router is still being discovered
    #[serde(default)]
    pub tenant_id: Option<TenantId>,

    /// Tunnel address as stored. Kept as a string because imported records
    /// are not guaranteed to hold a valid literal.
    #[serde(default)]
    pub tunnel_address: Option<String>,

    /// WireGuard public key of the router
    #[serde(default)]
    pub public_key: Option<String>,

    /// Allowed-IPs value configured for this router's hub-side peer
    #[serde(default)]
    pub allowed_routes: String,

    /// External proxy port forwarding to the management port
    #[serde(default)]
    pub proxy_port: Option<u16>,

    /// Externally reachable host of the proxy
    #[serde(default)]
    pub public_host: Option<String>,

    #[serde(default)]
    pub peer_status: PeerStatus,

    /// Dedicated low-privilege automation account
    #[serde(default)]
    pub automation_credentials: Option<Credentials>,

    /// Administrator account, used only when no automation account exists
    #[serde(default)]
    pub admin_credentials: Option<Credentials>,

    #[serde(default)]
    pub online: bool,

    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Router {
    /// Create a bare router record as produced by onboarding
    pub fn new(id: RouterId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tenant_id: None,
            tunnel_address: None,
            public_key: None,
            allowed_routes: String::new(),
            proxy_port: None,
            public_host: None,
            peer_status: PeerStatus::Pending,
            automation_credentials: None,
            admin_credentials: None,
            online: false,
            last_seen: None,
        }
    }

    /// Parsed tunnel address, if present and a valid IPv4 literal
    pub fn tunnel_ipv4(&self) -> Option<Ipv4Addr> {
        self.tunnel_address.as_deref().and_then(|a| a.trim().parse().ok())
    }

    /// Whether the router is eligible for forwarding rules
    pub fn has_mapping_fields(&self) -> bool {
        self.proxy_port.is_some() && self.tunnel_ipv4().is_some()
    }

    /// Whether the hub still needs to (re)apply this router's peer
    pub fn needs_peer(&self) -> bool {
        self.public_key.is_some() && self.peer_status != PeerStatus::Active
    }
}

/// Status of a router-scoped session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Deactivated,
}

/// Most recent reconciled belief that a credential is authenticated on a router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub router_id: RouterId,
    /// Normalized (trimmed, lowercase) username
    pub username: String,
    pub status: SessionStatus,
    pub last_seen: DateTime<Utc>,
}

/// Subscriber aggregate owned by the tenant store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub tenant_id: TenantId,
    pub username: String,
    #[serde(default)]
    pub online: bool,
}

/// Normalize a username reported by a device.
///
/// Devices are not trusted to preserve case or strip padding.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}
