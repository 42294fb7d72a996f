//! Configuration types for router-fleet
//!
//! This module defines all configuration structures used by the daemon.
//! Configuration is loaded from JSON files and validated at startup.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::alloc::{AddressPool, PortPool, DEFAULT_MAX_PROXY_PORT, DEFAULT_MIN_PROXY_PORT};
use crate::api::{ApiSettings, DEFAULT_API_PORT};
use crate::error::ConfigError;
use crate::nat::DEFAULT_MANAGEMENT_PORT;
use crate::reconcile::UnreachablePolicy;
use crate::retry::RetryPolicy;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Hub identity and tunnel interface
    #[serde(default)]
    pub hub: HubConfig,

    /// Address and port pools
    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Peer lifecycle settings
    #[serde(default)]
    pub peer: PeerConfig,

    /// Firewall mapping settings
    #[serde(default)]
    pub nat: NatConfig,

    /// Router management API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Session reconciliation settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Periodic job settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Router inventory
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hub.validate()?;
        self.allocation.validate()?;
        self.peer.validate()?;
        self.nat.validate()?;
        self.api.validate()?;
        self.reconcile.validate()?;
        self.scheduler.validate()?;
        self.log.validate()?;

        // The hub address must be a host of the tunnel subnet
        self.address_pool()?;

        let ports = self.port_pool()?;
        if ports.is_assignable(self.nat.management_port) {
            return Err(ConfigError::ValidationError(format!(
                "management_port {} overlaps the proxy port range",
                self.nat.management_port
            )));
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Tunnel address pool with the hub address reserved
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the subnet and hub address
    /// do not form a usable pool.
    pub fn address_pool(&self) -> Result<AddressPool, ConfigError> {
        let network: Ipv4Net = self.allocation.tunnel_subnet.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "Invalid tunnel_subnet: {}",
                self.allocation.tunnel_subnet
            ))
        })?;
        AddressPool::new(network, self.hub.address)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Proxy port pool
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty range.
    pub fn port_pool(&self) -> Result<PortPool, ConfigError> {
        PortPool::new(
            self.allocation.min_proxy_port,
            self.allocation.max_proxy_port,
            self.allocation.reserved_ports.iter().copied(),
        )
        .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// Hub identity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Hub address inside the tunnel subnet
    #[serde(default = "default_hub_address")]
    pub address: Ipv4Addr,

    /// Externally reachable host recorded with every proxy port
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Hub `WireGuard` interface
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl HubConfig {
    /// Validate hub configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.public_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "hub.public_host cannot be empty".into(),
            ));
        }

        // IFNAMSIZ = 16 on Linux
        if self.interface.is_empty() || self.interface.len() > 15 {
            return Err(ConfigError::ValidationError(format!(
                "Interface name '{}' must be 1-15 chars",
                self.interface
            )));
        }

        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: default_hub_address(),
            public_host: default_public_host(),
            interface: default_interface(),
        }
    }
}

/// Address and port pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocationConfig {
    /// Tunnel subnet in CIDR notation
    #[serde(default = "default_tunnel_subnet")]
    pub tunnel_subnet: String,

    /// First proxy port (inclusive)
    #[serde(default = "default_min_proxy_port")]
    pub min_proxy_port: u16,

    /// Last proxy port (inclusive)
    #[serde(default = "default_max_proxy_port")]
    pub max_proxy_port: u16,

    /// Ports inside the range that are never handed out
    #[serde(default)]
    pub reserved_ports: Vec<u16>,
}

impl AllocationConfig {
    /// Validate allocation configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_proxy_port > self.max_proxy_port {
            return Err(ConfigError::ValidationError(format!(
                "min_proxy_port {} is greater than max_proxy_port {}",
                self.min_proxy_port, self.max_proxy_port
            )));
        }
        Ok(())
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            tunnel_subnet: default_tunnel_subnet(),
            min_proxy_port: DEFAULT_MIN_PROXY_PORT,
            max_proxy_port: DEFAULT_MAX_PROXY_PORT,
            reserved_ports: Vec::new(),
        }
    }
}

/// Peer lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    /// `wg` binary
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,

    /// Reload argv; `{interface}` is replaced with the hub interface.
    /// An empty list disables reloading.
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,

    /// Persistent keepalive in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Prefix system commands with `sudo`
    #[serde(default)]
    pub use_sudo: bool,

    /// Timeout for a single system command in seconds
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Wait for a busy router in seconds
    #[serde(default = "default_lock_acquire_secs")]
    pub lock_acquire_secs: u64,

    /// Maximum time an apply may hold its router in seconds
    #[serde(default = "default_lock_hold_secs")]
    pub lock_hold_secs: u64,

    /// Retry policy for peer applies, single and batched
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl PeerConfig {
    /// Validate peer configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wg_binary.is_empty() {
            return Err(ConfigError::ValidationError(
                "peer.wg_binary cannot be empty".into(),
            ));
        }

        if self.command_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "command_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.lock_acquire_secs == 0 || self.lock_hold_secs == 0 {
            return Err(ConfigError::ValidationError(
                "lock timeouts must be greater than 0".into(),
            ));
        }

        if self.retry.attempts == 0 {
            return Err(ConfigError::ValidationError(
                "peer.retry.attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub const fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_acquire_secs)
    }

    #[must_use]
    pub const fn lock_hold_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_hold_secs)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            wg_binary: default_wg_binary(),
            reload_command: default_reload_command(),
            keepalive_secs: default_keepalive_secs(),
            use_sudo: false,
            command_timeout_secs: default_command_timeout_secs(),
            lock_acquire_secs: default_lock_acquire_secs(),
            lock_hold_secs: default_lock_hold_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Firewall mapping configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    /// `iptables` binary
    #[serde(default = "default_iptables_binary")]
    pub iptables_binary: String,

    /// Router management port that proxy ports forward to
    #[serde(default = "default_management_port")]
    pub management_port: u16,

    /// Reinstall every mapping at startup
    #[serde(default = "default_true")]
    pub rebuild_on_start: bool,
}

impl NatConfig {
    /// Validate NAT configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iptables_binary.is_empty() {
            return Err(ConfigError::ValidationError(
                "nat.iptables_binary cannot be empty".into(),
            ));
        }
        if self.management_port == 0 {
            return Err(ConfigError::ValidationError(
                "management_port must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            iptables_binary: default_iptables_binary(),
            management_port: DEFAULT_MANAGEMENT_PORT,
            rebuild_on_start: true,
        }
    }
}

/// Router management API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// API port on the router's tunnel address
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Connect and per-command timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Profile applied on suspend
    #[serde(default = "default_suspended_profile")]
    pub suspended_profile: String,

    /// Profile applied on unsuspend
    #[serde(default = "default_profile")]
    pub default_profile: String,

    /// PPP service for new secrets
    #[serde(default = "default_ppp_service")]
    pub ppp_service: String,
}

impl ApiConfig {
    /// Validate API configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "api.port must be greater than 0".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.suspended_profile.is_empty() || self.default_profile.is_empty() {
            return Err(ConfigError::ValidationError(
                "Profile names cannot be empty".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Client settings for [`crate::api::RouterApiClient`]
    #[must_use]
    pub fn settings(&self) -> ApiSettings {
        ApiSettings {
            port: self.port,
            connect_timeout: self.connect_timeout(),
            suspended_profile: self.suspended_profile.clone(),
            default_profile: self.default_profile.clone(),
            ppp_service: self.ppp_service.clone(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_API_PORT,
            connect_timeout_secs: default_connect_timeout_secs(),
            suspended_profile: default_suspended_profile(),
            default_profile: default_profile(),
            ppp_service: default_ppp_service(),
        }
    }
}

/// Session reconciliation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// Handling of routers that cannot be polled
    #[serde(default)]
    pub unreachable_policy: UnreachablePolicy,

    /// Retries of the live session fetch before a router counts as unreachable
    #[serde(default = "default_fetch_retry")]
    pub fetch_retry: RetryPolicy,
}

impl ReconcileConfig {
    /// Validate reconcile configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_retry.attempts == 0 {
            return Err(ConfigError::ValidationError(
                "reconcile.fetch_retry.attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            unreachable_policy: UnreachablePolicy::default(),
            fetch_retry: default_fetch_retry(),
        }
    }
}

fn default_fetch_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_secs(2))
}

/// Periodic job configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Peer sync interval in seconds (0 disables the job)
    #[serde(default = "default_peer_sync_interval_secs")]
    pub peer_sync_interval_secs: u64,

    /// Session reconcile interval in seconds (0 disables the job)
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Bound on concurrent per-router work
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Deadline for the peer apply phase in seconds
    #[serde(default = "default_sync_phase_timeout_secs")]
    pub sync_phase_timeout_secs: u64,
}

impl SchedulerConfig {
    /// Validate scheduler configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        if self.sync_phase_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync_phase_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// `None` when the job is disabled
    #[must_use]
    pub const fn peer_sync_interval(&self) -> Option<Duration> {
        interval(self.peer_sync_interval_secs)
    }

    /// `None` when the job is disabled
    #[must_use]
    pub const fn reconcile_interval(&self) -> Option<Duration> {
        interval(self.reconcile_interval_secs)
    }

    #[must_use]
    pub const fn sync_phase_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_phase_timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            peer_sync_interval_secs: default_peer_sync_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            max_concurrency: default_max_concurrency(),
            sync_phase_timeout_secs: default_sync_phase_timeout_secs(),
        }
    }
}

const fn interval(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// Router inventory configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// JSON array of router records
    #[serde(default = "default_inventory")]
    pub inventory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            inventory: default_inventory(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log format '{}' (expected json or text)",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: true,
        }
    }
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

const fn default_hub_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 100, 0, 1)
}

fn default_public_host() -> String {
    "127.0.0.1".into()
}

fn default_interface() -> String {
    crate::peer::DEFAULT_INTERFACE.into()
}

fn default_tunnel_subnet() -> String {
    crate::alloc::DEFAULT_TUNNEL_SUBNET.into()
}

const fn default_min_proxy_port() -> u16 {
    DEFAULT_MIN_PROXY_PORT
}

const fn default_max_proxy_port() -> u16 {
    DEFAULT_MAX_PROXY_PORT
}

fn default_wg_binary() -> String {
    "wg".into()
}

fn default_reload_command() -> Vec<String> {
    vec!["wg-quick".into(), "save".into(), "{interface}".into()]
}

const fn default_keepalive_secs() -> u64 {
    25
}

const fn default_command_timeout_secs() -> u64 {
    10
}

const fn default_lock_acquire_secs() -> u64 {
    5
}

const fn default_lock_hold_secs() -> u64 {
    60
}

fn default_iptables_binary() -> String {
    "iptables".into()
}

const fn default_management_port() -> u16 {
    DEFAULT_MANAGEMENT_PORT
}

const fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_suspended_profile() -> String {
    "suspended".into()
}

fn default_profile() -> String {
    "default".into()
}

fn default_ppp_service() -> String {
    "any".into()
}

const fn default_peer_sync_interval_secs() -> u64 {
    60
}

const fn default_reconcile_interval_secs() -> u64 {
    30
}

const fn default_max_concurrency() -> usize {
    16
}

const fn default_sync_phase_timeout_secs() -> u64 {
    120
}

fn default_inventory() -> PathBuf {
    PathBuf::from("/etc/router-fleet/routers.json")
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}
