//! `NatRuleManager` - per-router management port forwarding
//!
//! Exposes each router's management port on the hub as
//! `(public_host:proxy_port) -> (tunnel_address:management_port)`.
//!
//! Every insert is preceded by a best-effort delete of the identical rule,
//! so applying a mapping any number of times leaves exactly one copy of each
//! rule. A rule operation that fails is logged and counted; the remaining
//! operations still run.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::firewall::{DeleteOutcome, Firewall};
use super::rule::{FirewallRule, PortMapping};
use super::NatError;
use crate::alloc::{ProxyPortAllocator, TunnelAddressAllocator};
use crate::model::{Router, RouterId};
use crate::store::RouterStore;

/// Default router management port
pub const DEFAULT_MANAGEMENT_PORT: u16 = 8291;

/// Counts of rule operations performed for one router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleStats {
    pub installed: usize,
    pub deleted: usize,
    pub absent: usize,
    pub errors: usize,
}

impl RuleStats {
    fn merge(&mut self, other: Self) {
        self.installed += other.installed;
        self.deleted += other.deleted;
        self.absent += other.absent;
        self.errors += other.errors;
    }
}

/// Result of ensuring or removing one router's mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingReport {
    pub router_id: RouterId,
    pub tunnel_address: Option<Ipv4Addr>,
    pub proxy_port: Option<u16>,
    pub stats: RuleStats,
}

impl MappingReport {
    /// No rule operation failed
    pub fn is_clean(&self) -> bool {
        self.stats.errors == 0
    }
}

/// Result of a fleet-wide rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Routers whose rules were reapplied without errors
    pub rebuilt: Vec<RouterId>,
    /// Routers with at least one failed rule operation
    pub failed: Vec<RouterId>,
    /// Routers lacking a port or a valid tunnel address
    pub skipped: usize,
    pub stats: RuleStats,
}

/// Installs and removes management forwards
pub struct NatRuleManager {
    store: Arc<dyn RouterStore>,
    addresses: Arc<TunnelAddressAllocator>,
    ports: Arc<ProxyPortAllocator>,
    firewall: Arc<dyn Firewall>,
    hub_address: Ipv4Addr,
    management_port: u16,
}

impl NatRuleManager {
    pub fn new(
        store: Arc<dyn RouterStore>,
        addresses: Arc<TunnelAddressAllocator>,
        ports: Arc<ProxyPortAllocator>,
        firewall: Arc<dyn Firewall>,
        hub_address: Ipv4Addr,
        management_port: u16,
    ) -> Self {
        Self {
            store,
            addresses,
            ports,
            firewall,
            hub_address,
            management_port,
        }
    }

    /// Allocate whatever the router lacks and install its rule set
    ///
    /// # Errors
    ///
    /// - `NatError::Allocation` if an address or port cannot be allocated
    /// - `NatError::Store` on store failures
    ///
    /// Rule failures are reported in [`MappingReport::stats`], not as errors.
    pub async fn ensure_mapping(&self, id: RouterId) -> Result<MappingReport, NatError> {
        let address = self.addresses.allocate(id).await?;
        let port = self.ports.allocate(id).await?;

        let router = self.store.get_router(id).await?;
        let public_host = self.ports.public_host();
        if router.public_host.as_deref() != Some(public_host) {
            self.store.set_public_host(id, public_host).await?;
        }

        let stats = self.install(id, &self.mapping(port, address)).await;
        let report = MappingReport {
            router_id: id,
            tunnel_address: Some(address),
            proxy_port: Some(port),
            stats,
        };

        if report.is_clean() {
            info!(
                router_id = %id,
                operation = "nat.ensure",
                outcome = "installed",
                proxy = %format!("{public_host}:{port}"),
                target = %format!("{address}:{}", self.management_port),
                "Mapping installed"
            );
        } else {
            warn!(
                router_id = %id,
                operation = "nat.ensure",
                outcome = "partial",
                errors = stats.errors,
                "Mapping installed with rule errors"
            );
        }
        Ok(report)
    }

    /// Delete the router's rules and release its proxy port
    ///
    /// # Errors
    ///
    /// Returns `NatError::Store` on store failures.
    pub async fn remove_mapping(&self, id: RouterId) -> Result<MappingReport, NatError> {
        let router = self.store.get_router(id).await?;

        let stats = match (router.proxy_port, router.tunnel_ipv4()) {
            (Some(port), Some(address)) => self.uninstall(id, &self.mapping(port, address)).await,
            _ => {
                debug!(router_id = %id, operation = "nat.remove", outcome = "no_rules");
                RuleStats::default()
            }
        };

        self.store.clear_proxy_mapping(id).await?;
        info!(
            router_id = %id,
            operation = "nat.remove",
            outcome = if stats.errors == 0 { "removed" } else { "partial" },
            deleted = stats.deleted,
            errors = stats.errors
        );

        Ok(MappingReport {
            router_id: id,
            tunnel_address: router.tunnel_ipv4(),
            proxy_port: router.proxy_port,
            stats,
        })
    }

    /// Reapply rules for every router that has both a port and an address
    ///
    /// Nothing is allocated here. Used after a hub restart, when the kernel
    /// tables are empty.
    ///
    /// # Errors
    ///
    /// Returns `NatError::Store` only if the router list cannot be read.
    pub async fn rebuild_all(&self) -> Result<RebuildReport, NatError> {
        let routers = self.store.list_routers().await?;
        let mut report = RebuildReport::default();

        for router in &routers {
            let Some(mapping) = self.mapping_for(router) else {
                report.skipped += 1;
                continue;
            };
            let stats = self.install(router.id, &mapping).await;
            if stats.errors == 0 {
                report.rebuilt.push(router.id);
            } else {
                warn!(router_id = %router.id, operation = "nat.rebuild", outcome = "partial", errors = stats.errors);
                report.failed.push(router.id);
            }
            report.stats.merge(stats);
        }

        info!(
            operation = "nat.rebuild",
            rebuilt = report.rebuilt.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "NAT rules rebuilt"
        );
        Ok(report)
    }

    fn mapping(&self, proxy_port: u16, tunnel_address: Ipv4Addr) -> PortMapping {
        PortMapping {
            proxy_port,
            tunnel_address,
            management_port: self.management_port,
            hub_address: self.hub_address,
        }
    }

    fn mapping_for(&self, router: &Router) -> Option<PortMapping> {
        Some(self.mapping(router.proxy_port?, router.tunnel_ipv4()?))
    }

    async fn install(&self, id: RouterId, mapping: &PortMapping) -> RuleStats {
        let mut stats = RuleStats::default();
        for rule in mapping.rules() {
            self.delete_one(id, &rule, &mut stats).await;
            match self.firewall.insert_rule(&rule).await {
                Ok(()) => stats.installed += 1,
                Err(e) => {
                    warn!(router_id = %id, rule = %rule, error = %e, "Rule insert failed");
                    stats.errors += 1;
                }
            }
        }
        stats
    }

    async fn uninstall(&self, id: RouterId, mapping: &PortMapping) -> RuleStats {
        let mut stats = RuleStats::default();
        for rule in mapping.rules() {
            self.delete_one(id, &rule, &mut stats).await;
        }
        stats
    }

    async fn delete_one(&self, id: RouterId, rule: &FirewallRule, stats: &mut RuleStats) {
        match self.firewall.delete_rule(rule).await {
            Ok(DeleteOutcome::Deleted) => stats.deleted += 1,
            Ok(DeleteOutcome::NotFound) => stats.absent += 1,
            Err(e) => {
                warn!(router_id = %id, rule = %rule, error = %e, "Rule delete failed");
                stats.errors += 1;
            }
        }
    }
}
