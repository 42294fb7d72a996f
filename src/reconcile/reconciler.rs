//! `SessionReconciler` - keeps session records in line with live devices
//!
//! # Cycle
//!
//! For each router:
//! 1. Take one snapshot of live usernames from the device
//! 2. Normalize and diff against the recorded active usernames
//! 3. Upsert sessions that came online, deactivate those that went offline
//! 4. Flip subscriber flags only when the aggregate actually changes
//!
//! Usernames present in both sets produce no writes at all.
//!
//! Fleet cycles fetch snapshots concurrently, then write every router's
//! online changes before any offline change. The "active on another router"
//! check therefore sees every session the same cycle reported.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::diff::{diff, normalize_all, SessionDiff};
use super::{ReconcileError, UnreachablePolicy};
use crate::api::{ApiError, RouterApiClient};
use crate::model::{Router, RouterId, TenantId};
use crate::retry::RetryPolicy;
use crate::store::{RouterStore, SessionStore, SubscriberStore};

/// Default number of routers polled at once
pub const DEFAULT_POLL_CONCURRENCY: usize = 16;

/// Source of live usernames per router
#[async_trait]
pub trait LiveSessionSource: Send + Sync {
    async fn active_usernames(&self, router: RouterId) -> Result<HashSet<String>, ApiError>;
}

#[async_trait]
impl LiveSessionSource for RouterApiClient {
    async fn active_usernames(&self, router: RouterId) -> Result<HashSet<String>, ApiError> {
        RouterApiClient::active_usernames(self, router).await
    }
}

/// Outcome of reconciling one router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub router_id: RouterId,
    /// Whether the live snapshot could be fetched
    pub reachable: bool,
    /// Router was unreachable and left untouched
    pub skipped: bool,
    pub came_online: Vec<String>,
    pub went_offline: Vec<String>,
    pub subscribers_set_online: usize,
    pub subscribers_set_offline: usize,
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn new(router_id: RouterId) -> Self {
        Self {
            router_id,
            reachable: false,
            skipped: false,
            came_online: Vec::new(),
            went_offline: Vec::new(),
            subscribers_set_online: 0,
            subscribers_set_offline: 0,
            unchanged: 0,
        }
    }
}

/// Outcome of a fleet cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReconcileReport {
    pub reports: Vec<ReconcileReport>,
    /// Routers whose diff could not be applied
    pub failed: Vec<RouterId>,
}

impl FleetReconcileReport {
    pub fn unreachable(&self) -> usize {
        self.reports.iter().filter(|r| !r.reachable).count()
    }

    fn fail(&mut self, router: RouterId, error: &ReconcileError) {
        warn!(router_id = %router, operation = "reconcile", outcome = "failed", error = %error);
        self.failed.push(router);
    }
}

type Snapshot = Result<HashSet<String>, ApiError>;

/// A router's diff between the fetch and the write phases
struct Pending {
    router: Router,
    report: ReconcileReport,
    changes: SessionDiff,
}

/// Diff-based session reconciler
pub struct SessionReconciler {
    routers: Arc<dyn RouterStore>,
    sessions: Arc<dyn SessionStore>,
    subscribers: Arc<dyn SubscriberStore>,
    source: Arc<dyn LiveSessionSource>,
    policy: UnreachablePolicy,
    concurrency: usize,
    retry: RetryPolicy,
}

impl SessionReconciler {
    pub fn new(
        routers: Arc<dyn RouterStore>,
        sessions: Arc<dyn SessionStore>,
        subscribers: Arc<dyn SubscriberStore>,
        source: Arc<dyn LiveSessionSource>,
    ) -> Self {
        Self {
            routers,
            sessions,
            subscribers,
            source,
            policy: UnreachablePolicy::default(),
            concurrency: DEFAULT_POLL_CONCURRENCY,
            retry: RetryPolicy::once(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: UnreachablePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Retry policy for the live snapshot fetch
    ///
    /// The unreachable policy applies only once every attempt has failed.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reconcile one router
    ///
    /// An unreachable router is not an error: it is handled by the
    /// configured [`UnreachablePolicy`].
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Store` on store failures.
    pub async fn reconcile_router(&self, id: RouterId) -> Result<ReconcileReport, ReconcileError> {
        let router = self.routers.get_router(id).await?;
        let snapshot = self.fetch(id).await;
        let mut pending = self.prepare(router, snapshot).await?;
        self.apply_online(&mut pending).await?;
        self.apply_offline(&mut pending).await?;
        Ok(Self::finish(pending))
    }

    /// Reconcile every router in the fleet
    ///
    /// Every router's online changes are written before any offline change,
    /// so a user who moved between routers within one cycle is never cleared.
    /// One router's failure never stops the cycle.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Store` only if the router list cannot be read.
    pub async fn reconcile_fleet(&self) -> Result<FleetReconcileReport, ReconcileError> {
        let routers = self.routers.list_routers().await?;

        let snapshots: Vec<(Router, Snapshot)> = stream::iter(routers)
            .map(|router| async move {
                let snapshot = self.fetch(router.id).await;
                (router, snapshot)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut fleet = FleetReconcileReport::default();
        let mut prepared = Vec::with_capacity(snapshots.len());
        for (router, snapshot) in snapshots {
            let id = router.id;
            match self.prepare(router, snapshot).await {
                Ok(pending) => prepared.push(pending),
                Err(e) => fleet.fail(id, &e),
            }
        }
        prepared.sort_by_key(|p| p.report.router_id);

        let mut online_done = Vec::with_capacity(prepared.len());
        for mut pending in prepared {
            match self.apply_online(&mut pending).await {
                Ok(()) => online_done.push(pending),
                Err(e) => fleet.fail(pending.report.router_id, &e),
            }
        }

        for mut pending in online_done {
            match self.apply_offline(&mut pending).await {
                Ok(()) => fleet.reports.push(Self::finish(pending)),
                Err(e) => fleet.fail(pending.report.router_id, &e),
            }
        }
        fleet.reports.sort_by_key(|r| r.router_id);
        fleet.failed.sort();

        info!(
            operation = "reconcile.fleet",
            routers = fleet.reports.len(),
            unreachable = fleet.unreachable(),
            failed = fleet.failed.len(),
            "Reconcile cycle finished"
        );
        Ok(fleet)
    }

    async fn fetch(&self, id: RouterId) -> Snapshot {
        self.retry
            .run("reconcile.fetch", move |_| self.source.active_usernames(id))
            .await
    }

    /// Record the poll outcome and diff the snapshot against stored sessions
    async fn prepare(&self, router: Router, snapshot: Snapshot) -> Result<Pending, ReconcileError> {
        let id = router.id;
        let now = Utc::now();
        let mut report = ReconcileReport::new(id);

        let live: BTreeSet<String> = match snapshot {
            Ok(names) => {
                report.reachable = true;
                self.routers.record_poll(id, true, now).await?;
                normalize_all(names)
            }
            Err(e) => {
                warn!(
                    router_id = %id,
                    operation = "reconcile",
                    outcome = "unreachable",
                    policy = ?self.policy,
                    error = %e,
                    "Router unreachable"
                );
                self.routers.record_poll(id, false, now).await?;
                match self.policy {
                    UnreachablePolicy::TreatAsEmpty => BTreeSet::new(),
                    UnreachablePolicy::Skip => {
                        report.skipped = true;
                        return Ok(Pending {
                            router,
                            report,
                            changes: SessionDiff::default(),
                        });
                    }
                }
            }
        };

        let recorded = self.sessions.active_usernames(id).await?;
        let changes = diff(&live, &recorded);
        report.unchanged = changes.unchanged;
        Ok(Pending {
            router,
            report,
            changes,
        })
    }

    async fn apply_online(&self, pending: &mut Pending) -> Result<(), ReconcileError> {
        let id = pending.router.id;
        let now = Utc::now();
        for username in &pending.changes.newly_online {
            self.sessions.upsert_active(id, username, now).await?;
            if let Some(tenant) = pending.router.tenant_id {
                if self.mark_online(tenant, username).await? {
                    pending.report.subscribers_set_online += 1;
                }
            }
        }
        Ok(())
    }

    async fn apply_offline(&self, pending: &mut Pending) -> Result<(), ReconcileError> {
        let id = pending.router.id;
        let now = Utc::now();
        for username in &pending.changes.newly_offline {
            self.sessions.deactivate(id, username, now).await?;
            if let Some(tenant) = pending.router.tenant_id {
                if self.mark_offline(id, tenant, username).await? {
                    pending.report.subscribers_set_offline += 1;
                }
            }
        }
        Ok(())
    }

    fn finish(pending: Pending) -> ReconcileReport {
        let Pending {
            mut report,
            changes,
            ..
        } = pending;
        let id = report.router_id;

        if report.skipped {
            return report;
        }
        if changes.is_empty() {
            debug!(router_id = %id, operation = "reconcile", outcome = "unchanged", sessions = report.unchanged);
            return report;
        }

        report.came_online = changes.newly_online.into_iter().collect();
        report.went_offline = changes.newly_offline.into_iter().collect();
        info!(
            router_id = %id,
            operation = "reconcile",
            outcome = "applied",
            online = report.came_online.len(),
            offline = report.went_offline.len(),
            unchanged = report.unchanged
        );
        report
    }

    /// Set the flag unless it is already set
    async fn mark_online(&self, tenant: TenantId, username: &str) -> Result<bool, ReconcileError> {
        if self.subscribers.subscriber_online(tenant, username).await? == Some(true) {
            return Ok(false);
        }
        self.subscribers
            .set_subscriber_online(tenant, username, true)
            .await?;
        Ok(true)
    }

    /// Clear the flag unless another router still reports the user
    async fn mark_offline(
        &self,
        router: RouterId,
        tenant: TenantId,
        username: &str,
    ) -> Result<bool, ReconcileError> {
        if self
            .sessions
            .is_active_elsewhere(username, router, Some(tenant))
            .await?
        {
            debug!(router_id = %router, username, "Still active on another router");
            return Ok(false);
        }
        if self.subscribers.subscriber_online(tenant, username).await? != Some(true) {
            return Ok(false);
        }
        self.subscribers
            .set_subscriber_online(tenant, username, false)
            .await?;
        Ok(true)
    }
}
