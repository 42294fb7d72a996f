//! `SyncOrchestrator` - fleet-wide peer sync
//!
//! # Phases
//!
//! 1. Apply every pending or failed peer concurrently, without reloading.
//!    Each apply takes the router's lock, so a router already held by
//!    another job is skipped rather than waited on.
//! 2. Reload the hub interface exactly once, if at least one apply
//!    succeeded. A failed reload marks every router applied in phase 1
//!    `failed`, so the next run picks them up again.
//!
//! Recoverable apply errors are retried per router under the configured
//! [`RetryPolicy`] before the router is reported failed.
//!
//! Phase 1 is bounded by a deadline; routers still running when it passes
//! are reported as timed out and their apply is dropped, releasing the lock.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::model::RouterId;
use crate::peer::{PeerError, PeerLifecycleManager};
use crate::retry::RetryPolicy;
use crate::store::{RouterStore, StoreError};

/// Default bound on concurrent applies
pub const DEFAULT_SYNC_CONCURRENCY: usize = 8;

/// Default deadline for the apply phase
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of one `sync_all` run
#[derive(Debug, Default)]
pub struct SyncReport {
    pub applied: Vec<RouterId>,
    pub failed: Vec<(RouterId, PeerError)>,
    /// Routers held by another job
    pub skipped: Vec<RouterId>,
    /// Routers still applying when the phase deadline passed
    pub timed_out: Vec<RouterId>,
    /// `None` when nothing was applied and no reload ran
    pub reload: Option<Result<(), PeerError>>,
}

impl SyncReport {
    /// Whether every selected router was applied and the reload succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.timed_out.is_empty()
            && !matches!(self.reload, Some(Err(_)))
    }
}

enum Outcome {
    Applied,
    Skipped,
    Failed(PeerError),
}

/// Two-phase apply-then-reload across the fleet
pub struct SyncOrchestrator {
    store: Arc<dyn RouterStore>,
    peers: Arc<PeerLifecycleManager>,
    concurrency: usize,
    phase_timeout: Duration,
    retry: RetryPolicy,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn RouterStore>, peers: Arc<PeerLifecycleManager>) -> Self {
        Self {
            store,
            peers,
            concurrency: DEFAULT_SYNC_CONCURRENCY,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
            retry: RetryPolicy::once(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_phase_timeout(mut self, phase_timeout: Duration) -> Self {
        self.phase_timeout = phase_timeout;
        self
    }

    /// Apply all pending peers, then reload once
    ///
    /// # Errors
    ///
    /// Returns `StoreError` only if the router list cannot be read. Per-router
    /// failures are collected in the report.
    pub async fn sync_all(&self) -> Result<SyncReport, StoreError> {
        let targets: Vec<RouterId> = self
            .store
            .list_routers()
            .await?
            .into_iter()
            .filter(|r| r.needs_peer())
            .map(|r| r.id)
            .collect();

        let mut report = SyncReport::default();
        if targets.is_empty() {
            debug!(operation = "peer.sync", outcome = "nothing_to_do");
            return Ok(report);
        }

        let deadline = Instant::now() + self.phase_timeout;
        let mut pending = targets.clone();
        let mut applies = stream::iter(targets)
            .map(|id| async move { (id, self.apply_one(id).await) })
            .buffer_unordered(self.concurrency);

        loop {
            match timeout_at(deadline, applies.next()).await {
                Ok(Some((id, outcome))) => {
                    pending.retain(|p| *p != id);
                    match outcome {
                        Outcome::Applied => report.applied.push(id),
                        Outcome::Skipped => report.skipped.push(id),
                        Outcome::Failed(e) => report.failed.push((id, e)),
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        operation = "peer.sync",
                        outcome = "phase_timeout",
                        remaining = pending.len(),
                        timeout = ?self.phase_timeout,
                        "Apply phase deadline passed"
                    );
                    report.timed_out = pending;
                    break;
                }
            }
        }
        // Drop in-flight applies before reloading
        drop(applies);

        report.applied.sort();
        report.skipped.sort();
        report.timed_out.sort();
        report.failed.sort_by_key(|(id, _)| *id);

        if !report.applied.is_empty() {
            let reload = self.peers.reload().await;
            if let Err(e) = &reload {
                warn!(
                    operation = "peer.sync",
                    outcome = "reload_failed",
                    routers = report.applied.len(),
                    error = %e
                );
                self.peers.mark_reload_failed(&report.applied).await;
            }
            report.reload = Some(reload);
        }

        info!(
            operation = "peer.sync",
            applied = report.applied.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            timed_out = report.timed_out.len(),
            reloaded = report.reload.is_some(),
            "Peer sync finished"
        );
        Ok(report)
    }

    async fn apply_one(&self, id: RouterId) -> Outcome {
        if self.peers.locks().is_locked(id) {
            debug!(router_id = %id, operation = "peer.sync", outcome = "skipped_busy");
            return Outcome::Skipped;
        }
        // Busy ends the attempt loop rather than waiting on the owner again
        let applied = self
            .retry
            .run("peer.sync.apply", move |_| async move {
                match self.peers.apply_no_reload(id).await {
                    Ok(()) => Ok(true),
                    Err(PeerError::Busy(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await;
        match applied {
            Ok(true) => Outcome::Applied,
            Ok(false) => {
                debug!(router_id = %id, operation = "peer.sync", outcome = "skipped_busy");
                Outcome::Skipped
            }
            Err(e) => {
                warn!(router_id = %id, operation = "peer.sync", outcome = "failed", error = %e);
                Outcome::Failed(e)
            }
        }
    }
}
