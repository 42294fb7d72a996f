//! Periodic fleet jobs
//!
//! Runs the peer sync and the session reconcile on fixed intervals until
//! shut down. Each job runs to completion before its next tick; a tick that
//! falls due while the job is still running is skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::reconcile::SessionReconciler;
use crate::sync::SyncOrchestrator;

/// Interval-driven runner for the sync and reconcile jobs
pub struct Scheduler {
    peer_sync: Option<(Arc<SyncOrchestrator>, Duration)>,
    reconcile: Option<(Arc<SessionReconciler>, Duration)>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            peer_sync: None,
            reconcile: None,
            shutdown_tx,
        }
    }

    #[must_use]
    pub fn with_peer_sync(mut self, sync: Arc<SyncOrchestrator>, period: Duration) -> Self {
        self.peer_sync = Some((sync, period));
        self
    }

    #[must_use]
    pub fn with_reconcile(mut self, reconciler: Arc<SessionReconciler>, period: Duration) -> Self {
        self.reconcile = Some((reconciler, period));
        self
    }

    /// Run every configured job until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) {
        info!(
            peer_sync = ?self.peer_sync.as_ref().map(|(_, p)| p),
            reconcile = ?self.reconcile.as_ref().map(|(_, p)| p),
            "Scheduler started"
        );

        let sync_job = async {
            if let Some((sync, period)) = &self.peer_sync {
                self.every(*period, move || run_peer_sync(sync)).await;
            }
        };
        let reconcile_job = async {
            if let Some((reconciler, period)) = &self.reconcile {
                self.every(*period, move || run_reconcile(reconciler)).await;
            }
        };
        tokio::join!(sync_job, reconcile_job);

        info!("Scheduler stopped");
    }

    /// Stop all jobs after their current run
    pub fn shutdown(&self) {
        info!("Shutting down scheduler");
        self.shutdown_tx.send_replace(true);
    }

    async fn every<F, Fut>(&self, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return;
        }

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => job().await,
                _ = shutdown_rx.changed() => return,
            }
            if *shutdown_rx.borrow() {
                return;
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer sync pass; failures are logged, never raised
pub async fn run_peer_sync(sync: &SyncOrchestrator) {
    match sync.sync_all().await {
        Ok(report) if !report.is_clean() => {
            warn!(
                job = "peer_sync",
                failed = report.failed.len(),
                timed_out = report.timed_out.len(),
                "Peer sync finished with failures"
            );
        }
        Ok(_) => {}
        Err(e) => error!(job = "peer_sync", error = %e, "Peer sync could not start"),
    }
}

/// One reconcile pass; failures are logged, never raised
pub async fn run_reconcile(reconciler: &SessionReconciler) {
    if let Err(e) = reconciler.reconcile_fleet().await {
        error!(job = "reconcile", error = %e, "Reconcile could not start");
    }
}
