//! `PeerLifecycleManager` - hub-side VPN peer lifecycle
//!
//! Applies and removes routers' `WireGuard` peers on the hub interface and
//! tracks the per-router [`PeerStatus`].
//!
//! # State Machine
//!
//! ```text
//! pending --apply ok--> active
//! pending|active --apply fails--> failed
//! any --remove--> pending (public key cleared)
//! ```
//!
//! # Concurrency
//!
//! Every operation on a router runs under that router's entry in the shared
//! [`RouterLocks`] table, so a scheduled sync and an operator-triggered
//! apply never run `wg` for the same peer at the same time.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::validation::validate_wg_key;
use super::wireguard::VpnControl;
use super::PeerError;
use crate::lock::{LockError, RouterLocks};
use crate::model::{PeerStatus, Router, RouterId};
use crate::retry::RetryPolicy;
use crate::store::RouterStore;

/// Default persistent keepalive
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

/// Default hub tunnel interface
pub const DEFAULT_INTERFACE: &str = "wg0";

/// Hub-side peer lifecycle for the fleet
pub struct PeerLifecycleManager {
    store: Arc<dyn RouterStore>,
    vpn: Arc<dyn VpnControl>,
    locks: Arc<RouterLocks>,
    interface: String,
    keepalive: Duration,
}

impl PeerLifecycleManager {
    pub fn new(
        store: Arc<dyn RouterStore>,
        vpn: Arc<dyn VpnControl>,
        locks: Arc<RouterLocks>,
        interface: impl Into<String>,
        keepalive: Duration,
    ) -> Self {
        Self {
            store,
            vpn,
            locks,
            interface: interface.into(),
            keepalive,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn locks(&self) -> &Arc<RouterLocks> {
        &self.locks
    }

    /// Apply the router's peer and reload the interface
    ///
    /// # Errors
    ///
    /// - `PeerError::MissingPublicKey` / `PeerError::InvalidPublicKey`
    /// - `PeerError::Busy` if another job holds the router
    /// - `PeerError::LockExpired` if the apply overran the hold timeout
    /// - `PeerError::Vpn` if `wg` or the reload failed
    pub async fn apply(&self, id: RouterId) -> Result<(), PeerError> {
        let result = self
            .locks
            .run_exclusive(id, async {
                self.apply_unlocked_no_reload(id).await?;
                self.reload_for(id).await
            })
            .await;
        self.settle(id, result).await
    }

    /// Apply with bounded retries
    ///
    /// Non-recoverable errors stop immediately. When every attempt fails in
    /// the apply step the router is left `failed`. Ending on
    /// `PeerError::Busy` writes no status: the job holding the lock owns it.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn apply_with_retry(&self, id: RouterId, policy: &RetryPolicy) -> Result<(), PeerError> {
        policy.run("peer.apply", |_| self.apply(id)).await
    }

    /// Apply under the router lock without reloading
    ///
    /// Used by the fleet sync, which reloads once after all applies.
    ///
    /// # Errors
    ///
    /// Same as [`apply`](Self::apply) minus reload failures.
    pub async fn apply_no_reload(&self, id: RouterId) -> Result<(), PeerError> {
        let result = self
            .locks
            .run_exclusive(id, self.apply_unlocked_no_reload(id))
            .await;
        self.settle(id, result).await
    }

    /// Apply the peer with no locking and no reload
    ///
    /// The caller must hold the router's lock. Status is updated here.
    ///
    /// # Errors
    ///
    /// - `PeerError::MissingPublicKey` / `PeerError::InvalidPublicKey`
    /// - `PeerError::Vpn` if `wg` failed
    /// - `PeerError::Store` on store failures
    pub async fn apply_unlocked_no_reload(&self, id: RouterId) -> Result<(), PeerError> {
        let router = self.store.get_router(id).await?;
        let key = checked_key(&router)?;

        if let Err(e) = validate_wg_key(key) {
            warn!(router_id = %id, operation = "peer.apply", outcome = "invalid_key", error = %e);
            self.mark(id, PeerStatus::Failed).await;
            return Err(PeerError::InvalidPublicKey { router: id, source: e });
        }

        match self
            .vpn
            .set_peer(&self.interface, key, &router.allowed_routes, self.keepalive)
            .await
        {
            Ok(()) => {
                self.store.set_peer_status(id, PeerStatus::Active).await?;
                info!(
                    router_id = %id,
                    operation = "peer.apply",
                    outcome = "applied",
                    allowed_routes = %router.allowed_routes,
                    "Peer applied"
                );
                Ok(())
            }
            Err(e) => {
                warn!(router_id = %id, operation = "peer.apply", outcome = "failed", error = %e);
                self.mark(id, PeerStatus::Failed).await;
                Err(PeerError::Vpn(e))
            }
        }
    }

    /// Reload the hub interface once
    ///
    /// # Errors
    ///
    /// Returns `PeerError::Vpn` if the reload command failed.
    pub async fn reload(&self) -> Result<(), PeerError> {
        self.vpn.reload(&self.interface).await?;
        info!(interface = %self.interface, operation = "peer.reload", outcome = "reloaded");
        Ok(())
    }

    /// Mark batched applies `failed` after their shared reload failed
    ///
    /// Each write happens under the router's lock. A router another job
    /// holds is left to that job.
    pub async fn mark_reload_failed(&self, ids: &[RouterId]) {
        for &id in ids {
            let marked = self
                .locks
                .run_exclusive(id, self.mark(id, PeerStatus::Failed))
                .await;
            if let Err(e) = marked {
                debug!(router_id = %id, operation = "peer.reload", error = %e, "Status left to lock owner");
            }
        }
    }

    /// Remove the router's peer and clear its peer fields
    ///
    /// Succeeds when the router never had a key or the peer is already gone.
    ///
    /// # Errors
    ///
    /// - `PeerError::Busy` / `PeerError::LockExpired`
    /// - `PeerError::Vpn` if `wg` failed
    /// - `PeerError::Store` on store failures
    pub async fn remove(&self, id: RouterId) -> Result<(), PeerError> {
        self.locks
            .run_exclusive(id, self.remove_unlocked(id))
            .await?
    }

    async fn remove_unlocked(&self, id: RouterId) -> Result<(), PeerError> {
        let router = self.store.get_router(id).await?;
        let Some(key) = router.public_key.as_deref() else {
            debug!(router_id = %id, operation = "peer.remove", outcome = "no_key");
            return Ok(());
        };

        // A key that never validated was never installed
        if validate_wg_key(key).is_ok() {
            self.vpn.remove_peer(&self.interface, key).await?;
            self.vpn.reload(&self.interface).await?;
        }

        self.store.clear_peer(id).await?;
        info!(router_id = %id, operation = "peer.remove", outcome = "removed", "Peer removed");
        Ok(())
    }

    async fn reload_for(&self, id: RouterId) -> Result<(), PeerError> {
        if let Err(e) = self.vpn.reload(&self.interface).await {
            warn!(router_id = %id, operation = "peer.reload", outcome = "failed", error = %e);
            self.mark(id, PeerStatus::Failed).await;
            return Err(PeerError::Vpn(e));
        }
        Ok(())
    }

    /// Flatten a locked result, marking abandoned applies failed
    async fn settle(
        &self,
        id: RouterId,
        result: Result<Result<(), PeerError>, LockError>,
    ) -> Result<(), PeerError> {
        match result {
            Ok(inner) => inner,
            Err(e @ LockError::Expired { .. }) => {
                warn!(router_id = %id, operation = "peer.apply", outcome = "expired", error = %e);
                self.mark(id, PeerStatus::Failed).await;
                Err(e.into())
            }
            Err(e) => {
                debug!(router_id = %id, operation = "peer.apply", outcome = "busy");
                Err(e.into())
            }
        }
    }

    /// Best-effort status write; the original error matters more
    async fn mark(&self, id: RouterId, status: PeerStatus) {
        if let Err(e) = self.store.set_peer_status(id, status).await {
            warn!(router_id = %id, status = %status, error = %e, "Failed to record peer status");
        }
    }
}

fn checked_key(router: &Router) -> Result<&str, PeerError> {
    match router.public_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(PeerError::MissingPublicKey(router.id)),
    }
}
