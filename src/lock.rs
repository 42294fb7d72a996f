//! Per-router exclusive execution
//!
//! Peer apply jobs for the same router must never overlap. [`RouterLocks`]
//! is a keyed lock table: acquiring waits at most `acquire_timeout`, and the
//! guarded operation is abandoned (releasing the lock) once it has run for
//! `hold_timeout`. Both bounds keep a wedged job from starving the router.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::model::RouterId;

/// Default maximum time an exclusive operation may hold its router lock
pub const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait for a busy router before giving up
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error types for keyed locking
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Another job holds the router
    #[error("Router {router} is busy (waited {waited:?})")]
    Busy { router: RouterId, waited: Duration },

    /// The operation exceeded its hold budget and was abandoned
    #[error("Operation on router {router} exceeded {held:?} and was abandoned")]
    Expired { router: RouterId, held: Duration },
}

/// Keyed lock table for router-scoped jobs
pub struct RouterLocks {
    locks: DashMap<RouterId, Arc<Mutex<()>>>,
    acquire_timeout: Duration,
    hold_timeout: Duration,
}

impl RouterLocks {
    pub fn new(acquire_timeout: Duration, hold_timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            acquire_timeout,
            hold_timeout,
        }
    }

    /// Run `operation` while holding the router's lock
    ///
    /// # Errors
    ///
    /// - `LockError::Busy` if the lock could not be taken in time
    /// - `LockError::Expired` if the operation ran past the hold timeout
    pub async fn run_exclusive<F, T>(&self, router: RouterId, operation: F) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        let mutex = Arc::clone(self.locks.entry(router).or_default().value());

        let guard = timeout(self.acquire_timeout, mutex.lock_owned())
            .await
            .map_err(|_| LockError::Busy {
                router,
                waited: self.acquire_timeout,
            })?;

        let result = timeout(self.hold_timeout, operation).await;
        drop(guard);

        result.map_err(|_| {
            warn!(router_id = %router, held = ?self.hold_timeout, "Exclusive operation abandoned");
            LockError::Expired {
                router,
                held: self.hold_timeout,
            }
        })
    }

    /// Whether a job currently holds the router
    pub fn is_locked(&self, router: RouterId) -> bool {
        self.locks
            .get(&router)
            .is_some_and(|m| m.value().try_lock().is_err())
    }

    pub fn hold_timeout(&self) -> Duration {
        self.hold_timeout
    }
}

impl Default for RouterLocks {
    fn default() -> Self {
        Self::new(DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_HOLD_TIMEOUT)
    }
}
