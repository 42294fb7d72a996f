//! Bounded retries with a fixed delay
//!
//! Jobs that touch remote or privileged state retry a fixed number of times
//! with a constant pause between attempts. Errors that report themselves as
//! non-recoverable stop the loop immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default number of attempts (including the first)
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default pause between attempts
pub const DEFAULT_DELAY_SECS: u64 = 5;

/// Errors that can tell whether another attempt may succeed
pub trait Recoverable {
    fn is_recoverable(&self) -> bool;
}

/// Retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Fixed delay between attempts in seconds
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_secs: delay.as_secs(),
        }
    }

    /// A policy that tries once
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            delay_secs: 0,
        }
    }

    pub const fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Run `operation` until it succeeds, fails non-recoverably, or attempts run out
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Recoverable + std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_recoverable() => {
                    warn!(operation = label, attempt, error = %e, "Non-recoverable failure");
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    warn!(operation = label, attempts, error = %e, "Retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        operation = label,
                        attempt,
                        delay = ?self.delay(),
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay()).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay_secs: DEFAULT_DELAY_SECS,
        }
    }
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_delay_secs() -> u64 {
    DEFAULT_DELAY_SECS
}
