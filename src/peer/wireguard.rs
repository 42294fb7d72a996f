//! Hub-side `WireGuard` control surface
//!
//! The hub interface is driven through the `wg` tool rather than an
//! embedded implementation. [`VpnControl`] is the seam; [`WgCommandControl`]
//! issues the commands and [`MockVpnControl`] models the interface in memory
//! for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::system::{CommandError, CommandRunner};

/// Placeholder substituted with the interface name in the reload command
pub const INTERFACE_PLACEHOLDER: &str = "{interface}";

/// Control surface of the hub tunnel interface
#[async_trait]
pub trait VpnControl: Send + Sync {
    /// Install or update a peer
    async fn set_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        keepalive: Duration,
    ) -> Result<(), CommandError>;

    /// Remove a peer; removing an absent peer succeeds
    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<(), CommandError>;

    /// Persist or reload the interface configuration
    async fn reload(&self, interface: &str) -> Result<(), CommandError>;
}

/// `wg`-based control through a [`CommandRunner`]
pub struct WgCommandControl {
    runner: Arc<dyn CommandRunner>,
    wg_binary: String,
    reload_command: Vec<String>,
}

impl WgCommandControl {
    /// `reload_command` is an argv whose elements may contain `{interface}`
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        wg_binary: impl Into<String>,
        reload_command: Vec<String>,
    ) -> Self {
        Self {
            runner,
            wg_binary: wg_binary.into(),
            reload_command,
        }
    }
}

#[async_trait]
impl VpnControl for WgCommandControl {
    async fn set_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        keepalive: Duration,
    ) -> Result<(), CommandError> {
        let args = vec![
            "set".to_string(),
            interface.to_string(),
            "peer".to_string(),
            public_key.to_string(),
            "allowed-ips".to_string(),
            allowed_ips.to_string(),
            "persistent-keepalive".to_string(),
            keepalive.as_secs().to_string(),
        ];
        self.runner.run_checked(&self.wg_binary, &args).await?;
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<(), CommandError> {
        let args = vec![
            "set".to_string(),
            interface.to_string(),
            "peer".to_string(),
            public_key.to_string(),
            "remove".to_string(),
        ];
        self.runner.run_checked(&self.wg_binary, &args).await?;
        Ok(())
    }

    async fn reload(&self, interface: &str) -> Result<(), CommandError> {
        let Some((program, rest)) = self.reload_command.split_first() else {
            debug!(interface, "No reload command configured");
            return Ok(());
        };
        let args: Vec<String> = rest
            .iter()
            .map(|a| a.replace(INTERFACE_PLACEHOLDER, interface))
            .collect();
        self.runner.run_checked(program, &args).await?;
        Ok(())
    }
}

/// A call observed by [`MockVpnControl`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnCall {
    SetPeer {
        interface: String,
        public_key: String,
        allowed_ips: String,
        keepalive: Duration,
    },
    RemovePeer {
        interface: String,
        public_key: String,
    },
    Reload {
        interface: String,
    },
}

#[derive(Default)]
struct MockState {
    peers: HashMap<String, String>,
    calls: Vec<VpnCall>,
    failing_keys: HashSet<String>,
    fail_reload: bool,
    set_peer_delay: Option<Duration>,
}

/// In-memory interface model for tests
#[derive(Default)]
pub struct MockVpnControl {
    state: Mutex<MockState>,
}

impl MockVpnControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `set_peer` fail for this key
    pub fn fail_key(&self, public_key: &str) {
        self.state.lock().failing_keys.insert(public_key.to_string());
    }

    /// Stop failing `set_peer` for this key
    pub fn heal_key(&self, public_key: &str) {
        self.state.lock().failing_keys.remove(public_key);
    }

    /// Make every reload fail
    pub fn fail_reloads(&self, fail: bool) {
        self.state.lock().fail_reload = fail;
    }

    /// Make `set_peer` sleep before completing
    pub fn set_peer_delay(&self, delay: Duration) {
        self.state.lock().set_peer_delay = Some(delay);
    }

    /// Installed peers as key -> allowed IPs
    pub fn peers(&self) -> HashMap<String, String> {
        self.state.lock().peers.clone()
    }

    pub fn has_peer(&self, public_key: &str) -> bool {
        self.state.lock().peers.contains_key(public_key)
    }

    pub fn calls(&self) -> Vec<VpnCall> {
        self.state.lock().calls.clone()
    }

    pub fn reload_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, VpnCall::Reload { .. }))
            .count()
    }

    pub fn set_peer_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, VpnCall::SetPeer { .. }))
            .count()
    }
}

fn mock_failure(program: &str, stderr: &str) -> CommandError {
    CommandError::Failed {
        program: program.to_string(),
        status: Some(1),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl VpnControl for MockVpnControl {
    async fn set_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        keepalive: Duration,
    ) -> Result<(), CommandError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(VpnCall::SetPeer {
                interface: interface.to_string(),
                public_key: public_key.to_string(),
                allowed_ips: allowed_ips.to_string(),
                keepalive,
            });
            state.set_peer_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing_keys.contains(public_key) {
            return Err(mock_failure("wg", "Unable to modify interface"));
        }
        state
            .peers
            .insert(public_key.to_string(), allowed_ips.to_string());
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        state.calls.push(VpnCall::RemovePeer {
            interface: interface.to_string(),
            public_key: public_key.to_string(),
        });
        state.peers.remove(public_key);
        Ok(())
    }

    async fn reload(&self, interface: &str) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        state.calls.push(VpnCall::Reload {
            interface: interface.to_string(),
        });
        if state.fail_reload {
            return Err(mock_failure("wg-quick", "reload failed"));
        }
        Ok(())
    }
}
