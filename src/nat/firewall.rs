//! Firewall control surface
//!
//! [`IptablesFirewall`] shells out to `iptables`; [`MockFirewall`] keeps an
//! ordered rule table that behaves like the kernel's (duplicates allowed,
//! delete removes the first match).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::rule::{Chain, FirewallRule};
use crate::system::{CommandError, CommandRunner};

/// Outcome of a rule deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No such rule; not an error
    NotFound,
}

/// Firewall rule table
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Insert the rule at the head of its chain
    async fn insert_rule(&self, rule: &FirewallRule) -> Result<(), CommandError>;

    /// Delete the first rule matching exactly
    async fn delete_rule(&self, rule: &FirewallRule) -> Result<DeleteOutcome, CommandError>;
}

/// stderr fragments iptables prints when a delete finds nothing
const NOT_FOUND_MARKERS: &[&str] = &[
    "does a matching rule exist",
    "No chain/target/match by that name",
    "Bad rule",
];

/// `iptables` via a [`CommandRunner`]
pub struct IptablesFirewall {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl IptablesFirewall {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    fn args(action: &str, rule: &FirewallRule) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            rule.table.as_str().to_string(),
            action.to_string(),
            rule.chain.as_str().to_string(),
        ];
        args.extend(rule.spec.iter().cloned());
        args
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn insert_rule(&self, rule: &FirewallRule) -> Result<(), CommandError> {
        self.runner
            .run_checked(&self.binary, &Self::args("-I", rule))
            .await?;
        Ok(())
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> Result<DeleteOutcome, CommandError> {
        let output = self.runner.run(&self.binary, &Self::args("-D", rule)).await?;
        if output.success() {
            return Ok(DeleteOutcome::Deleted);
        }
        if NOT_FOUND_MARKERS.iter().any(|m| output.stderr.contains(m)) {
            trace!(rule = %rule, "Rule absent");
            return Ok(DeleteOutcome::NotFound);
        }
        Err(CommandError::Failed {
            program: self.binary.clone(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[derive(Default)]
struct MockState {
    rules: Vec<FirewallRule>,
    failing_chains: HashSet<Chain>,
    fail_deletes: bool,
    inserts: usize,
    deletes: usize,
}

/// In-memory rule table for tests
#[derive(Default)]
pub struct MockFirewall {
    state: Mutex<MockState>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make inserts into `chain` fail
    pub fn fail_inserts_into(&self, chain: Chain) {
        self.state.lock().failing_chains.insert(chain);
    }

    /// Make every delete fail with a non-"not found" error
    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().fail_deletes = fail;
    }

    /// Current rule table in kernel order
    pub fn rules(&self) -> Vec<FirewallRule> {
        self.state.lock().rules.clone()
    }

    /// How many copies of `rule` are installed
    pub fn count(&self, rule: &FirewallRule) -> usize {
        self.state.lock().rules.iter().filter(|r| *r == rule).count()
    }

    pub fn insert_calls(&self) -> usize {
        self.state.lock().inserts
    }

    pub fn delete_calls(&self) -> usize {
        self.state.lock().deletes
    }
}

fn mock_failure(stderr: &str) -> CommandError {
    CommandError::Failed {
        program: "iptables".to_string(),
        status: Some(4),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl Firewall for MockFirewall {
    async fn insert_rule(&self, rule: &FirewallRule) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        state.inserts += 1;
        if state.failing_chains.contains(&rule.chain) {
            return Err(mock_failure("iptables: Resource temporarily unavailable."));
        }
        state.rules.insert(0, rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> Result<DeleteOutcome, CommandError> {
        let mut state = self.state.lock();
        state.deletes += 1;
        if state.fail_deletes {
            return Err(mock_failure("iptables: Permission denied."));
        }
        match state.rules.iter().position(|r| r == rule) {
            Some(index) => {
                state.rules.remove(index);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }
}
