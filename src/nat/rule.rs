//! Firewall rule model
//!
//! A router's management mapping is three rules:
//!
//! | Table  | Chain       | Match                              | Target |
//! |--------|-------------|------------------------------------|--------|
//! | nat    | PREROUTING  | `-p tcp --dport <proxy>`           | `DNAT --to-destination <tunnel>:<mgmt>` |
//! | nat    | POSTROUTING | `-p tcp -d <tunnel> --dport <mgmt>` | `SNAT --to-source <hub>` |
//! | filter | FORWARD     | `-p tcp -d <tunnel> --dport <mgmt>` | `ACCEPT` |

use std::fmt;
use std::net::Ipv4Addr;

/// iptables table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Filter => "filter",
        }
    }
}

/// iptables built-in chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Prerouting,
    Postrouting,
    Forward,
}

impl Chain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prerouting => "PREROUTING",
            Self::Postrouting => "POSTROUTING",
            Self::Forward => "FORWARD",
        }
    }
}

/// A single rule: table, chain and the rule specification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub table: Table,
    pub chain: Chain,
    pub spec: Vec<String>,
}

impl FirewallRule {
    pub fn new(table: Table, chain: Chain, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table.as_str(),
            self.chain.as_str(),
            self.spec.join(" ")
        )
    }
}

/// Parameters of one router's management forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub proxy_port: u16,
    pub tunnel_address: Ipv4Addr,
    pub management_port: u16,
    pub hub_address: Ipv4Addr,
}

impl PortMapping {
    /// The DNAT, SNAT and FORWARD rules, in installation order
    pub fn rules(&self) -> [FirewallRule; 3] {
        let proxy = self.proxy_port.to_string();
        let tunnel = self.tunnel_address.to_string();
        let mgmt = self.management_port.to_string();
        let destination = format!("{tunnel}:{mgmt}");
        let hub = self.hub_address.to_string();

        [
            FirewallRule::new(
                Table::Nat,
                Chain::Prerouting,
                &[
                    "-p",
                    "tcp",
                    "--dport",
                    proxy.as_str(),
                    "-j",
                    "DNAT",
                    "--to-destination",
                    destination.as_str(),
                ],
            ),
            FirewallRule::new(
                Table::Nat,
                Chain::Postrouting,
                &[
                    "-p",
                    "tcp",
                    "-d",
                    tunnel.as_str(),
                    "--dport",
                    mgmt.as_str(),
                    "-j",
                    "SNAT",
                    "--to-source",
                    hub.as_str(),
                ],
            ),
            FirewallRule::new(
                Table::Filter,
                Chain::Forward,
                &[
                    "-p",
                    "tcp",
                    "-d",
                    tunnel.as_str(),
                    "--dport",
                    mgmt.as_str(),
                    "-j",
                    "ACCEPT",
                ],
            ),
        ]
    }
}
