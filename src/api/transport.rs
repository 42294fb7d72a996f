//! Router management transport seam
//!
//! [`ApiTransport`] opens authenticated sessions; [`ApiSession`] runs
//! RouterOS-style commands: a menu path plus `=attribute=value` and
//! `?query=value` words, answered by zero or more rows.
//!
//! [`MockTransport`] simulates a fleet of devices with generic
//! `print`/`add`/`set`/`remove` semantics over named tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::connection::ConnectionParams;

/// One reply row, attribute name to value
pub type Row = BTreeMap<String, String>;

/// Row id attribute
pub const ID_KEY: &str = ".id";

/// Error types for the management transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// TCP connection could not be established
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    /// Connect or command exceeded its timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Login rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Socket error mid-session
    #[error("I/O error: {0}")]
    Io(String),

    /// Malformed reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device rejected the command (`!trap`)
    #[error("Command rejected: {message}")]
    Trap { message: String },

    /// Device closed the session (`!fatal`)
    #[error("Fatal reply: {0}")]
    Fatal(String),
}

impl TransportError {
    /// The command addressed an item that does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Trap { message } => {
                let message = message.to_lowercase();
                message.contains("no such item") || message.contains("not found")
            }
            _ => false,
        }
    }

    /// The device lacks the menu (package not installed)
    pub fn is_missing_menu(&self) -> bool {
        matches!(self, Self::Trap { message } if message.to_lowercase().contains("no such command"))
    }

    /// Network-level failures may pass on a later attempt
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout(_) | Self::Io(_) | Self::Fatal(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A command for the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCommand {
    /// Menu path with verb, e.g. `/ppp/secret/print`
    pub path: String,
    /// `=name=value` words
    pub attributes: Vec<(String, String)>,
    /// `?name=value` words
    pub queries: Vec<(String, String)>,
}

impl ApiCommand {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attributes: Vec::new(),
            queries: Vec::new(),
        }
    }

    /// Add an attribute word
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.push((name.to_string(), value.into()));
        self
    }

    /// Add a query word
    #[must_use]
    pub fn filter(mut self, name: &str, value: impl Into<String>) -> Self {
        self.queries.push((name.to_string(), value.into()));
        self
    }

    /// Sentence words in wire order
    pub fn words(&self) -> Vec<String> {
        let mut words = Vec::with_capacity(1 + self.attributes.len() + self.queries.len());
        words.push(self.path.clone());
        words.extend(self.attributes.iter().map(|(k, v)| format!("={k}={v}")));
        words.extend(self.queries.iter().map(|(k, v)| format!("?{k}={v}")));
        words
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Opens management sessions
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Connect and log in, bounded by `timeout`
    async fn connect(
        &self,
        params: &ConnectionParams,
        timeout: Duration,
    ) -> Result<Box<dyn ApiSession>, TransportError>;
}

/// An authenticated session
#[async_trait]
pub trait ApiSession: Send {
    /// Run a command and collect its reply rows
    async fn query(&mut self, command: &ApiCommand) -> Result<Vec<Row>, TransportError>;
}

#[derive(Debug, Default)]
struct MockDevice {
    tables: HashMap<String, Vec<Row>>,
    unreachable: bool,
    next_id: u32,
    commands: Vec<ApiCommand>,
}

impl MockDevice {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("*{:X}", self.next_id)
    }

    fn execute(&mut self, command: &ApiCommand) -> Result<Vec<Row>, TransportError> {
        self.commands.push(command.clone());

        if command.path == "/ip/hotspot/active/login" {
            let mut row = Row::new();
            row.insert("user".into(), command.attribute("user").unwrap_or_default().into());
            if let Some(ip) = command.attribute("ip") {
                row.insert("address".into(), ip.into());
            }
            if let Some(mac) = command.attribute("mac-address") {
                row.insert("mac-address".into(), mac.into());
            }
            let id = self.allocate_id();
            row.insert(ID_KEY.into(), id);
            self.tables.entry("/ip/hotspot/active".into()).or_default().push(row);
            return Ok(Vec::new());
        }

        let (table, verb) = command
            .path
            .rsplit_once('/')
            .ok_or_else(|| TransportError::Protocol(format!("bad path {}", command.path)))?;
        let table = table.to_string();

        match verb {
            "print" => Ok(self
                .tables
                .get(&table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| {
                            command
                                .queries
                                .iter()
                                .all(|(k, v)| row.get(k).map(String::as_str) == Some(v.as_str()))
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()),
            "add" => {
                let id = self.allocate_id();
                let mut row: Row = command.attributes.iter().cloned().collect();
                row.insert(ID_KEY.into(), id.clone());
                self.tables.entry(table).or_default().push(row);
                let mut reply = Row::new();
                reply.insert("ret".into(), id);
                Ok(vec![reply])
            }
            "set" => {
                let row = self.find_mut(&table, command)?;
                for (k, v) in &command.attributes {
                    if k != ID_KEY {
                        row.insert(k.clone(), v.clone());
                    }
                }
                Ok(Vec::new())
            }
            "remove" => {
                let id = command.attribute(ID_KEY).unwrap_or_default().to_string();
                let rows = self.tables.entry(table).or_default();
                let before = rows.len();
                rows.retain(|row| row.get(ID_KEY) != Some(&id));
                if rows.len() == before {
                    return Err(no_such_item());
                }
                Ok(Vec::new())
            }
            other => Err(TransportError::Trap {
                message: format!("no such command: {other}"),
            }),
        }
    }

    fn find_mut(&mut self, table: &str, command: &ApiCommand) -> Result<&mut Row, TransportError> {
        let id = command.attribute(ID_KEY).unwrap_or_default();
        self.tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| row.get(ID_KEY).map(String::as_str) == Some(id)))
            .ok_or_else(no_such_item)
    }
}

fn no_such_item() -> TransportError {
    TransportError::Trap {
        message: "no such item".to_string(),
    }
}

#[derive(Default)]
struct MockFleet {
    devices: HashMap<String, MockDevice>,
    connections: Vec<ConnectionParams>,
}

/// In-memory device fleet, keyed by host
#[derive(Default, Clone)]
pub struct MockTransport {
    fleet: Arc<Mutex<MockFleet>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable device at `host`
    pub fn add_device(&self, host: &str) {
        self.fleet.lock().devices.entry(host.to_string()).or_default();
    }

    /// Make connects to `host` fail
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.fleet
            .lock()
            .devices
            .entry(host.to_string())
            .or_default()
            .unreachable = unreachable;
    }

    /// Insert a row into a device table, assigning it an id
    pub fn insert_row(&self, host: &str, table: &str, attributes: &[(&str, &str)]) {
        let mut fleet = self.fleet.lock();
        let device = fleet.devices.entry(host.to_string()).or_default();
        let id = device.allocate_id();
        let mut row: Row = attributes
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        row.insert(ID_KEY.into(), id);
        device.tables.entry(table.to_string()).or_default().push(row);
    }

    /// Replace the live PPP and hotspot session tables
    pub fn set_active_users(&self, host: &str, ppp: &[&str], hotspot: &[&str]) {
        {
            let mut fleet = self.fleet.lock();
            let device = fleet.devices.entry(host.to_string()).or_default();
            device.tables.remove("/ppp/active");
            device.tables.remove("/ip/hotspot/active");
        }
        for name in ppp {
            self.insert_row(host, "/ppp/active", &[("name", name)]);
        }
        for user in hotspot {
            self.insert_row(host, "/ip/hotspot/active", &[("user", user)]);
        }
    }

    /// Rows in a device table
    pub fn rows(&self, host: &str, table: &str) -> Vec<Row> {
        self.fleet
            .lock()
            .devices
            .get(host)
            .and_then(|d| d.tables.get(table).cloned())
            .unwrap_or_default()
    }

    /// Commands a device received
    pub fn commands(&self, host: &str) -> Vec<ApiCommand> {
        self.fleet
            .lock()
            .devices
            .get(host)
            .map(|d| d.commands.clone())
            .unwrap_or_default()
    }

    /// Every connection attempt, successful or not
    pub fn connections(&self) -> Vec<ConnectionParams> {
        self.fleet.lock().connections.clone()
    }
}

#[async_trait]
impl ApiTransport for MockTransport {
    async fn connect(
        &self,
        params: &ConnectionParams,
        _timeout: Duration,
    ) -> Result<Box<dyn ApiSession>, TransportError> {
        let mut fleet = self.fleet.lock();
        fleet.connections.push(params.clone());

        let host = params.host.to_string();
        match fleet.devices.get(&host) {
            Some(device) if !device.unreachable => Ok(Box::new(MockSession {
                fleet: Arc::clone(&self.fleet),
                host,
            })),
            _ => Err(TransportError::Connect {
                host,
                reason: "no route to host".to_string(),
            }),
        }
    }
}

struct MockSession {
    fleet: Arc<Mutex<MockFleet>>,
    host: String,
}

#[async_trait]
impl ApiSession for MockSession {
    async fn query(&mut self, command: &ApiCommand) -> Result<Vec<Row>, TransportError> {
        let mut fleet = self.fleet.lock();
        let device = fleet
            .devices
            .get_mut(&self.host)
            .ok_or_else(|| TransportError::Io("device vanished".to_string()))?;
        if device.unreachable {
            return Err(TransportError::Io("connection reset".to_string()));
        }
        device.execute(command)
    }
}
