//! `RouterApiClient` - management operations on remote routers
//!
//! Every call resolves connection parameters from the router record, opens
//! one session through the tunnel with a short connect timeout and runs a
//! handful of commands. There are no retries here; callers decide.
//!
//! Operations that change device state return `bool`: failures are logged
//! with the router id and operation and come back as `false`. Listing
//! operations return `Result` so the reconciler can tell an unreachable
//! router from one with nobody online.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::connection::{
    credential_source, resolve_connection, ConnectionParams, DEFAULT_API_PORT,
};
use super::transport::{ApiCommand, ApiSession, ApiTransport, Row, ID_KEY};
use super::ApiError;
use crate::model::RouterId;
use crate::store::RouterStore;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriber access method on the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMethod {
    /// PPP secrets and PPP active connections
    Ppp,
    /// Hotspot users and hotspot active hosts
    Hotspot,
}

impl AccessMethod {
    pub const ALL: [Self; 2] = [Self::Ppp, Self::Hotspot];

    /// Menu holding credentials
    pub const fn credential_menu(self) -> &'static str {
        match self {
            Self::Ppp => "/ppp/secret",
            Self::Hotspot => "/ip/hotspot/user",
        }
    }

    /// Menu listing live sessions
    pub const fn active_menu(self) -> &'static str {
        match self {
            Self::Ppp => "/ppp/active",
            Self::Hotspot => "/ip/hotspot/active",
        }
    }

    /// Attribute naming the user in the live session menu
    pub const fn active_user_key(self) -> &'static str {
        match self {
            Self::Ppp => "name",
            Self::Hotspot => "user",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ppp => "ppp",
            Self::Hotspot => "hotspot",
        }
    }
}

/// Credential to create or update on a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberCredential {
    pub method: AccessMethod,
    pub username: String,
    pub password: String,
    /// Bandwidth/plan profile
    pub profile: Option<String>,
    pub comment: Option<String>,
}

/// A live session reported by a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSession {
    pub method: AccessMethod,
    pub username: String,
    pub address: Option<String>,
    pub mac_address: Option<String>,
    pub uptime: Option<String>,
}

impl LiveSession {
    fn from_row(method: AccessMethod, row: &Row) -> Option<Self> {
        let username = row.get(method.active_user_key())?.clone();
        let mac_key = match method {
            AccessMethod::Ppp => "caller-id",
            AccessMethod::Hotspot => "mac-address",
        };
        Some(Self {
            method,
            username,
            address: row.get("address").cloned(),
            mac_address: row.get(mac_key).cloned(),
            uptime: row.get("uptime").cloned(),
        })
    }
}

/// Client tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub port: u16,
    pub connect_timeout: Duration,
    /// Profile assigned by [`RouterApiClient::suspend`]
    pub suspended_profile: String,
    /// Profile assigned by [`RouterApiClient::unsuspend`]
    pub default_profile: String,
    /// PPP `service` value for newly created secrets
    pub ppp_service: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_API_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            suspended_profile: "suspended".to_string(),
            default_profile: "default".to_string(),
            ppp_service: "any".to_string(),
        }
    }
}

/// Management client for the fleet
pub struct RouterApiClient {
    store: Arc<dyn RouterStore>,
    transport: Arc<dyn ApiTransport>,
    settings: ApiSettings,
}

impl RouterApiClient {
    pub fn new(
        store: Arc<dyn RouterStore>,
        transport: Arc<dyn ApiTransport>,
        settings: ApiSettings,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    /// Open a session, with explicit parameters or from the router record
    ///
    /// # Errors
    ///
    /// Connection resolution errors, `ApiError::Transport` on connect
    /// failure, or `ApiError::Store`.
    pub async fn connect(
        &self,
        router: RouterId,
        explicit: Option<&ConnectionParams>,
    ) -> Result<Box<dyn ApiSession>, ApiError> {
        let params = match explicit {
            Some(params) => params.clone(),
            None => {
                let record = self.store.get_router(router).await?;
                let params = resolve_connection(&record, None, self.settings.port)?;
                debug!(
                    router_id = %router,
                    host = %params.host,
                    account = credential_source(&record).unwrap_or("none"),
                    "Resolved management connection"
                );
                params
            }
        };

        self.transport
            .connect(&params, self.settings.connect_timeout)
            .await
            .map_err(|source| ApiError::Transport { router, source })
    }

    /// Create or update a PPP secret or hotspot user
    pub async fn upsert_credential(&self, router: RouterId, credential: &SubscriberCredential) -> bool {
        let result = self.try_upsert_credential(router, credential).await;
        finish(router, "upsert_credential", result)
    }

    /// Delete a credential; an absent credential counts as deleted
    pub async fn delete_credential(&self, router: RouterId, method: AccessMethod, username: &str) -> bool {
        let result = async {
            let mut session = self.connect(router, None).await?;
            delete_credential(session.as_mut(), router, method, username).await
        }
        .await;
        finish(router, "delete_credential", result)
    }

    /// Assign a profile to an existing credential
    pub async fn set_profile(
        &self,
        router: RouterId,
        method: AccessMethod,
        username: &str,
        profile: &str,
    ) -> bool {
        let result = async {
            let mut session = self.connect(router, None).await?;
            set_profile(session.as_mut(), router, method, username, profile).await
        }
        .await;
        finish(router, "set_profile", result)
    }

    /// Move the credential to the suspended profile and drop its live session
    pub async fn suspend(&self, router: RouterId, method: AccessMethod, username: &str) -> bool {
        let profile = self.settings.suspended_profile.as_str();
        let result = async {
            let mut session = self.connect(router, None).await?;
            set_profile(session.as_mut(), router, method, username, profile).await?;
            disconnect(session.as_mut(), router, method, username).await
        }
        .await;
        finish(router, "suspend", result)
    }

    /// Restore the default profile
    pub async fn unsuspend(&self, router: RouterId, method: AccessMethod, username: &str) -> bool {
        let profile = self.settings.default_profile.as_str();
        let result = async {
            let mut session = self.connect(router, None).await?;
            set_profile(session.as_mut(), router, method, username, profile).await
        }
        .await;
        finish(router, "unsuspend", result)
    }

    /// Live sessions across PPP and hotspot
    ///
    /// A router without the hotspot (or PPP) package simply reports no
    /// sessions for that class.
    ///
    /// # Errors
    ///
    /// Any connection or command failure.
    pub async fn list_sessions(&self, router: RouterId) -> Result<Vec<LiveSession>, ApiError> {
        let mut session = self.connect(router, None).await?;
        let mut live = Vec::new();

        for method in AccessMethod::ALL {
            let command = ApiCommand::new(format!("{}/print", method.active_menu()));
            let rows = match session.query(&command).await {
                Ok(rows) => rows,
                Err(e) if e.is_missing_menu() => {
                    debug!(router_id = %router, method = method.as_str(), "Menu not present");
                    continue;
                }
                Err(source) => return Err(ApiError::Transport { router, source }),
            };
            live.extend(rows.iter().filter_map(|row| LiveSession::from_row(method, row)));
        }

        debug!(router_id = %router, operation = "list_sessions", sessions = live.len());
        Ok(live)
    }

    /// Usernames with a live session of either class
    ///
    /// # Errors
    ///
    /// Same as [`list_sessions`](Self::list_sessions).
    pub async fn active_usernames(&self, router: RouterId) -> Result<HashSet<String>, ApiError> {
        Ok(self
            .list_sessions(router)
            .await?
            .into_iter()
            .map(|s| s.username)
            .collect())
    }

    /// Drop every live session of `username`; none counts as success
    pub async fn disconnect(&self, router: RouterId, method: AccessMethod, username: &str) -> bool {
        let result = async {
            let mut session = self.connect(router, None).await?;
            disconnect(session.as_mut(), router, method, username).await
        }
        .await;
        finish(router, "disconnect", result)
    }

    /// Authenticate a device on the captive portal directly
    ///
    /// Without `ip` the address is taken from the device's hotspot host
    /// entry for `mac`. A device the router has not seen cannot be logged in.
    pub async fn login_hotspot(
        &self,
        router: RouterId,
        mac: &str,
        ip: Option<&str>,
        username: &str,
        password: &str,
    ) -> bool {
        let result = async {
            let mut session = self.connect(router, None).await?;
            let session = session.as_mut();
            let ip = match ip {
                Some(ip) => ip.to_string(),
                None => match host_address(session, router, mac).await? {
                    Some(ip) => ip,
                    None => {
                        debug!(router_id = %router, mac, "No hotspot host for device");
                        return Ok(false);
                    }
                },
            };
            let command = ApiCommand::new("/ip/hotspot/active/login")
                .with("user", username)
                .with("password", password)
                .with("mac-address", mac)
                .with("ip", ip);
            run(session, router, &command).await?;
            Ok(true)
        }
        .await;
        finish(router, "login_hotspot", result)
    }

    async fn try_upsert_credential(
        &self,
        router: RouterId,
        credential: &SubscriberCredential,
    ) -> Result<bool, ApiError> {
        let mut session = self.connect(router, None).await?;
        let session = session.as_mut();
        let menu = credential.method.credential_menu();

        let mut command = match find_id(session, router, menu, "name", &credential.username).await? {
            Some(id) => ApiCommand::new(format!("{menu}/set"))
                .with(ID_KEY, id)
                .with("password", credential.password.as_str()),
            None => {
                let mut add = ApiCommand::new(format!("{menu}/add"))
                    .with("name", credential.username.as_str())
                    .with("password", credential.password.as_str());
                if credential.method == AccessMethod::Ppp {
                    add = add.with("service", self.settings.ppp_service.as_str());
                }
                add
            }
        };
        if let Some(profile) = &credential.profile {
            command = command.with("profile", profile.as_str());
        }
        if let Some(comment) = &credential.comment {
            command = command.with("comment", comment.as_str());
        }

        run(session, router, &command).await?;
        Ok(true)
    }
}

async fn run(
    session: &mut dyn ApiSession,
    router: RouterId,
    command: &ApiCommand,
) -> Result<Vec<Row>, ApiError> {
    session
        .query(command)
        .await
        .map_err(|source| ApiError::Transport { router, source })
}

async fn find_ids(
    session: &mut dyn ApiSession,
    router: RouterId,
    menu: &str,
    key: &str,
    value: &str,
) -> Result<Vec<String>, ApiError> {
    let command = ApiCommand::new(format!("{menu}/print")).filter(key, value);
    Ok(run(session, router, &command)
        .await?
        .into_iter()
        .filter_map(|mut row| row.remove(ID_KEY))
        .collect())
}

async fn find_id(
    session: &mut dyn ApiSession,
    router: RouterId,
    menu: &str,
    key: &str,
    value: &str,
) -> Result<Option<String>, ApiError> {
    Ok(find_ids(session, router, menu, key, value).await?.into_iter().next())
}

/// Address the hotspot has seen for `mac`
async fn host_address(
    session: &mut dyn ApiSession,
    router: RouterId,
    mac: &str,
) -> Result<Option<String>, ApiError> {
    let command = ApiCommand::new("/ip/hotspot/host/print").filter("mac-address", mac);
    Ok(run(session, router, &command)
        .await?
        .into_iter()
        .find_map(|mut row| row.remove("address")))
}

/// Remove by id, treating "no such item" as done
async fn remove_id(
    session: &mut dyn ApiSession,
    router: RouterId,
    menu: &str,
    id: String,
) -> Result<(), ApiError> {
    let command = ApiCommand::new(format!("{menu}/remove")).with(ID_KEY, id);
    match session.query(&command).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(source) => Err(ApiError::Transport { router, source }),
    }
}

async fn delete_credential(
    session: &mut dyn ApiSession,
    router: RouterId,
    method: AccessMethod,
    username: &str,
) -> Result<bool, ApiError> {
    let menu = method.credential_menu();
    match find_id(session, router, menu, "name", username).await? {
        Some(id) => remove_id(session, router, menu, id).await?,
        None => debug!(router_id = %router, username, "Credential already absent"),
    }
    Ok(true)
}

async fn set_profile(
    session: &mut dyn ApiSession,
    router: RouterId,
    method: AccessMethod,
    username: &str,
    profile: &str,
) -> Result<bool, ApiError> {
    let menu = method.credential_menu();
    let id = find_id(session, router, menu, "name", username)
        .await?
        .ok_or_else(|| ApiError::CredentialNotFound {
            router,
            username: username.to_string(),
        })?;
    let command = ApiCommand::new(format!("{menu}/set"))
        .with(ID_KEY, id)
        .with("profile", profile);
    run(session, router, &command).await?;
    Ok(true)
}

async fn disconnect(
    session: &mut dyn ApiSession,
    router: RouterId,
    method: AccessMethod,
    username: &str,
) -> Result<bool, ApiError> {
    let menu = method.active_menu();
    let ids = find_ids(session, router, menu, method.active_user_key(), username).await?;
    for id in ids {
        remove_id(session, router, menu, id).await?;
    }
    Ok(true)
}

fn finish(router: RouterId, operation: &'static str, result: Result<bool, ApiError>) -> bool {
    match result {
        Ok(done) => {
            info!(router_id = %router, operation, outcome = "ok");
            done
        }
        Err(e) => {
            let unreachable = matches!(&e, ApiError::Transport { source, .. } if source.is_recoverable());
            warn!(router_id = %router, operation, outcome = "failed", unreachable, error = %e);
            false
        }
    }
}
