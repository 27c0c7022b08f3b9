//! Name-based service discovery.
//!
//! Services register `name -> host:port` on a name server so clients can find
//! the wavemeter server or a specific laser lock by name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AppResult, WlmError};
use crate::rpc::{parse_params, to_result, RpcClient, RpcFault, RpcServer, RpcService};

/// What to do when a name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Point the name at the new endpoint
    #[default]
    Replace,
    /// Register under `<name>_copy_<n>` instead
    AutoIncrement,
    /// Refuse the registration
    Error,
}

/// Next candidate after `name` for [`RegistrationPolicy::AutoIncrement`].
///
/// `laser_lock` becomes `laser_lock_copy_1`, `laser_lock_copy_1` becomes
/// `laser_lock_copy_2`.
pub fn next_copy_name(name: &str) -> String {
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() > 1 && parts[parts.len() - 2] == "copy" {
        // At u32::MAX the counter cannot grow, so a fresh suffix is appended.
        if let Some(n) = parts[parts.len() - 1]
            .parse::<u32>()
            .ok()
            .and_then(|n| n.checked_add(1))
        {
            let stem = parts[..parts.len() - 1].join("_");
            return format!("{stem}_{n}");
        }
    }
    format!("{name}_copy_1")
}

/// In-memory name table.
#[derive(Debug, Default)]
pub struct NameRegistry {
    entries: Mutex<BTreeMap<String, String>>,
}

impl NameRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `endpoint` under `name`, returning the name actually used.
    pub fn register(
        &self,
        name: &str,
        endpoint: &str,
        policy: RegistrationPolicy,
    ) -> AppResult<String> {
        let mut entries = self.entries();
        let mut name = name.to_string();
        if entries.contains_key(&name) {
            match policy {
                RegistrationPolicy::Replace => {
                    debug!(%name, "replacing existing registration");
                }
                RegistrationPolicy::AutoIncrement => {
                    while entries.contains_key(&name) {
                        name = next_copy_name(&name);
                    }
                }
                RegistrationPolicy::Error => return Err(WlmError::NameTaken(name)),
            }
        }
        entries.insert(name.clone(), endpoint.to_string());
        info!(%name, %endpoint, "name registered");
        Ok(name)
    }

    /// Endpoint registered under `name`.
    pub fn resolve(&self, name: &str) -> AppResult<String> {
        self.entries()
            .get(name)
            .cloned()
            .ok_or_else(|| WlmError::NameNotFound(name.to_string()))
    }

    /// Every registration
    pub fn list(&self) -> BTreeMap<String, String> {
        self.entries().clone()
    }

    /// Drop the registration of `name`.
    pub fn remove(&self, name: &str) -> AppResult<()> {
        self.entries()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| WlmError::NameNotFound(name.to_string()))
    }
}

#[derive(Deserialize)]
struct RegisterParams {
    name: String,
    endpoint: String,
    #[serde(default)]
    policy: RegistrationPolicy,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

/// RPC surface of a [`NameRegistry`].
pub struct NameServerService {
    registry: Arc<NameRegistry>,
}

impl NameServerService {
    /// Serve `registry`
    pub fn new(registry: Arc<NameRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RpcService for NameServerService {
    fn name(&self) -> &str {
        "nameserver"
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        match method {
            "register" => {
                let p: RegisterParams = parse_params(params)?;
                to_result(self.registry.register(&p.name, &p.endpoint, p.policy)?)
            }
            "resolve" => {
                let p: NameParams = parse_params(params)?;
                to_result(self.registry.resolve(&p.name)?)
            }
            "list" => to_result(self.registry.list()),
            "remove" => {
                let p: NameParams = parse_params(params)?;
                self.registry.remove(&p.name)?;
                to_result(true)
            }
            other => Err(RpcFault::method_not_found(other)),
        }
    }
}

/// Client of a running name server.
pub struct NameServerClient {
    rpc: RpcClient,
}

impl NameServerClient {
    /// Connect to the name server at `address`.
    pub async fn connect(address: &str) -> AppResult<Self> {
        Ok(Self {
            rpc: RpcClient::connect(address).await?,
        })
    }

    /// Register `endpoint` under `name`, returning the name actually used.
    pub async fn register(
        &mut self,
        name: &str,
        endpoint: &str,
        policy: RegistrationPolicy,
    ) -> AppResult<String> {
        self.rpc
            .call(
                "register",
                json!({ "name": name, "endpoint": endpoint, "policy": policy }),
            )
            .await
    }

    /// Endpoint registered under `name`.
    pub async fn resolve(&mut self, name: &str) -> AppResult<String> {
        self.rpc.call("resolve", json!({ "name": name })).await
    }

    /// Every registration
    pub async fn list(&mut self) -> AppResult<BTreeMap<String, String>> {
        self.rpc.call("list", Value::Null).await
    }

    /// Drop the registration of `name`.
    pub async fn remove(&mut self, name: &str) -> AppResult<()> {
        let _: bool = self.rpc.call("remove", json!({ "name": name })).await?;
        Ok(())
    }
}

/// Connect to the name server at `address`, starting one in this process if
/// none answers and `start_if_missing` is set.
///
/// A name server started here runs until `cancel` fires.
pub async fn find_or_start(
    address: &str,
    start_if_missing: bool,
    cancel: &CancellationToken,
) -> AppResult<NameServerClient> {
    match NameServerClient::connect(address).await {
        Ok(client) => {
            info!(%address, "found running name server");
            Ok(client)
        }
        Err(e) if start_if_missing => {
            debug!(%address, error = %e, "no name server answering");
            let service = Arc::new(NameServerService::new(Arc::new(NameRegistry::new())));
            let server = RpcServer::bind(address, service, cancel.child_token()).await?;
            let bound = server.local_addr()?.to_string();
            server.spawn();
            info!(address = %bound, "started name server");
            NameServerClient::connect(&bound).await
        }
        Err(e) => Err(e),
    }
}
