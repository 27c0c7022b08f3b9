//! Where a lock gets its wavelength readings from.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::arbiter::ResourceArbiter;
use crate::error::{AppResult, WlmError};
use crate::error_recovery::RetryPolicy;
use crate::registry::NameServerClient;
use crate::rpc::RpcClient;

/// Time-shared access to a wavemeter.
#[async_trait]
pub trait WavelengthSource: Send + Sync {
    /// Register `name` with a requested slot length.
    async fn register(&self, name: &str, slot: Duration) -> AppResult<()>;

    /// Drop the registration of `name`.
    async fn deregister(&self, name: &str) -> AppResult<()>;

    /// A reading attributed to `name`.
    async fn query_wavelength(&self, name: &str, timeout: Duration) -> AppResult<f64>;
}

#[async_trait]
impl WavelengthSource for ResourceArbiter {
    async fn register(&self, name: &str, slot: Duration) -> AppResult<()> {
        ResourceArbiter::register(self, name, Some(slot))
    }

    async fn deregister(&self, name: &str) -> AppResult<()> {
        ResourceArbiter::deregister(self, name)
    }

    async fn query_wavelength(&self, name: &str, timeout: Duration) -> AppResult<f64> {
        ResourceArbiter::query_wavelength(self, name, timeout).await
    }
}

/// How to reach the wavemeter server.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Fixed `host:port`
    Address(String),
    /// Looked up on a name server at every (re)connect
    Named {
        /// Name server address
        nameserver: String,
        /// Registered share name
        name: String,
    },
}

impl Endpoint {
    async fn resolve(&self) -> AppResult<String> {
        match self {
            Endpoint::Address(addr) => Ok(addr.clone()),
            Endpoint::Named { nameserver, name } => {
                NameServerClient::connect(nameserver)
                    .await?
                    .resolve(name)
                    .await
            }
        }
    }
}

/// Wavemeter server reached over RPC.
///
/// Transport failures trigger a reconnect (and re-registration) according to
/// the retry policy. A server that forgot the client, e.g. after evicting it,
/// gets one fresh registration before the call is retried.
pub struct RemoteArbiter {
    endpoint: Endpoint,
    policy: RetryPolicy,
    client: Mutex<Option<RpcClient>>,
    registration: StdMutex<Option<(String, Duration)>>,
}

impl RemoteArbiter {
    /// Remote source at `endpoint`; connects lazily on first use.
    pub fn new(endpoint: Endpoint, policy: RetryPolicy) -> Self {
        Self {
            endpoint,
            policy,
            client: Mutex::new(None),
            registration: StdMutex::new(None),
        }
    }

    fn registration(&self) -> Option<(String, Duration)> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn connect(&self, client: &mut Option<RpcClient>) -> AppResult<()> {
        let addr = self.endpoint.resolve().await?;
        let mut fresh = RpcClient::connect(&addr).await?;
        if let Some((name, slot)) = self.registration() {
            register_on(&mut fresh, &name, slot).await?;
        }
        info!(%addr, "connected to wavemeter server");
        *client = Some(fresh);
        Ok(())
    }

    /// Run `method`, reconnecting on transport failures.
    async fn call<T: serde::de::DeserializeOwned + Send>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> AppResult<T> {
        let tries = self.policy.max_attempts.max(1);
        let mut guard = self.client.lock().await;
        let mut last_err = None;
        let mut reregistered = false;
        let mut attempt = 0;

        while attempt < tries {
            if guard.is_none() {
                if let Err(e) = self.connect(&mut *guard).await {
                    attempt += 1;
                    warn!(attempt, tries, error = %e, "could not reach wavemeter server");
                    last_err = Some(e);
                    if attempt < tries {
                        tokio::time::sleep(self.policy.backoff()).await;
                    }
                    continue;
                }
            }
            // Out of the slot while in flight: a call dropped halfway leaves
            // its reply in the stream, so that connection must not be reused.
            let Some(mut client) = guard.take() else {
                continue;
            };

            match client.call(method, params.clone()).await {
                Ok(value) => {
                    *guard = Some(client);
                    return Ok(value);
                }
                Err(WlmError::NotRegistered(name)) if !reregistered => {
                    reregistered = true;
                    let Some((registered, slot)) = self.registration() else {
                        *guard = Some(client);
                        return Err(WlmError::NotRegistered(name));
                    };
                    warn!(client = %registered, "wavemeter server dropped the session, re-registering");
                    register_on(&mut client, &registered, slot).await?;
                    *guard = Some(client);
                }
                Err(e @ WlmError::Rpc(_)) => {
                    warn!(error = %e, "dropping wavemeter connection");
                    return Err(e);
                }
                Err(e) if e.is_transport() => {
                    attempt += 1;
                    warn!(attempt, tries, error = %e, "wavemeter connection lost");
                    last_err = Some(e);
                    if attempt < tries {
                        tokio::time::sleep(self.policy.backoff()).await;
                    }
                }
                Err(e) => {
                    *guard = Some(client);
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| WlmError::Disconnected(format!("{:?}", self.endpoint))))
    }
}

async fn register_on(client: &mut RpcClient, name: &str, slot: Duration) -> AppResult<()> {
    let code: i64 = client
        .call(
            "register",
            json!({ "name": name, "slot_length": slot.as_secs_f64() }),
        )
        .await?;
    if code == 1 {
        Ok(())
    } else {
        Err(WlmError::UnknownClient(name.to_string()))
    }
}

#[async_trait]
impl WavelengthSource for RemoteArbiter {
    async fn register(&self, name: &str, slot: Duration) -> AppResult<()> {
        let code: i64 = self
            .call(
                "register",
                json!({ "name": name, "slot_length": slot.as_secs_f64() }),
            )
            .await?;
        if code != 1 {
            return Err(WlmError::UnknownClient(name.to_string()));
        }
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((name.to_string(), slot));
        Ok(())
    }

    async fn deregister(&self, name: &str) -> AppResult<()> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let code: i64 = self.call("deregister", json!({ "name": name })).await?;
        if code == 1 {
            Ok(())
        } else {
            Err(WlmError::NotRegistered(name.to_string()))
        }
    }

    async fn query_wavelength(&self, name: &str, timeout: Duration) -> AppResult<f64> {
        self.call(
            "query_wavelength",
            json!({ "name": name, "timeout": timeout.as_secs_f64() }),
        )
        .await
    }
}
