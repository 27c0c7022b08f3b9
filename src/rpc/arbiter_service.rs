//! Remote surface of the wavemeter server.
//!
//! | method                  | params                     | result            |
//! |-------------------------|----------------------------|-------------------|
//! | `register`              | `name`, `slot_length?`     | `1`, or `-1` for an unknown name |
//! | `deregister`            | `name`                     | `1`, or `0` if not registered |
//! | `query_available_users` |                            | `[name]`          |
//! | `query_users`           |                            | `[name]`          |
//! | `query_last_readings`   |                            | `{name: nm?}`     |
//! | `query_current_user`    |                            | name, `""` if none |
//! | `query_wavelength`      | `name`, `timeout?`         | nm                |
//! | `query_sessions`        |                            | `{name: session}` |

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{parse_params, to_result, RpcFault, RpcService};
use crate::arbiter::ResourceArbiter;
use crate::error::WlmError;

#[derive(Deserialize)]
struct RegisterParams {
    name: String,
    #[serde(default)]
    slot_length: Option<f64>,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct QueryParams {
    name: String,
    #[serde(default)]
    timeout: Option<f64>,
}

/// Exposes a [`ResourceArbiter`] over RPC.
pub struct ArbiterService {
    arbiter: Arc<ResourceArbiter>,
    default_timeout: Duration,
}

impl ArbiterService {
    /// Service over `arbiter`; queries without a timeout wait `default_timeout`.
    pub fn new(arbiter: Arc<ResourceArbiter>, default_timeout: Duration) -> Self {
        Self {
            arbiter,
            default_timeout,
        }
    }
}

fn positive_secs(secs: Option<f64>, what: &str) -> Option<Duration> {
    let secs = secs?;
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Some(d),
        _ => {
            tracing::warn!(value = secs, "ignoring invalid {}", what);
            None
        }
    }
}

#[async_trait]
impl RpcService for ArbiterService {
    fn name(&self) -> &str {
        "wavemeter"
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        match method {
            "register" => {
                let p: RegisterParams = parse_params(params)?;
                let slot = positive_secs(p.slot_length, "slot length");
                match self.arbiter.register(&p.name, slot) {
                    Ok(()) => to_result(1),
                    Err(WlmError::UnknownClient(name)) => {
                        tracing::warn!(client = %name, "rejected registration of unknown client");
                        to_result(-1)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            "deregister" => {
                let p: NameParams = parse_params(params)?;
                match self.arbiter.deregister(&p.name) {
                    Ok(()) => to_result(1),
                    Err(WlmError::NotRegistered(_)) => to_result(0),
                    Err(e) => Err(e.into()),
                }
            }
            "query_available_users" => to_result(self.arbiter.available_clients()),
            "query_users" => to_result(self.arbiter.active_users()),
            "query_last_readings" => to_result(self.arbiter.last_readings()),
            "query_current_user" => to_result(self.arbiter.current_user().unwrap_or_default()),
            "query_sessions" => to_result(self.arbiter.active_sessions()),
            "query_wavelength" => {
                let p: QueryParams = parse_params(params)?;
                let timeout =
                    positive_secs(p.timeout, "query timeout").unwrap_or(self.default_timeout);
                let wavelength = self.arbiter.query_wavelength(&p.name, timeout).await?;
                to_result(wavelength)
            }
            other => Err(RpcFault::method_not_found(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArbiterConfig;
    use serde_json::json;

    fn service() -> ArbiterService {
        ArbiterService::new(
            ResourceArbiter::new(ArbiterConfig::default()),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_return_codes() {
        let svc = service();
        let ok = svc
            .dispatch("register", json!({ "name": "CTL1", "slot_length": 1.0 }))
            .await
            .unwrap();
        assert_eq!(ok, json!(1));

        let unknown = svc
            .dispatch("register", json!({ "name": "UNKNOWN" }))
            .await
            .unwrap();
        assert_eq!(unknown, json!(-1));

        let users = svc.dispatch("query_users", Value::Null).await.unwrap();
        assert_eq!(users, json!(["CTL1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_return_codes() {
        let svc = service();
        svc.dispatch("register", json!({ "name": "CTL1" }))
            .await
            .unwrap();
        assert_eq!(
            svc.dispatch("deregister", json!({ "name": "CTL1" }))
                .await
                .unwrap(),
            json!(1)
        );
        assert_eq!(
            svc.dispatch("deregister", json!({ "name": "CTL1" }))
                .await
                .unwrap(),
            json!(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_slot_uses_default() {
        let svc = service();
        svc.dispatch("register", json!({ "name": "CTL1", "slot_length": -2.0 }))
            .await
            .unwrap();
        let sessions = svc.dispatch("query_sessions", Value::Null).await.unwrap();
        assert_eq!(sessions["CTL1"]["slot_duration_secs"], json!(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_unregistered_is_a_fault() {
        let svc = service();
        let fault = svc
            .dispatch("query_wavelength", json!({ "name": "CTL1" }))
            .await
            .unwrap_err();
        assert_eq!(fault.kind, "not_registered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_query_timeout_keeps_waiting() {
        let svc = service();
        svc.dispatch("register", json!({ "name": "CTL1" }))
            .await
            .unwrap();
        let pending = tokio::time::timeout(
            Duration::from_secs(1),
            svc.dispatch("query_wavelength", json!({ "name": "CTL1", "timeout": 1.8e19 })),
        )
        .await;
        assert!(pending.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_user_empty_string() {
        let svc = service();
        let current = svc.dispatch("query_current_user", Value::Null).await.unwrap();
        assert_eq!(current, json!(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_method() {
        let fault = service().dispatch("reboot", Value::Null).await.unwrap_err();
        assert_eq!(fault.code, crate::rpc::METHOD_NOT_FOUND);
    }
}
