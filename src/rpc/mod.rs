//! Newline-delimited JSON request/response over TCP.
//!
//! Each line carries one message:
//!
//! ```text
//! -> {"id":1,"method":"query_wavelength","params":{"name":"CTL2","timeout":10}}
//! <- {"id":1,"result":1550.12345}
//! <- {"id":1,"error":{"code":-32000,"kind":"timeout","message":"…","data":{…}}}
//! ```
//!
//! Application errors carry a `kind` and structured `data` so the client can
//! rebuild the matching [`WlmError`] variant.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::WlmError;

pub mod arbiter_service;
pub mod client;
pub mod lock_service;
pub mod server;

pub use arbiter_service::ArbiterService;
pub use client::RpcClient;
pub use lock_service::LaserLockService;
pub use server::RpcServer;

/// Malformed JSON
pub const PARSE_ERROR: i32 = -32700;
/// No such method
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Parameters did not match the method
pub const INVALID_PARAMS: i32 = -32602;
/// The method ran and failed
pub const APPLICATION_ERROR: i32 = -32000;

/// Request line
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response line
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFault>,
}

/// Error payload of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFault {
    /// Numeric class, see the constants in this module
    pub code: i32,
    /// Machine-readable error kind
    pub kind: String,
    /// Human-readable description
    pub message: String,
    /// Variant fields needed to rebuild the error
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl RpcFault {
    fn new(code: i32, kind: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: kind.to_string(),
            message: message.into(),
            data: Value::Null,
        }
    }

    /// Unknown method
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, "method_not_found", format!("method not found: {method}"))
    }

    /// Unusable parameters
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, "invalid_params", message)
    }

    /// Unparseable request
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, "parse_error", message)
    }

    fn str_field(&self, key: &str) -> String {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn f64_field(&self, key: &str) -> f64 {
        self.data.get(key).and_then(Value::as_f64).unwrap_or(f64::NAN)
    }

    /// Rebuild the error on the client side.
    pub fn into_error(self) -> WlmError {
        match self.kind.as_str() {
            "unknown_client" => WlmError::UnknownClient(self.str_field("name")),
            "not_registered" => WlmError::NotRegistered(self.str_field("name")),
            "timeout" => WlmError::Timeout {
                name: self.str_field("name"),
                waited: Duration::try_from_secs_f64(self.f64_field("waited_secs"))
                    .unwrap_or_default(),
            },
            "switch_fault" => WlmError::SwitchFault(self.message),
            "actuator_fault" => WlmError::ActuatorFault(self.message),
            "coarse_set_not_converged" => WlmError::CoarseSetNotConverged {
                iterations: self
                    .data
                    .get("iterations")
                    .and_then(Value::as_u64)
                    .unwrap_or_default() as u32,
                last_error_mhz: self.f64_field("last_error_mhz"),
            },
            "setpoint_out_of_range" => WlmError::SetpointOutOfRange {
                setpoint_nm: self.f64_field("setpoint_nm"),
                min_nm: self.f64_field("min_nm"),
                max_nm: self.f64_field("max_nm"),
            },
            "unknown_laser" => WlmError::UnknownLaser(self.str_field("name")),
            "invalid_state" => WlmError::InvalidState(self.str_field("reason")),
            "name_taken" => WlmError::NameTaken(self.str_field("name")),
            "name_not_found" => WlmError::NameNotFound(self.str_field("name")),
            _ => WlmError::Rpc(self.message),
        }
    }
}

impl From<&WlmError> for RpcFault {
    fn from(err: &WlmError) -> Self {
        let (kind, data) = match err {
            WlmError::UnknownClient(name) => ("unknown_client", json!({ "name": name })),
            WlmError::NotRegistered(name) => ("not_registered", json!({ "name": name })),
            WlmError::Timeout { name, waited } => (
                "timeout",
                json!({ "name": name, "waited_secs": waited.as_secs_f64() }),
            ),
            WlmError::SwitchFault(_) => ("switch_fault", Value::Null),
            WlmError::ActuatorFault(_) => ("actuator_fault", Value::Null),
            WlmError::CoarseSetNotConverged {
                iterations,
                last_error_mhz,
            } => (
                "coarse_set_not_converged",
                json!({ "iterations": iterations, "last_error_mhz": last_error_mhz }),
            ),
            WlmError::SetpointOutOfRange {
                setpoint_nm,
                min_nm,
                max_nm,
            } => (
                "setpoint_out_of_range",
                json!({ "setpoint_nm": setpoint_nm, "min_nm": min_nm, "max_nm": max_nm }),
            ),
            WlmError::UnknownLaser(name) => ("unknown_laser", json!({ "name": name })),
            WlmError::InvalidState(reason) => ("invalid_state", json!({ "reason": reason })),
            WlmError::NameTaken(name) => ("name_taken", json!({ "name": name })),
            WlmError::NameNotFound(name) => ("name_not_found", json!({ "name": name })),
            _ => ("internal", Value::Null),
        };
        Self {
            code: APPLICATION_ERROR,
            kind: kind.to_string(),
            message: err.to_string(),
            data,
        }
    }
}

impl From<WlmError> for RpcFault {
    fn from(err: WlmError) -> Self {
        RpcFault::from(&err)
    }
}

/// A set of methods reachable over RPC.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Short service name for logs
    fn name(&self) -> &str;

    /// Run `method` with `params`.
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcFault>;
}

/// Deserialize method parameters. Missing params count as an empty object.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcFault> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| RpcFault::invalid_params(e.to_string()))
}

/// Serialize a method result.
pub fn to_result<T: Serialize>(value: T) -> Result<Value, RpcFault> {
    serde_json::to_value(value).map_err(|e| RpcFault::from(WlmError::Json(e)))
}
