//! Custom error types for the application.
//!
//! This module defines the primary error type, `WlmError`, shared by the
//! wavemeter arbiter, the laser locks and the RPC glue between them.
//!
//! ## Error Hierarchy
//!
//! - **Protocol errors** (`UnknownClient`, `NotRegistered`, `Timeout`): returned
//!   to the caller as explicit results. They never disturb the arbiter loops.
//! - **Hardware transients** (`SwitchFault`, `ActuatorFault`): retried locally
//!   where possible and surfaced to the controller's caller otherwise.
//! - **Anomalies** (`ReadingAnomaly`): a wavemeter reading that jumped too far
//!   from the setpoint. Logged and neutralised; the sample is discarded.
//! - **Lock lifecycle** (`CoarseSetNotConverged`, `SetpointOutOfRange`,
//!   `UnknownLaser`, `InvalidState`).
//! - **Plumbing** (`Rpc`, `Disconnected`, `NameTaken`, `NameNotFound`,
//!   `Config`, `Io`, `Json`).

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, WlmError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum WlmError {
    #[error("Unknown client '{0}': not one of the switch channels")]
    UnknownClient(String),

    #[error("Client '{0}' is not registered")]
    NotRegistered(String),

    #[error("Timed out after {waited:?} waiting for a reading for '{name}'")]
    Timeout { name: String, waited: Duration },

    #[error("Optical switch fault: {0}")]
    SwitchFault(String),

    #[error("Reading jumped {deviation_mhz:.1} MHz from the setpoint")]
    ReadingAnomaly { deviation_mhz: f64 },

    #[error("Laser actuator fault: {0}")]
    ActuatorFault(String),

    #[error("Coarse setting did not converge after {iterations} corrections (last error {last_error_mhz:.1} MHz)")]
    CoarseSetNotConverged { iterations: u32, last_error_mhz: f64 },

    #[error("Setpoint {setpoint_nm} nm outside laser range [{min_nm}, {max_nm}] nm")]
    SetpointOutOfRange {
        setpoint_nm: f64,
        min_nm: f64,
        max_nm: f64,
    },

    #[error("Unknown laser '{0}'")]
    UnknownLaser(String),

    #[error("Invalid lock state: {0}")]
    InvalidState(String),

    #[error("Name '{0}' is already registered")]
    NameTaken(String),

    #[error("Name '{0}' is not registered")]
    NameNotFound(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Connection to {0} lost")]
    Disconnected(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WlmError {
    /// Whether this error comes from the transport rather than the remote peer.
    ///
    /// Transport errors are worth a reconnect; protocol errors are not.
    pub fn is_transport(&self) -> bool {
        matches!(self, WlmError::Disconnected(_) | WlmError::Io(_))
    }
}
