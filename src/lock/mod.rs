//! Laser frequency locking against the shared wavemeter.
//!
//! - [`LockController`]: coarse setting followed by PID tracking
//! - [`LaserLock`]: the controller behind a cooperative ticker, remotely
//!   controllable
//! - [`LaserActuator`] implementations: [`TopticaDlcPro`] and
//!   [`SimulatedLaser`]
//! - [`WavelengthSource`]: the local arbiter or a [`RemoteArbiter`]

pub mod actuator;
pub mod controller;
pub mod pid;
pub mod service;
pub mod simulated;
pub mod source;
pub mod telemetry;
pub mod toptica;

pub use actuator::{LaserActuator, LaserParams};
pub use controller::{LockController, LockState, TickOutcome};
pub use pid::PidController;
pub use service::{LaserLock, LockSnapshot};
pub use simulated::SimulatedLaser;
pub use source::{Endpoint, RemoteArbiter, WavelengthSource};
pub use telemetry::{History, Sample};
pub use toptica::TopticaDlcPro;

use std::sync::Arc;

use crate::config::{LaserDefinition, LaserKind};
use crate::error::{AppResult, WlmError};
use crate::hardware::SimulatedBench;

/// Build the actuator for a configured laser.
///
/// Simulated lasers need the bench they shine on and their switch input;
/// without a bench they are rejected.
pub fn build_actuator(
    def: &LaserDefinition,
    bench: Option<(&Arc<SimulatedBench>, u8)>,
) -> AppResult<Box<dyn LaserActuator>> {
    let params = LaserParams::from(def);
    match def.r#type {
        LaserKind::TopticaDlcPro => {
            let address = def.address.clone().ok_or_else(|| {
                WlmError::ActuatorFault(format!("laser '{}' has no address", def.name))
            })?;
            Ok(Box::new(TopticaDlcPro::new(params, address, def.port)))
        }
        LaserKind::Simulated => {
            let (bench, channel) = bench.ok_or_else(|| {
                WlmError::ActuatorFault(format!(
                    "simulated laser '{}' needs a simulated bench",
                    def.name
                ))
            })?;
            Ok(Box::new(SimulatedLaser::new(
                params,
                Arc::clone(bench),
                channel,
            )))
        }
    }
}
