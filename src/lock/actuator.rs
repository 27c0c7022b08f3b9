//! Laser actuation capability.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LaserDefinition;

/// Per-laser lock parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserParams {
    /// Laser name, also its client name on the wavemeter server
    pub name: String,
    /// Proportional gain
    pub pid_p: f64,
    /// Integral gain
    pub pid_i: f64,
    /// Lower feedback limit (V)
    pub min_out: f64,
    /// Upper feedback limit (V)
    pub max_out: f64,
    /// Shortest settable wavelength (nm)
    pub wl_min: f64,
    /// Longest settable wavelength (nm)
    pub wl_max: f64,
    /// How close coarse setting must land (MHz)
    pub coarse_accuracy_mhz: f64,
    /// Piezo voltage with zero feedback (V)
    pub piezo_offset: f64,
}

impl LaserParams {
    /// Whether `wavelength_nm` is inside the laser's tuning range.
    pub fn in_range(&self, wavelength_nm: f64) -> bool {
        (self.wl_min..=self.wl_max).contains(&wavelength_nm)
    }
}

impl From<&LaserDefinition> for LaserParams {
    fn from(def: &LaserDefinition) -> Self {
        Self {
            name: def.name.clone(),
            pid_p: def.pid_p,
            pid_i: def.pid_i,
            min_out: def.min_out,
            max_out: def.max_out,
            wl_min: def.wl_min,
            wl_max: def.wl_max,
            coarse_accuracy_mhz: def.coarse_accuracy_mhz,
            piezo_offset: def.piezo_offset,
        }
    }
}

/// What the lock loop needs from a laser.
///
/// Implementations wrap a specific controller model.
#[async_trait]
pub trait LaserActuator: Send {
    /// Lock parameters of this laser
    fn params(&self) -> &LaserParams;

    /// Laser name
    fn name(&self) -> &str {
        &self.params().name
    }

    /// Whether a connection is open
    fn is_connected(&self) -> bool;

    /// Open the connection to the laser controller.
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection. With `reset_feedback` the piezo is returned to
    /// its offset first, otherwise the last feedback value is held.
    async fn disconnect(&mut self, reset_feedback: bool) -> Result<()>;

    /// Move the laser to `wavelength_nm` with its own (coarse) tuning.
    async fn set_wavelength_coarse(&mut self, wavelength_nm: f64) -> Result<()>;

    /// Compensate the offset between the laser's idea of its wavelength and
    /// the wavemeter's, then re-apply the coarse setting.
    async fn correct_offset(&mut self, setpoint_nm: f64, observed_nm: f64) -> Result<()>;

    /// Apply a PID output to the fine actuator.
    async fn apply_feedback(&mut self, value: f64) -> Result<()>;

    /// Called once coarse setting converged.
    async fn on_coarse_setting_done(&mut self) -> Result<()> {
        Ok(())
    }
}
