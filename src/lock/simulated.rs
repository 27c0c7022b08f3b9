//! Simulated laser on the simulated optical bench.
//!
//! Output wavelength is `target + coarse_error + tuning * feedback`. The
//! coarse error models the offset between the laser's own wavelength scale
//! and the wavemeter, and the tuning coefficient the piezo response.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::actuator::{LaserActuator, LaserParams};
use crate::hardware::SimulatedBench;

/// Default piezo tuning (nm per volt of feedback)
pub const DEFAULT_TUNING_NM_PER_VOLT: f64 = -1e-3;

#[derive(Debug)]
struct LaserState {
    connected: bool,
    target_nm: f64,
    feedback: f64,
    coarse_calls: u32,
    corrections: u32,
    feedback_calls: u32,
}

/// Simulated laser whose light arrives on one switch input.
///
/// Clones share state, so a test can keep a handle after handing the laser
/// to a lock.
#[derive(Clone)]
pub struct SimulatedLaser {
    params: LaserParams,
    bench: Arc<SimulatedBench>,
    channel: u8,
    coarse_error_nm: f64,
    tuning_nm_per_volt: f64,
    state: Arc<Mutex<LaserState>>,
}

impl SimulatedLaser {
    /// Laser on `channel` of `bench`, starting mid-range.
    pub fn new(params: LaserParams, bench: Arc<SimulatedBench>, channel: u8) -> Self {
        let start = (params.wl_min + params.wl_max) / 2.0;
        let laser = Self {
            params,
            bench,
            channel,
            coarse_error_nm: 0.0,
            tuning_nm_per_volt: DEFAULT_TUNING_NM_PER_VOLT,
            state: Arc::new(Mutex::new(LaserState {
                connected: false,
                target_nm: start,
                feedback: 0.0,
                coarse_calls: 0,
                corrections: 0,
                feedback_calls: 0,
            })),
        };
        laser.emit(&laser.state());
        laser
    }

    /// Offset between the coarse setting and the real output
    pub fn with_coarse_error_nm(self, error_nm: f64) -> Self {
        let laser = Self {
            coarse_error_nm: error_nm,
            ..self
        };
        laser.emit(&laser.state());
        laser
    }

    /// Piezo response (nm/V)
    pub fn with_tuning(self, nm_per_volt: f64) -> Self {
        let laser = Self {
            tuning_nm_per_volt: nm_per_volt,
            ..self
        };
        laser.emit(&laser.state());
        laser
    }

    /// Start from `wavelength_nm` instead of mid-range.
    pub fn with_start_wavelength(self, wavelength_nm: f64) -> Self {
        {
            let mut state = self.state();
            state.target_nm = wavelength_nm;
            self.emit(&state);
        }
        self
    }

    fn state(&self) -> MutexGuard<'_, LaserState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output_of(&self, state: &LaserState, coarse_error_nm: f64) -> f64 {
        state.target_nm + coarse_error_nm + self.tuning_nm_per_volt * state.feedback
    }

    fn emit(&self, state: &LaserState) {
        self.bench
            .set_source(self.channel, self.output_of(state, self.coarse_error_nm));
    }

    /// Wavelength currently emitted (nm)
    pub fn output_nm(&self) -> f64 {
        self.output_of(&self.state(), self.coarse_error_nm)
    }

    /// Feedback currently applied (V)
    pub fn feedback(&self) -> f64 {
        self.state().feedback
    }

    /// Number of coarse-set commands received
    pub fn coarse_calls(&self) -> u32 {
        self.state().coarse_calls
    }

    /// Number of offset corrections received
    pub fn corrections(&self) -> u32 {
        self.state().corrections
    }

    /// Number of feedback values applied
    pub fn feedback_calls(&self) -> u32 {
        self.state().feedback_calls
    }

    /// Switch input carrying this laser
    pub fn channel(&self) -> u8 {
        self.channel
    }
}

#[async_trait]
impl LaserActuator for SimulatedLaser {
    fn params(&self) -> &LaserParams {
        &self.params
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn connect(&mut self) -> Result<()> {
        self.state().connected = true;
        tracing::debug!(laser = %self.params.name, channel = self.channel, "simulated laser connected");
        Ok(())
    }

    async fn disconnect(&mut self, reset_feedback: bool) -> Result<()> {
        let mut state = self.state();
        if reset_feedback {
            state.feedback = 0.0;
            self.emit(&state);
        }
        state.connected = false;
        Ok(())
    }

    async fn set_wavelength_coarse(&mut self, wavelength_nm: f64) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            bail!("simulated laser {} is not connected", self.params.name);
        }
        state.target_nm = wavelength_nm;
        state.feedback = 0.0;
        state.coarse_calls += 1;
        self.emit(&state);
        Ok(())
    }

    async fn correct_offset(&mut self, setpoint_nm: f64, observed_nm: f64) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            bail!("simulated laser {} is not connected", self.params.name);
        }
        state.target_nm += setpoint_nm - observed_nm;
        state.corrections += 1;
        self.emit(&state);
        Ok(())
    }

    async fn apply_feedback(&mut self, value: f64) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            bail!("simulated laser {} is not connected", self.params.name);
        }
        state.feedback = value;
        state.feedback_calls += 1;
        self.emit(&state);
        Ok(())
    }
}
