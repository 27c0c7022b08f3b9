//! Coarse setting and PID tracking of one laser at a time.
//!
//! ```text
//! Idle -> CoarseSetting -> Tracking -> Paused
//!   ^                         |          |
//!   +-------- terminate ------+----------+
//! ```
//!
//! The controller owns its lasers and PID exclusively. Ticks are driven one
//! at a time by the caller, so no locking is needed inside.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actuator::{LaserActuator, LaserParams};
use super::pid::PidController;
use super::source::WavelengthSource;
use super::telemetry::{History, Sample};
use crate::config::LockConfig;
use crate::error::{AppResult, WlmError};
use crate::units::freq_diff_mhz;

/// Lifecycle of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// No laser bound, nothing registered
    Idle,
    /// Laser bound and registered, coarse setting pending or running
    CoarseSetting,
    /// PID loop active
    Tracking,
    /// Actuator disconnected with its feedback held
    Paused,
}

/// Result of one lock loop iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    /// Feedback applied to the laser, 0 when the sample was rejected
    pub feedback: f64,
    /// Wavemeter reading (nm)
    pub observed: f64,
    /// Whether the reading reached the PID
    pub accepted: bool,
}

/// Laser lock state machine.
pub struct LockController {
    config: LockConfig,
    source: Arc<dyn WavelengthSource>,
    lasers: BTreeMap<String, Box<dyn LaserActuator>>,
    active: Option<String>,
    pid: PidController,
    state: LockState,
    history: History,
    tracking_since: Option<Instant>,
    registered: bool,
    cancel: CancellationToken,
}

impl LockController {
    /// Controller over `lasers`, reading through `source`.
    pub fn new(
        config: LockConfig,
        source: Arc<dyn WavelengthSource>,
        lasers: Vec<Box<dyn LaserActuator>>,
    ) -> Self {
        let history = History::new(config.history_capacity);
        let lasers = lasers
            .into_iter()
            .map(|laser| (laser.name().to_string(), laser))
            .collect();
        Self {
            config,
            source,
            lasers,
            active: None,
            pid: PidController::default(),
            state: LockState::Idle,
            history,
            tracking_since: None,
            registered: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts an in-flight tick or coarse setting.
    ///
    /// A fresh token is handed out once the previous one was cancelled.
    pub fn cancel_token(&mut self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.cancel.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> LockState {
        self.state
    }

    /// PID target (nm)
    pub fn setpoint(&self) -> f64 {
        self.pid.setpoint()
    }

    /// Last PID output
    pub fn pid_output(&self) -> f64 {
        self.pid.output()
    }

    /// Recent samples, rejected ones included
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Laser currently bound
    pub fn active_laser(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Names of the lasers this controller can drive
    pub fn available_lasers(&self) -> Vec<String> {
        self.lasers.keys().cloned().collect()
    }

    /// Lock parameters of `laser`
    pub fn laser_params(&self, laser: &str) -> Option<&LaserParams> {
        self.lasers.get(laser).map(|l| l.params())
    }

    /// Time since tracking started, zero when not tracking.
    pub fn tracking_elapsed(&self) -> Duration {
        self.tracking_since
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn active_mut(&mut self) -> AppResult<&mut Box<dyn LaserActuator>> {
        let name = self
            .active
            .clone()
            .ok_or_else(|| WlmError::InvalidState("no laser bound".into()))?;
        self.lasers
            .get_mut(&name)
            .ok_or(WlmError::UnknownLaser(name))
    }

    fn active_name(&self) -> AppResult<String> {
        self.active
            .clone()
            .ok_or_else(|| WlmError::InvalidState("no laser bound".into()))
    }

    /// Bind `laser`, connect it, seed the PID and register for readings.
    ///
    /// Allowed from `Idle` and `Paused`. A paused lock resumed on the same
    /// laser keeps its integrator.
    pub async fn initialize(&mut self, laser: &str, setpoint_nm: f64) -> AppResult<()> {
        if !matches!(self.state, LockState::Idle | LockState::Paused) {
            return Err(WlmError::InvalidState(format!(
                "cannot initialize while {:?}",
                self.state
            )));
        }
        let actuator = self
            .lasers
            .get_mut(laser)
            .ok_or_else(|| WlmError::UnknownLaser(laser.to_string()))?;
        let params = actuator.params().clone();
        if !params.in_range(setpoint_nm) {
            return Err(WlmError::SetpointOutOfRange {
                setpoint_nm,
                min_nm: params.wl_min,
                max_nm: params.wl_max,
            });
        }

        if !actuator.is_connected() {
            actuator
                .connect()
                .await
                .map_err(|e| WlmError::ActuatorFault(format!("{laser}: {e:#}")))?;
        }

        if self.active.as_deref() != Some(laser) {
            self.pid.clear();
            self.history.clear();
        }
        self.pid.set_gains(params.pid_p, params.pid_i);
        self.pid.set_limits(params.min_out, params.max_out);
        self.pid.change_setpoint(setpoint_nm);
        self.active = Some(laser.to_string());

        self.source
            .register(laser, self.config.slot_length())
            .await?;
        self.registered = true;
        self.state = LockState::CoarseSetting;
        info!(%laser, setpoint_nm, "lock initialized");
        Ok(())
    }

    fn read(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = AppResult<f64>> + Send + 'static {
        read_cancellable(
            Arc::clone(&self.source),
            name.to_string(),
            self.config.query_timeout(),
            cancel.clone(),
        )
    }

    /// Bring the laser within its coarse accuracy of the setpoint, then
    /// start tracking.
    pub async fn coarse_set(&mut self) -> AppResult<()> {
        if self.state != LockState::CoarseSetting {
            return Err(WlmError::InvalidState(format!(
                "coarse setting requires CoarseSetting, lock is {:?}",
                self.state
            )));
        }
        let name = self.active_name()?;
        let cancel = self.cancel_token();
        let setpoint = self.pid.setpoint();
        let accuracy = self.active_mut()?.params().coarse_accuracy_mhz;

        let observed = self.read(&name, &cancel).await?;
        let mut error_mhz = freq_diff_mhz(observed, setpoint);
        debug!(laser = %name, observed, error_mhz, "coarse setting start");

        if error_mhz.abs() > accuracy {
            self.active_mut()?
                .set_wavelength_coarse(setpoint)
                .await
                .map_err(|e| WlmError::ActuatorFault(format!("{name}: {e:#}")))?;

            let mut iterations = 0;
            loop {
                let observed = self.read(&name, &cancel).await?;
                error_mhz = freq_diff_mhz(observed, setpoint);
                if error_mhz.abs() <= accuracy {
                    break;
                }
                if iterations >= self.config.coarse_max_iterations {
                    return Err(WlmError::CoarseSetNotConverged {
                        iterations,
                        last_error_mhz: error_mhz,
                    });
                }
                iterations += 1;
                debug!(laser = %name, iteration = iterations, error_mhz, "correcting coarse offset");
                self.active_mut()?
                    .correct_offset(setpoint, observed)
                    .await
                    .map_err(|e| WlmError::ActuatorFault(format!("{name}: {e:#}")))?;
            }
        }

        if let Err(e) = self.active_mut()?.on_coarse_setting_done().await {
            warn!(laser = %name, error = %e, "coarse setting completion hook failed");
        }

        let now = Instant::now();
        self.pid.rebase(now);
        self.tracking_since = Some(now);
        self.state = LockState::Tracking;
        info!(laser = %name, error_mhz, "coarse setting done, tracking");
        Ok(())
    }

    /// One lock iteration at `elapsed` since tracking started.
    pub async fn tick(&mut self, elapsed: Duration) -> AppResult<TickOutcome> {
        if self.state != LockState::Tracking {
            return Err(WlmError::InvalidState(format!(
                "tick requires Tracking, lock is {:?}",
                self.state
            )));
        }
        let name = self.active_name()?;
        let cancel = self.cancel_token();

        let observed = self.read(&name, &cancel).await?;
        if observed <= 0.0 {
            // The arbiter never attributes these, but a remote one might.
            warn!(laser = %name, observed, "discarding garbled reading");
            return Ok(TickOutcome {
                feedback: 0.0,
                observed,
                accepted: false,
            });
        }

        let setpoint = self.pid.setpoint();
        let deviation_mhz = freq_diff_mhz(observed, setpoint);
        let warmed_up = elapsed >= self.config.initial_wait_check();
        if warmed_up && deviation_mhz.abs() > self.config.max_jump_mhz {
            let anomaly = WlmError::ReadingAnomaly { deviation_mhz };
            warn!(laser = %name, observed, setpoint, "{anomaly}, sample discarded");
            self.history.push(Sample {
                elapsed_secs: elapsed.as_secs_f64(),
                wavelength_nm: observed,
                feedback: 0.0,
                accepted: false,
            });
            return Ok(TickOutcome {
                feedback: 0.0,
                observed,
                accepted: false,
            });
        }

        let feedback = self.pid.update(observed, Instant::now());
        if cancel.is_cancelled() {
            return Err(WlmError::InvalidState("lock cancelled".into()));
        }
        self.active_mut()?
            .apply_feedback(feedback)
            .await
            .map_err(|e| WlmError::ActuatorFault(format!("{name}: {e:#}")))?;

        self.history.push(Sample {
            elapsed_secs: elapsed.as_secs_f64(),
            wavelength_nm: observed,
            feedback,
            accepted: true,
        });
        Ok(TickOutcome {
            feedback,
            observed,
            accepted: true,
        })
    }

    /// Retarget the PID. Takes effect on the next tick.
    pub fn change_setpoint(&mut self, setpoint_nm: f64) -> AppResult<()> {
        if let Some(name) = self.active.as_deref() {
            if let Some(laser) = self.lasers.get(name) {
                let params = laser.params();
                if !params.in_range(setpoint_nm) {
                    return Err(WlmError::SetpointOutOfRange {
                        setpoint_nm,
                        min_nm: params.wl_min,
                        max_nm: params.wl_max,
                    });
                }
            }
        }
        info!(old = self.pid.setpoint(), new = setpoint_nm, "setpoint changed");
        self.pid.change_setpoint(setpoint_nm);
        Ok(())
    }

    async fn release(&mut self, reset_feedback: bool) {
        let Some(name) = self.active.clone() else {
            return;
        };
        if self.registered {
            if let Err(e) = self.source.deregister(&name).await {
                warn!(laser = %name, error = %e, "deregistration failed");
            }
            self.registered = false;
        }
        let Some(laser) = self.lasers.get_mut(&name) else {
            return;
        };
        if !laser.is_connected() {
            if !reset_feedback {
                return;
            }
            // Paused lasers hold their feedback; reconnect once to clear it.
            if let Err(e) = laser.connect().await {
                error!(laser = %name, error = %e, "could not reconnect to reset feedback");
                return;
            }
        }
        if let Err(e) = laser.disconnect(reset_feedback).await {
            error!(laser = %name, error = %e, "disconnect failed");
        }
    }

    /// Stop tracking and hold the last feedback on the laser.
    pub async fn pause(&mut self) {
        if self.state == LockState::Idle || self.state == LockState::Paused {
            return;
        }
        self.cancel.cancel();
        self.release(false).await;
        self.tracking_since = None;
        self.state = LockState::Paused;
        info!(laser = ?self.active, "lock paused");
    }

    /// Stop the lock, release the laser and the wavemeter registration.
    ///
    /// With `reset_feedback` the integrator is cleared and the laser returns
    /// to its piezo offset. Calling it on an idle lock does nothing.
    pub async fn terminate(&mut self, reset_feedback: bool) {
        if self.state == LockState::Idle {
            debug!("terminate on idle lock ignored");
            return;
        }
        self.cancel.cancel();
        if reset_feedback {
            self.pid.clear();
        }
        self.release(reset_feedback).await;
        self.tracking_since = None;
        self.state = LockState::Idle;
        info!(laser = ?self.active, "lock terminated");
    }
}

async fn read_cancellable(
    source: Arc<dyn WavelengthSource>,
    name: String,
    timeout: Duration,
    cancel: CancellationToken,
) -> AppResult<f64> {
    tokio::select! {
        reading = source.query_wavelength(&name, timeout) => reading,
        _ = cancel.cancelled() => Err(WlmError::InvalidState("lock cancelled".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ResourceArbiter;
    use crate::config::{ArbiterConfig, LaserDefinition, LaserKind};
    use crate::hardware::{MockSwitch, MockWavemeter, SimulatedBench};
    use crate::lock::simulated::SimulatedLaser;

    fn params() -> LaserParams {
        LaserParams::from(&LaserDefinition {
            name: "CTL1".into(),
            r#type: LaserKind::Simulated,
            ..LaserDefinition::default()
        })
    }

    async fn bench_controller() -> (LockController, Arc<ResourceArbiter>, SimulatedLaser) {
        let bench = SimulatedBench::new(1550.0);
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        arbiter.start(
            Box::new(MockSwitch::new(Arc::clone(&bench), 8)),
            Box::new(MockWavemeter::new(Arc::clone(&bench), 0.0)),
        );
        let laser = SimulatedLaser::new(params(), bench, 1).with_coarse_error_nm(0.02);
        let source: Arc<dyn WavelengthSource> = arbiter.clone();
        let controller = LockController::new(
            LockConfig::default(),
            source,
            vec![Box::new(laser.clone())],
        );
        (controller, arbiter, laser)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_unknown_laser_and_range() {
        let (mut lock, arbiter, _) = bench_controller().await;
        assert!(matches!(
            lock.initialize("CTL9", 1550.0).await,
            Err(WlmError::UnknownLaser(_))
        ));
        assert!(matches!(
            lock.initialize("CTL1", 1600.0).await,
            Err(WlmError::SetpointOutOfRange { .. })
        ));
        assert_eq!(lock.state(), LockState::Idle);
        arbiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_coarse_set_then_track() {
        let (mut lock, arbiter, laser) = bench_controller().await;
        lock.initialize("CTL1", 1550.5).await.unwrap();
        assert_eq!(lock.state(), LockState::CoarseSetting);
        assert!(arbiter.active_users().contains(&"CTL1".to_string()));

        lock.coarse_set().await.unwrap();
        assert_eq!(lock.state(), LockState::Tracking);
        assert!(laser.coarse_calls() >= 1);

        let outcome = lock.tick(Duration::from_secs(1)).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(lock.history().len(), 1);

        lock.terminate(true).await;
        assert_eq!(lock.state(), LockState::Idle);
        assert!(!laser.is_connected());
        assert!(arbiter.active_users().is_empty());
        arbiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_feedback_and_resumes() {
        let (mut lock, arbiter, laser) = bench_controller().await;
        lock.initialize("CTL1", 1550.5).await.unwrap();
        lock.coarse_set().await.unwrap();
        lock.tick(Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        lock.tick(Duration::from_secs(2)).await.unwrap();
        let held = laser.feedback();

        lock.pause().await;
        assert_eq!(lock.state(), LockState::Paused);
        assert_eq!(laser.feedback(), held);
        assert!(lock.tick(Duration::from_secs(3)).await.is_err());

        lock.initialize("CTL1", 1550.5).await.unwrap();
        assert_eq!(lock.state(), LockState::CoarseSetting);
        lock.terminate(true).await;
        arbiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_jump_after_warm_up_is_discarded() {
        let bench = SimulatedBench::new(1550.0);
        let wavemeter = MockWavemeter::new(Arc::clone(&bench), 0.0);
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        arbiter.start(
            Box::new(MockSwitch::new(Arc::clone(&bench), 8)),
            Box::new(wavemeter.clone()),
        );
        let laser = SimulatedLaser::new(params(), bench, 1);
        let mut lock = LockController::new(
            LockConfig::default(),
            arbiter.clone(),
            vec![Box::new(laser.clone())],
        );
        lock.initialize("CTL1", 1550.5).await.unwrap();
        lock.coarse_set().await.unwrap();
        lock.tick(Duration::from_secs(31)).await.unwrap();
        let output = lock.pid_output();
        let applied = laser.feedback_calls();

        // About 1.2 GHz away from the setpoint.
        wavemeter.force_reading(Some(1550.51));
        let outcome = lock.tick(Duration::from_secs(32)).await.unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.feedback, 0.0);
        assert_eq!(lock.pid_output(), output);
        assert_eq!(laser.feedback_calls(), applied);
        let last = lock.history().latest().unwrap();
        assert!(!last.accepted);
        assert_eq!(last.wavelength_nm, 1550.51);
        assert!(logs_contain("sample discarded"));

        // Inside the warm-up window the same jump reaches the PID.
        let outcome = lock.tick(Duration::from_secs(5)).await.unwrap();
        assert!(outcome.accepted);
        arbiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_requires_tracking() {
        let (mut lock, arbiter, _) = bench_controller().await;
        assert!(matches!(
            lock.tick(Duration::ZERO).await,
            Err(WlmError::InvalidState(_))
        ));
        arbiter.shutdown().await;
    }
}
