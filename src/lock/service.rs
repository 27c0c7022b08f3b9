//! Remote-controllable lock: staged setpoint and detuning, a cooperative
//! ticker and a display snapshot.
//!
//! While running, the [`LockController`] lives inside the ticker task and is
//! handed back when the task is stopped. Setpoint changes reach the task over
//! a watch channel and are applied before the next tick.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actuator::LaserParams;
use super::controller::{LockController, LockState};
use super::telemetry::Sample;
use crate::error::{AppResult, WlmError};
use crate::units::{detuned_setpoint, round5};

/// What a remote display needs to show.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Latest wavemeter reading (nm)
    pub current_wavelength: Option<f64>,
    /// Base wavelength (nm)
    pub wavelength_setpoint: f64,
    /// Detuning from the base wavelength (GHz)
    pub detuning: f64,
    /// Whether the lock loop is ticking
    pub running: bool,
}

#[derive(Debug)]
struct Shared {
    base_wavelength: f64,
    detuning: f64,
    running: bool,
    samples: Vec<Sample>,
    starting: Option<CancellationToken>,
    aborted_by: Option<StartAbort>,
}

/// Command that cut a start short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartAbort {
    Pause,
    Stop,
}

enum Runner {
    Ready(LockController),
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<LockController>,
        setpoint_tx: watch::Sender<f64>,
    },
}

/// A [`LockController`] bound to one laser, driven by a ticker task.
pub struct LaserLock {
    laser: String,
    params: LaserParams,
    interval: Duration,
    shared: Arc<StdMutex<Shared>>,
    runner: Mutex<Option<Runner>>,
}

impl LaserLock {
    /// Lock `laser` of `controller`, ticking every `interval`.
    ///
    /// # Errors
    ///
    /// `UnknownLaser` if the controller cannot drive `laser`.
    pub fn new(
        controller: LockController,
        laser: &str,
        base_wavelength: f64,
        interval: Duration,
    ) -> AppResult<Self> {
        let params = controller
            .laser_params(laser)
            .cloned()
            .ok_or_else(|| WlmError::UnknownLaser(laser.to_string()))?;
        Ok(Self {
            laser: laser.to_string(),
            params,
            interval,
            shared: Arc::new(StdMutex::new(Shared {
                base_wavelength,
                detuning: 0.0,
                running: false,
                samples: Vec::new(),
                starting: None,
                aborted_by: None,
            })),
            runner: Mutex::new(Some(Runner::Ready(controller))),
        })
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Laser driven by this lock
    pub fn laser(&self) -> &str {
        &self.laser
    }

    /// Stage the base wavelength used by the next start.
    pub fn set_wavelength_setpoint(&self, wavelength_nm: f64) {
        self.shared().base_wavelength = wavelength_nm;
    }

    /// Staged base wavelength (nm)
    pub fn get_wavelength_setpoint(&self) -> f64 {
        self.shared().base_wavelength
    }

    /// Stage the detuning used by the next start.
    pub fn set_detuning(&self, detuning_ghz: f64) {
        self.shared().detuning = detuning_ghz;
    }

    /// Staged detuning (GHz)
    pub fn get_detuning(&self) -> f64 {
        self.shared().detuning
    }

    /// Setpoint the current base and detuning amount to.
    pub fn effective_setpoint(&self) -> f64 {
        let shared = self.shared();
        round5(detuned_setpoint(shared.base_wavelength, shared.detuning))
    }

    fn check_range(&self, setpoint_nm: f64) -> AppResult<()> {
        if self.params.in_range(setpoint_nm) {
            Ok(())
        } else {
            Err(WlmError::SetpointOutOfRange {
                setpoint_nm,
                min_nm: self.params.wl_min,
                max_nm: self.params.wl_max,
            })
        }
    }

    /// Set the detuning and retarget a running lock.
    ///
    /// Returns the new setpoint. When the lock is not running the detuning is
    /// only staged.
    pub async fn change_detuning(&self, detuning_ghz: f64) -> AppResult<f64> {
        let base = self.shared().base_wavelength;
        let setpoint = round5(detuned_setpoint(base, detuning_ghz));
        self.check_range(setpoint)?;
        self.shared().detuning = detuning_ghz;

        if let Some(Runner::Running { setpoint_tx, .. }) = self.runner.lock().await.as_ref() {
            setpoint_tx.send_replace(setpoint);
            info!(laser = %self.laser, detuning_ghz, setpoint, "detuning changed");
        }
        Ok(setpoint)
    }

    /// Latest wavemeter reading, if the lock ever ticked.
    pub fn get_wavelength(&self) -> Option<f64> {
        self.shared().samples.last().map(|s| s.wavelength_nm)
    }

    /// Recent samples, oldest first
    pub fn samples(&self) -> Vec<Sample> {
        self.shared().samples.clone()
    }

    /// Whether the lock loop is ticking
    pub fn get_is_running(&self) -> bool {
        self.shared().running
    }

    /// Display snapshot
    pub fn snapshot(&self) -> LockSnapshot {
        let shared = self.shared();
        LockSnapshot {
            current_wavelength: shared.samples.last().map(|s| s.wavelength_nm),
            wavelength_setpoint: shared.base_wavelength,
            detuning: shared.detuning,
            running: shared.running,
        }
    }

    /// Lifecycle state of the controller, `Tracking` while the ticker runs.
    pub async fn state(&self) -> LockState {
        match self.runner.lock().await.as_ref() {
            Some(Runner::Ready(controller)) => controller.state(),
            Some(Runner::Running { .. }) => LockState::Tracking,
            None => LockState::Idle,
        }
    }

    /// Initialise, coarse-set and start ticking. Does nothing when already
    /// running.
    ///
    /// A pause or stop issued meanwhile aborts the start. Connecting and
    /// registering run to completion first; coarse setting is cut short.
    ///
    /// # Errors
    ///
    /// Setpoint, actuator and coarse-setting failures, or the abort. The lock
    /// is terminated (feedback reset, deregistered) before the error is
    /// returned, except after a pause, which leaves it paused.
    pub async fn remote_start(&self) -> AppResult<()> {
        let mut runner = self.runner.lock().await;
        let mut controller = match runner.take() {
            Some(Runner::Ready(controller)) => controller,
            Some(running @ Runner::Running { .. }) => {
                debug!(laser = %self.laser, "start ignored, already running");
                *runner = Some(running);
                return Ok(());
            }
            None => return Err(WlmError::InvalidState("lock task was lost".into())),
        };

        let setpoint = self.effective_setpoint();
        if let Err(e) = self.check_range(setpoint) {
            *runner = Some(Runner::Ready(controller));
            return Err(e);
        }

        let cancel = controller.cancel_token();
        {
            let mut shared = self.shared();
            shared.starting = Some(cancel.clone());
            shared.aborted_by = None;
        }
        let started = async {
            controller.initialize(&self.laser, setpoint).await?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WlmError::InvalidState("lock start aborted".into())),
                set = controller.coarse_set() => set,
            }
        }
        .await;
        let aborted_by = {
            let mut shared = self.shared();
            shared.starting = None;
            shared.aborted_by.take()
        };
        if let Err(e) = started {
            warn!(laser = %self.laser, error = %e, ?aborted_by, "lock start failed");
            if aborted_by == Some(StartAbort::Pause) {
                controller.pause().await;
            } else {
                controller.terminate(true).await;
            }
            *runner = Some(Runner::Ready(controller));
            return Err(e);
        }

        let cancel = controller.cancel_token();
        let (setpoint_tx, setpoint_rx) = watch::channel(setpoint);
        let handle = tokio::spawn(run_ticker(
            controller,
            Arc::clone(&self.shared),
            setpoint_rx,
            cancel.clone(),
            self.interval,
        ));
        self.shared().running = true;
        *runner = Some(Runner::Running {
            cancel,
            handle,
            setpoint_tx,
        });
        info!(laser = %self.laser, setpoint, "lock running");
        Ok(())
    }

    fn abort_start(&self, by: StartAbort) {
        let mut shared = self.shared();
        if let Some(token) = shared.starting.take() {
            shared.aborted_by = Some(by);
            token.cancel();
        }
    }

    /// Stop the ticker and hand the controller back.
    async fn stop_ticker(&self, runner: &mut Option<Runner>) -> AppResult<()> {
        match runner.take() {
            Some(Runner::Running { cancel, handle, .. }) => {
                cancel.cancel();
                self.shared().running = false;
                match handle.await {
                    Ok(controller) => {
                        *runner = Some(Runner::Ready(controller));
                        Ok(())
                    }
                    Err(e) => Err(WlmError::InvalidState(format!("lock task failed: {e}"))),
                }
            }
            Some(ready) => {
                *runner = Some(ready);
                Ok(())
            }
            None => Err(WlmError::InvalidState("lock task was lost".into())),
        }
    }

    /// Stop ticking and hold the last feedback on the laser.
    pub async fn remote_pause(&self) -> AppResult<()> {
        self.abort_start(StartAbort::Pause);
        let mut runner = self.runner.lock().await;
        self.stop_ticker(&mut runner).await?;
        if let Some(Runner::Ready(controller)) = runner.as_mut() {
            controller.pause().await;
        }
        Ok(())
    }

    /// Stop ticking, reset the feedback and release the laser.
    pub async fn remote_stop(&self) -> AppResult<()> {
        self.abort_start(StartAbort::Stop);
        let mut runner = self.runner.lock().await;
        self.stop_ticker(&mut runner).await?;
        if let Some(Runner::Ready(controller)) = runner.as_mut() {
            controller.terminate(true).await;
        }
        Ok(())
    }
}

async fn run_ticker(
    mut controller: LockController,
    shared: Arc<StdMutex<Shared>>,
    mut setpoint_rx: watch::Receiver<f64>,
    cancel: CancellationToken,
    interval: Duration,
) -> LockController {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if setpoint_rx.has_changed().unwrap_or(false) {
            let setpoint = *setpoint_rx.borrow_and_update();
            if let Err(e) = controller.change_setpoint(setpoint) {
                warn!(error = %e, "setpoint change rejected");
            }
        }

        let elapsed = controller.tracking_elapsed();
        match controller.tick(elapsed).await {
            Ok(outcome) => {
                debug!(
                    observed = outcome.observed,
                    feedback = outcome.feedback,
                    accepted = outcome.accepted,
                    "lock tick"
                );
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .samples = controller.history().samples();
            }
            Err(_) if cancel.is_cancelled() => break,
            Err(e) => warn!(error = %e, "lock tick failed"),
        }

        // Re-armed after each tick, so ticks never overlap.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("lock ticker stopped");
    controller
}
