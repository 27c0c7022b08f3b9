//! Discrete PI(D) controller driving the laser feedback.
//!
//! - `error = setpoint - measured`
//! - integral `I += error * dt`, clamped so that `Ki * I` stays inside the
//!   output range (anti-windup)
//! - output `Kp * error + Ki * I + Kd * d(error)/dt`, clamped to the range
//!
//! The first update after [`PidController::rebase`] integrates over the time
//! since the rebase; an update with no time anchor integrates nothing.

use tokio::time::Instant;

/// PI(D) controller state.
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    min_out: f64,
    max_out: f64,
    setpoint: f64,
    integral: f64,
    last_error: Option<f64>,
    last_time: Option<Instant>,
    output: f64,
}

impl Default for PidController {
    fn default() -> Self {
        Self::new(0.0, 0.0, -10.0, 10.0)
    }
}

impl PidController {
    /// Controller with proportional and integral gains and output limits.
    pub fn new(kp: f64, ki: f64, min_out: f64, max_out: f64) -> Self {
        Self {
            kp,
            ki,
            kd: 0.0,
            min_out,
            max_out,
            setpoint: 0.0,
            integral: 0.0,
            last_error: None,
            last_time: None,
            output: 0.0,
        }
    }

    /// Replace the P and I gains, keeping the integrator.
    pub fn set_gains(&mut self, kp: f64, ki: f64) {
        self.kp = kp;
        self.ki = ki;
    }

    /// Derivative gain
    pub fn set_kd(&mut self, kd: f64) {
        self.kd = kd;
    }

    /// Replace the output limits.
    pub fn set_limits(&mut self, min_out: f64, max_out: f64) {
        self.min_out = min_out;
        self.max_out = max_out;
        self.integral = self.clamp_integral(self.integral);
    }

    /// Current target.
    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Retarget the loop. Takes effect on the next update.
    pub fn change_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// Output of the last update.
    pub fn output(&self) -> f64 {
        self.output
    }

    /// Integrator state.
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Zero the integrator and output.
    pub fn clear(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.last_time = None;
        self.output = 0.0;
    }

    /// Anchor the time base at `now` without touching the integrator.
    ///
    /// Called whenever tracking (re)starts so time spent paused is not
    /// integrated.
    pub fn rebase(&mut self, now: Instant) {
        self.last_time = Some(now);
        self.last_error = None;
    }

    fn clamp_integral(&self, integral: f64) -> f64 {
        if self.ki == 0.0 {
            return integral;
        }
        let a = self.min_out / self.ki;
        let b = self.max_out / self.ki;
        integral.clamp(a.min(b), a.max(b))
    }

    /// Feed one measurement taken at `now` and return the new output.
    pub fn update(&mut self, measured: f64, now: Instant) -> f64 {
        let error = self.setpoint - measured;
        let dt = self
            .last_time
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0);

        self.integral = self.clamp_integral(self.integral + error * dt);
        let derivative = match self.last_error {
            Some(last) if dt > 0.0 => (error - last) / dt,
            _ => 0.0,
        };

        let raw = self.kp * error + self.ki * self.integral + self.kd * derivative;
        self.output = raw.clamp(self.min_out, self.max_out);
        self.last_error = Some(error);
        self.last_time = Some(now);
        self.output
    }
}
