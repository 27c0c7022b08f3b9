//! Time-shared access to one wavemeter behind an optical switch.
//!
//! [`ResourceArbiter`] owns the registered clients and runs two background
//! loops: the scheduler, which hands the switch to each client in turn, and
//! the reader, which polls the wavemeter and attributes readings to whoever
//! holds the switch.
//!
//! # Lock discipline
//!
//! All mutable state sits behind one `std::sync::Mutex`. It is held only for
//! map lookups and updates, never across an `.await`. The switch is owned by
//! the scheduler task and the wavemeter by the reader task, so hardware I/O
//! happens outside the lock.
//!
//! # Attribution
//!
//! Every change of the current user bumps a grant counter. The reader
//! snapshots the grant before a read and attributes the value only if the
//! grant is unchanged afterwards, so a reading that straddles a switch is
//! never handed to the wrong client. The current user is published only after
//! the settle delay, which keeps readings taken while the switch moves out of
//! every grant. Reads are also numbered, and a query only accepts a read that
//! started after the query did.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ArbiterConfig;
use crate::error::{AppResult, WlmError};
use crate::hardware::{SwitchPort, WavemeterPort, WavemeterStatus};

mod query;
mod scheduler;
pub mod session;

pub use session::{ClientSession, SessionSnapshot};

#[derive(Debug, Default)]
pub(crate) struct ArbiterState {
    pub(crate) sessions: BTreeMap<String, ClientSession>,
    pub(crate) current_user: Option<String>,
    pub(crate) latest_reading: Option<f64>,
    pub(crate) rotation: usize,
    pub(crate) grant: u64,
    pub(crate) reads_started: u64,
}

/// Identifies one wavemeter read: the grant it started in and its sequence
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadTicket {
    pub(crate) grant: u64,
    pub(crate) seq: u64,
}

impl ArbiterState {
    /// Change the current user, opening a new grant if it differs.
    pub(crate) fn set_current(&mut self, user: Option<String>) {
        if self.current_user != user {
            self.current_user = user;
            self.grant += 1;
        }
    }

    /// Remove sessions idle for longer than `max_inactivity`.
    ///
    /// Returns the evicted names.
    pub(crate) fn sweep(&mut self, now: Instant, max_inactivity: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now, max_inactivity))
            .map(|s| s.name.clone())
            .collect();
        for name in &expired {
            self.sessions.remove(name);
        }
        if self
            .current_user
            .as_ref()
            .is_some_and(|current| !self.sessions.contains_key(current))
        {
            self.set_current(None);
        }
        expired
    }
}

/// Scheduler over a shared wavemeter and optical switch.
pub struct ResourceArbiter {
    config: ArbiterConfig,
    state: Mutex<ArbiterState>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceArbiter {
    /// Create an arbiter with no sessions. Call [`ResourceArbiter::start`] to
    /// begin scheduling.
    pub fn new(config: ArbiterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ArbiterState::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arbiter configuration
    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Spawn the scheduling and reading loops.
    ///
    /// The switch is owned by the scheduler and the wavemeter by the reader
    /// from here on. Both loops run until [`ResourceArbiter::shutdown`].
    pub fn start(
        self: &Arc<Self>,
        switch: Box<dyn SwitchPort>,
        wavemeter: Box<dyn WavemeterPort>,
    ) {
        let scheduler = tokio::spawn(scheduler::run_scheduler(
            Arc::clone(self),
            switch,
            self.cancel.child_token(),
        ));
        let reader = tokio::spawn(scheduler::run_reader(
            Arc::clone(self),
            wavemeter,
            self.cancel.child_token(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([scheduler, reader]);
        info!(
            clients = self.config.channels.len(),
            "wavemeter arbiter started"
        );
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "arbiter task ended abnormally");
            }
        }
        self.lock_state().set_current(None);
        info!("wavemeter arbiter stopped");
    }

    /// Register `name`, or refresh its lease and slot length.
    ///
    /// A missing or zero `slot` falls back to the configured default.
    pub fn register(&self, name: &str, slot: Option<Duration>) -> AppResult<()> {
        let channel = *self
            .config
            .channels
            .get(name)
            .ok_or_else(|| WlmError::UnknownClient(name.to_string()))?;

        let slot = match slot {
            Some(slot) if !slot.is_zero() => slot,
            Some(_) => {
                warn!(client = name, "zero slot length requested, using default");
                self.config.default_slot()
            }
            None => self.config.default_slot(),
        };

        let mut state = self.lock_state();
        match state.sessions.get_mut(name) {
            Some(session) => {
                session.slot_duration = slot;
                session.touch();
                debug!(client = name, slot_secs = slot.as_secs_f64(), "lease refreshed");
            }
            None => {
                state
                    .sessions
                    .insert(name.to_string(), ClientSession::new(name, channel, slot));
                info!(client = name, channel, slot_secs = slot.as_secs_f64(), "client registered");
            }
        }
        Ok(())
    }

    /// Remove `name`. If it held the switch, the current user becomes empty.
    pub fn deregister(&self, name: &str) -> AppResult<()> {
        let mut state = self.lock_state();
        if state.sessions.remove(name).is_none() {
            return Err(WlmError::NotRegistered(name.to_string()));
        }
        if state.current_user.as_deref() == Some(name) {
            state.set_current(None);
        }
        info!(client = name, "client deregistered");
        Ok(())
    }

    /// Every client name the switch knows about.
    pub fn available_clients(&self) -> Vec<String> {
        self.config.channels.keys().cloned().collect()
    }

    /// Names of the registered clients.
    pub fn active_users(&self) -> Vec<String> {
        self.lock_state().sessions.keys().cloned().collect()
    }

    /// Registered clients with their slot, activity and last reading.
    pub fn active_sessions(&self) -> BTreeMap<String, SessionSnapshot> {
        self.lock_state()
            .sessions
            .iter()
            .map(|(name, session)| (name.clone(), session.snapshot()))
            .collect()
    }

    /// Last attributed reading of every registered client.
    pub fn last_readings(&self) -> BTreeMap<String, Option<f64>> {
        self.lock_state()
            .sessions
            .iter()
            .map(|(name, session)| (name.clone(), session.last_reading))
            .collect()
    }

    /// Client currently holding the switch.
    pub fn current_user(&self) -> Option<String> {
        self.lock_state().current_user.clone()
    }

    /// Most recent raw wavemeter value, whatever the switch points at.
    pub fn latest_reading(&self) -> Option<f64> {
        self.lock_state().latest_reading
    }

    /// Mark the start of a wavemeter read.
    pub(crate) fn begin_read(&self) -> ReadTicket {
        let mut state = self.lock_state();
        state.reads_started += 1;
        ReadTicket {
            grant: state.grant,
            seq: state.reads_started,
        }
    }

    /// Record a raw reading started with `ticket`.
    pub(crate) fn publish_reading(&self, ticket: ReadTicket, raw: f64) {
        let mut state = self.lock_state();
        state.latest_reading = Some(raw);

        let wavelength = match WavemeterStatus::classify(raw) {
            Ok(nm) => nm,
            Err(status) => {
                debug!(%status, "wavemeter reported no wavelength");
                return;
            }
        };
        if state.grant != ticket.grant {
            return;
        }
        let Some(user) = state.current_user.clone() else {
            return;
        };
        if let Some(session) = state.sessions.get_mut(&user) {
            session.last_reading = Some(wavelength);
            session.reading_grant = ticket.grant;
            session.reading_seq = ticket.seq;
        }
    }
}
