//! Background loops of the arbiter.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ResourceArbiter;
use crate::error::WlmError;
use crate::error_recovery::{retry_with_recovery, Recoverable};
use crate::hardware::{SwitchPort, WavemeterPort};

/// One attempt at pointing the switch at `channel`.
struct SwitchTo<'a> {
    switch: &'a mut Box<dyn SwitchPort>,
    channel: u8,
}

#[async_trait]
impl<'a> Recoverable for SwitchTo<'a> {
    type Output = ();

    async fn attempt(&mut self) -> anyhow::Result<()> {
        if self.switch.set_channel(self.channel).await? {
            Ok(())
        } else {
            Err(anyhow::anyhow!("switch refused channel {}", self.channel))
        }
    }

    async fn recover(&mut self) -> anyhow::Result<()> {
        self.switch.reconnect().await
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancel.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Round-robin over the registered sessions.
pub(super) async fn run_scheduler(
    arbiter: Arc<ResourceArbiter>,
    mut switch: Box<dyn SwitchPort>,
    cancel: CancellationToken,
) {
    let config = arbiter.config().clone();
    let tick = config.scheduler_tick();

    loop {
        if !pause(&cancel, tick).await {
            break;
        }

        let next = {
            let mut state = arbiter.lock_state();
            if state.sessions.is_empty() {
                state.set_current(None);
                continue;
            }
            state.rotation = (state.rotation + 1) % state.sessions.len();
            let rotation = state.rotation;
            let selected = state
                .sessions
                .values()
                .nth(rotation)
                .map(|s| (s.name.clone(), s.channel, s.slot_duration));
            let already_current = selected
                .as_ref()
                .is_some_and(|(name, _, _)| state.current_user.as_ref() == Some(name));
            if !already_current {
                // Nobody owns readings while the switch moves.
                state.set_current(None);
            }
            selected.map(|sel| (sel, already_current))
        };
        let Some(((name, channel, slot), already_current)) = next else {
            continue;
        };

        if !already_current {
            let mut op = SwitchTo {
                switch: &mut switch,
                channel,
            };
            if let Err(e) = retry_with_recovery(&mut op, &config.switch_retry).await {
                let fault = WlmError::SwitchFault(e.to_string());
                warn!(client = %name, channel, error = %fault, "skipping slot");
                continue;
            }
            if !pause(&cancel, config.settle_delay()).await {
                break;
            }

            let mut state = arbiter.lock_state();
            if state.sessions.contains_key(&name) {
                state.set_current(Some(name.clone()));
                debug!(client = %name, channel, grant = state.grant, "switch granted");
            } else {
                debug!(client = %name, "client left before its slot");
                continue;
            }
        }

        let evicted = arbiter
            .lock_state()
            .sweep(Instant::now(), config.max_inactivity());
        for client in evicted {
            info!(client = %client, "client evicted after inactivity");
        }

        // Hold the slot, ending early once the holder is gone.
        let held_since = Instant::now();
        while held_since.elapsed() < slot {
            if arbiter.current_user().as_deref() != Some(name.as_str()) {
                break;
            }
            let remaining = slot.saturating_sub(held_since.elapsed());
            if !pause(&cancel, remaining.min(tick)).await {
                return;
            }
        }
    }
    debug!("scheduler loop stopped");
}

/// Poll the wavemeter at a fixed cadence and publish each reading.
pub(super) async fn run_reader(
    arbiter: Arc<ResourceArbiter>,
    mut wavemeter: Box<dyn WavemeterPort>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(arbiter.config().read_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let ticket = arbiter.begin_read();
        let reading = tokio::select! {
            _ = cancel.cancelled() => break,
            reading = wavemeter.read_wavelength() => reading,
        };
        match reading {
            Ok(raw) => arbiter.publish_reading(ticket, raw),
            Err(e) => warn!(error = %e, "wavemeter read failed"),
        }
    }
    debug!("reader loop stopped");
}
