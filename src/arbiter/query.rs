//! Blocking reading queries.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::ResourceArbiter;
use crate::error::{AppResult, WlmError};

/// Stand-in deadline for timeouts that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

enum Poll {
    Ready(f64),
    Waiting,
}

impl ResourceArbiter {
    /// Wait for `name`'s turn on the switch and return a reading taken during it.
    ///
    /// Only reads started after the call are returned, so a caller that just
    /// moved its laser never sees the old wavelength. The latest reading is
    /// therefore not handed out at once even when `name` already holds the
    /// switch; the call waits up to one read interval for a fresh one.
    ///
    /// Waiting counts as activity, so a blocked client is never evicted. The
    /// state lock is taken only for each check, never across the sleep.
    /// Timeouts too large to add to the clock wait for decades instead.
    ///
    /// # Errors
    ///
    /// `NotRegistered` immediately if `name` has no session, `Timeout` if no
    /// attributed reading arrives within `timeout`.
    pub async fn query_wavelength(&self, name: &str, timeout: Duration) -> AppResult<f64> {
        let after = self.touch(name)?;
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);

        loop {
            match self.poll_attributed(name, after)? {
                Poll::Ready(wavelength) => return Ok(wavelength),
                Poll::Waiting => {}
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(client = name, waited_ms = timeout.as_millis() as u64, "query timed out");
                return Err(WlmError::Timeout {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
            sleep(self.config.query_poll().min(deadline - now)).await;
        }
    }

    /// Refresh `name`'s activity and return the number of reads started so far.
    fn touch(&self, name: &str) -> AppResult<u64> {
        let mut state = self.lock_state();
        let started = state.reads_started;
        state
            .sessions
            .get_mut(name)
            .map(|session| session.touch())
            .ok_or_else(|| WlmError::NotRegistered(name.to_string()))?;
        Ok(started)
    }

    fn poll_attributed(&self, name: &str, after: u64) -> AppResult<Poll> {
        let mut state = self.lock_state();
        let grant = state.grant;
        let is_current = state.current_user.as_deref() == Some(name);
        let session = state
            .sessions
            .get_mut(name)
            .ok_or_else(|| WlmError::NotRegistered(name.to_string()))?;
        if !is_current || session.reading_grant != grant || session.reading_seq <= after {
            return Ok(Poll::Waiting);
        }
        match session.last_reading {
            Some(wavelength) => {
                session.touch();
                Ok(Poll::Ready(wavelength))
            }
            None => Ok(Poll::Waiting),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ArbiterConfig;
    use crate::error::WlmError;
    use crate::arbiter::ResourceArbiter;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_query_fails_immediately() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        let started = tokio::time::Instant::now();

        let err = arbiter
            .query_wavelength("CTL1", Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, WlmError::NotRegistered(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_times_out_without_scheduler() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        arbiter.register("CTL1", None).unwrap();

        let err = arbiter
            .query_wavelength("CTL1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WlmError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_returns_next_attributed_reading() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        arbiter.register("CTL1", None).unwrap();
        arbiter.lock_state().set_current(Some("CTL1".to_string()));

        let started = tokio::time::Instant::now();
        let (wavelength, ()) = tokio::join!(
            arbiter.query_wavelength("CTL1", Duration::from_secs(10)),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let ticket = arbiter.begin_read();
                arbiter.publish_reading(ticket, 1550.25);
            }
        );
        assert_eq!(wavelength.unwrap(), 1550.25);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_ignores_reading_started_before_it() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        arbiter.register("CTL1", None).unwrap();
        arbiter.lock_state().set_current(Some("CTL1".to_string()));
        let ticket = arbiter.begin_read();
        arbiter.publish_reading(ticket, 1550.25);

        let err = arbiter
            .query_wavelength("CTL1", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, WlmError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_accepts_unbounded_timeout() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        arbiter.register("CTL1", None).unwrap();
        arbiter.lock_state().set_current(Some("CTL1".to_string()));

        let (wavelength, ()) = tokio::join!(
            arbiter.query_wavelength("CTL1", Duration::MAX),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let ticket = arbiter.begin_read();
                arbiter.publish_reading(ticket, 1541.3);
            }
        );
        assert_eq!(wavelength.unwrap(), 1541.3);
    }
}
