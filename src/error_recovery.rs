//! Automatic error recovery strategies.
//
// Retry policies for hardware and network paths that are allowed to fail
// transiently: the optical switch (close, reopen, retry) and the remote
// wavemeter connection on the lock side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Policy with `max_attempts` tries spaced by `backoff`.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// Delay between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

/// An operation that may fail transiently and knows how to recover its
/// underlying connection between attempts.
#[async_trait]
pub trait Recoverable {
    /// Successful result of one attempt.
    type Output: Send;

    /// Run the operation once.
    async fn attempt(&mut self) -> anyhow::Result<Self::Output>;

    /// Restore the connection after a failed attempt.
    async fn recover(&mut self) -> anyhow::Result<()>;
}

/// Runs `op` according to `policy`, recovering between failed attempts.
///
/// Returns the first successful output, or the last error once the attempts
/// are exhausted.
pub async fn retry_with_recovery<R>(op: &mut R, policy: &RetryPolicy) -> anyhow::Result<R::Output>
where
    R: Recoverable + Send,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op.attempt().await {
            Ok(out) => return Ok(out),
            Err(err) => {
                tracing::warn!(attempt, max_attempts = attempts, error = %err, "attempt failed");
                last_err = Some(err);
            }
        }
        if attempt < attempts {
            sleep(policy.backoff()).await;
            if let Err(err) = op.recover().await {
                tracing::warn!(error = %err, "recovery failed");
            }
            sleep(policy.backoff()).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
}
