//! Per-client registration records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// A registered client of the wavemeter.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Client name, one of the configured channel names
    pub name: String,
    /// Switch input carrying this client's light
    pub channel: u8,
    /// Exclusive access requested per turn
    pub slot_duration: Duration,
    /// Last registration or served query
    pub last_activity: Instant,
    /// Wall-clock twin of `last_activity`, for display
    pub last_activity_at: DateTime<Utc>,
    /// Most recent wavelength attributed to this client (nm)
    pub last_reading: Option<f64>,
    /// Grant during which `last_reading` was taken
    pub(crate) reading_grant: u64,
    /// Sequence number of the read that produced `last_reading`
    pub(crate) reading_seq: u64,
}

impl ClientSession {
    pub(crate) fn new(name: &str, channel: u8, slot_duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            channel,
            slot_duration,
            last_activity: Instant::now(),
            last_activity_at: Utc::now(),
            last_reading: None,
            reading_grant: 0,
            reading_seq: 0,
        }
    }

    /// Mark the client as active now.
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    /// Whether the client has been idle for longer than `max_inactivity`.
    pub fn is_expired(&self, now: Instant, max_inactivity: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > max_inactivity
    }

    /// Diagnostic view of this session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            channel: self.channel,
            slot_duration_secs: self.slot_duration.as_secs_f64(),
            last_activity: self.last_activity_at,
            idle_secs: self.last_activity.elapsed().as_secs_f64(),
            last_reading: self.last_reading,
        }
    }
}

/// Serializable view of a [`ClientSession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Switch input
    pub channel: u8,
    /// Slot length in seconds
    pub slot_duration_secs: f64,
    /// Time of last activity
    pub last_activity: DateTime<Utc>,
    /// Seconds since last activity
    pub idle_secs: f64,
    /// Most recent attributed reading (nm)
    pub last_reading: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_after_inactivity() {
        let mut session = ClientSession::new("CTL1", 1, Duration::from_millis(500));
        let max = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!session.is_expired(Instant::now(), max));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(session.is_expired(Instant::now(), max));

        session.touch();
        assert!(!session.is_expired(Instant::now(), max));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_slot() {
        let session = ClientSession::new("CTL2", 2, Duration::from_secs(1));
        let snap = session.snapshot();
        assert_eq!(snap.channel, 2);
        assert_eq!(snap.slot_duration_secs, 1.0);
        assert!(snap.last_reading.is_none());
    }
}
