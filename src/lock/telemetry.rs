//! Bounded history of lock samples for display.

use ringbuf::{ring_buffer::RbBase, HeapRb, Rb};
use serde::{Deserialize, Serialize};

/// One lock loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since tracking started
    pub elapsed_secs: f64,
    /// Wavemeter reading (nm)
    pub wavelength_nm: f64,
    /// Feedback returned for this sample (V)
    pub feedback: f64,
    /// Whether the sample reached the PID
    pub accepted: bool,
}

/// Fixed-capacity sample history, oldest evicted first.
///
/// Keeps every sample, rejected ones included.
pub struct History {
    samples: HeapRb<Sample>,
    capacity: usize,
}

impl History {
    /// History holding up to `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: HeapRb::new(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: Sample) {
        self.samples.push_overwrite(sample);
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<Sample> {
        self.samples.iter().last().copied()
    }

    /// Samples from oldest to newest.
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }

    /// Number of stored samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was stored yet
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of stored samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: usize) -> Sample {
        Sample {
            elapsed_secs: i as f64,
            wavelength_nm: 1550.0,
            feedback: 0.0,
            accepted: true,
        }
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.push(sample(i));
        }
        let elapsed: Vec<f64> = history.samples().iter().map(|s| s.elapsed_secs).collect();
        assert_eq!(elapsed, vec![2.0, 3.0, 4.0]);
        assert_eq!(history.latest().map(|s| s.elapsed_secs), Some(4.0));
    }

    #[test]
    fn test_clear() {
        let mut history = History::new(20);
        history.push(sample(0));
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.capacity(), 20);
    }
}
