//! Mock Hardware Implementations
//!
//! A simulated optical bench: one switch and one wavemeter sharing the state
//! of which input is selected and what light arrives on each input. Simulated
//! lasers write their output wavelength onto their input, the switch selects
//! an input and the wavemeter reads whatever is selected.
//!
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{sleep, Duration};

use super::{ProductInfo, SwitchPort, WavemeterPort};
use crate::units::mhz_to_nm;

// =============================================================================
// SimulatedBench - shared optical state
// =============================================================================

/// Light on each switch input and the currently selected input
#[derive(Debug)]
pub struct SimulatedBench {
    selected: AtomicU8,
    sources: Mutex<BTreeMap<u8, f64>>,
    idle_nm: f64,
}

impl SimulatedBench {
    /// Bench with no input selected. Inputs without a source read `idle_nm`.
    pub fn new(idle_nm: f64) -> Arc<Self> {
        Arc::new(Self {
            selected: AtomicU8::new(0),
            sources: Mutex::new(BTreeMap::new()),
            idle_nm,
        })
    }

    /// Route `channel` to the wavemeter.
    pub fn select(&self, channel: u8) {
        self.selected.store(channel, Ordering::SeqCst);
    }

    /// Input currently routed to the wavemeter, 0 before the first switch.
    pub fn selected(&self) -> u8 {
        self.selected.load(Ordering::SeqCst)
    }

    /// Put light of `wavelength_nm` on `channel`.
    pub fn set_source(&self, channel: u8, wavelength_nm: f64) {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, wavelength_nm);
    }

    /// Light on `channel`, if any.
    pub fn source(&self, channel: u8) -> Option<f64> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .copied()
    }

    /// Noise-free wavelength arriving at the wavemeter.
    pub fn reading(&self) -> f64 {
        self.source(self.selected()).unwrap_or(self.idle_nm)
    }
}

// =============================================================================
// MockSwitch - Simulated 1xN optical switch
// =============================================================================

/// Mock 1xN optical switch with fault injection
///
/// Clones share counters, so a test can keep a handle after moving the switch
/// into the arbiter.
#[derive(Clone)]
pub struct MockSwitch {
    bench: Arc<SimulatedBench>,
    number_of_channels: u8,
    latency: Duration,
    pending_faults: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
    reconnects: Arc<AtomicU32>,
    selections: Arc<Mutex<Vec<u8>>>,
}

impl MockSwitch {
    /// Switch with `number_of_channels` inputs acting on `bench`
    pub fn new(bench: Arc<SimulatedBench>, number_of_channels: u8) -> Self {
        Self {
            bench,
            number_of_channels,
            latency: Duration::ZERO,
            pending_faults: Arc::new(AtomicU32::new(0)),
            calls: Arc::new(AtomicU32::new(0)),
            reconnects: Arc::new(AtomicU32::new(0)),
            selections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Simulate mechanical switching time
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` set-channel calls fail with a link error.
    pub fn fail_next(&self, count: u32) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    /// Number of set-channel calls, failed ones included
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of reconnects
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Every input successfully selected, in order
    pub fn selections(&self) -> Vec<u8> {
        self.selections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SwitchPort for MockSwitch {
    async fn set_channel(&mut self, channel: u8) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let faulted = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            bail!("injected switch link fault");
        }
        if channel < 1 || channel > self.number_of_channels {
            return Ok(false);
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        self.bench.select(channel);
        self.selections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
        Ok(true)
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn product_info(&mut self) -> Result<ProductInfo> {
        Ok(ProductInfo {
            vendor: "MOCK".to_string(),
            model: format!("SW1x{}", self.number_of_channels),
            hardware_version: (1, 0),
            firmware_version: (1, 0),
            production_date: "2024-01-01".to_string(),
            serial_number: "MOCK-0001".to_string(),
        })
    }
}

// =============================================================================
// MockWavemeter - Simulated wavemeter
// =============================================================================

/// Mock wavemeter reading the selected bench input with uniform noise
#[derive(Clone)]
pub struct MockWavemeter {
    bench: Arc<SimulatedBench>,
    noise_mhz: f64,
    forced: Arc<Mutex<Option<f64>>>,
    reads: Arc<AtomicU32>,
}

impl MockWavemeter {
    /// Wavemeter on `bench` with peak noise of `noise_mhz`
    pub fn new(bench: Arc<SimulatedBench>, noise_mhz: f64) -> Self {
        Self {
            bench,
            noise_mhz,
            forced: Arc::new(Mutex::new(None)),
            reads: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Return `raw` from every read until cleared with `None`. Use a
    /// non-positive value to simulate a status code.
    pub fn force_reading(&self, raw: Option<f64>) {
        *self.forced.lock().unwrap_or_else(PoisonError::into_inner) = raw;
    }

    /// Number of reads so far
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WavemeterPort for MockWavemeter {
    async fn read_wavelength(&mut self) -> Result<f64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(raw) = *self.forced.lock().unwrap_or_else(PoisonError::into_inner) {
            return Ok(raw);
        }
        let clean = self.bench.reading();
        if self.noise_mhz <= 0.0 {
            return Ok(clean);
        }
        let jitter_mhz = rand::thread_rng().gen_range(-self.noise_mhz..self.noise_mhz);
        Ok(clean + mhz_to_nm(jitter_mhz, clean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wavemeter_follows_switch() {
        let bench = SimulatedBench::new(1550.0);
        bench.set_source(2, 1538.5);
        let mut switch = MockSwitch::new(bench.clone(), 8);
        let mut wlm = MockWavemeter::new(bench, 0.0);

        assert_eq!(wlm.read_wavelength().await.unwrap(), 1550.0);
        assert!(switch.set_channel(2).await.unwrap());
        assert_eq!(wlm.read_wavelength().await.unwrap(), 1538.5);
        assert_eq!(switch.selections(), vec![2]);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let bench = SimulatedBench::new(1550.0);
        let mut switch = MockSwitch::new(bench, 8);
        switch.fail_next(2);

        assert!(switch.set_channel(1).await.is_err());
        assert!(switch.set_channel(1).await.is_err());
        assert!(switch.set_channel(1).await.unwrap());
        assert_eq!(switch.calls(), 3);
    }

    #[tokio::test]
    async fn test_noise_is_bounded() {
        let bench = SimulatedBench::new(1550.0);
        let mut wlm = MockWavemeter::new(bench, 5.0);
        for _ in 0..50 {
            let reading = wlm.read_wavelength().await.unwrap();
            let dev = crate::units::freq_diff_mhz(reading, 1550.0).abs();
            assert!(dev <= 5.01, "{dev}");
        }
    }

    #[tokio::test]
    async fn test_forced_status_code() {
        let bench = SimulatedBench::new(1550.0);
        let mut wlm = MockWavemeter::new(bench, 0.0);
        wlm.force_reading(Some(-3.0));
        assert_eq!(wlm.read_wavelength().await.unwrap(), -3.0);
        wlm.force_reading(None);
        assert_eq!(wlm.read_wavelength().await.unwrap(), 1550.0);
    }
}
