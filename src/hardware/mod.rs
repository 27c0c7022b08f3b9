//! Hardware seams of the wavemeter server.
//!
//! The arbiter only needs two primitives: point the optical switch at an
//! input, and read whatever wavelength arrives at the wavemeter.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod mock;
pub mod sercalo;
pub mod wavemeter;

pub use mock::{MockSwitch, MockWavemeter, SimulatedBench};
pub use sercalo::SercaloSwitch;
pub use wavemeter::WavemeterStatus;

/// Identification block reported by an optical switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Manufacturer
    pub vendor: String,
    /// Model designation
    pub model: String,
    /// Hardware version (major, minor)
    pub hardware_version: (u8, u8),
    /// Firmware version (major, minor)
    pub firmware_version: (u8, u8),
    /// Production date as `YYYY-MM-DD`
    pub production_date: String,
    /// Serial number
    pub serial_number: String,
}

/// Selects which physical input feeds the wavemeter.
#[async_trait]
pub trait SwitchPort: Send {
    /// Route input `channel` (1-based) to the wavemeter.
    ///
    /// Returns `Ok(false)` when the device refused the command and `Err` when
    /// the link itself failed.
    async fn set_channel(&mut self, channel: u8) -> Result<bool>;

    /// Close and reopen the link to the switch.
    async fn reconnect(&mut self) -> Result<()>;

    /// Query the switch's identification block.
    async fn product_info(&mut self) -> Result<ProductInfo>;
}

/// Returns the wavemeter's current best reading.
#[async_trait]
pub trait WavemeterPort: Send {
    /// Raw wavelength in nm. Non-positive values are device status codes,
    /// see [`WavemeterStatus`].
    async fn read_wavelength(&mut self) -> Result<f64>;
}
