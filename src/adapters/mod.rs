//! Byte-level I/O adapters
//!
//! Instrument drivers talk to an `Adapter` rather than a concrete port so the
//! framing code can be exercised against a scripted mock.

use anyhow::Result;
use async_trait::async_trait;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock::MockAdapter;
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::SerialAdapter;

/// A bidirectional byte stream to an instrument.
#[async_trait]
pub trait Adapter: Send {
    /// Write all of `bytes`.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read into `buffer`, returning the number of bytes read.
    ///
    /// Returns `Ok(0)` when the read timed out with nothing available.
    async fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Open the underlying port.
    async fn connect(&mut self) -> Result<()>;

    /// Close the underlying port. Closing a closed port is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Read until `len` bytes arrived or the adapter times out.
///
/// The returned buffer is shorter than `len` on timeout.
pub async fn read_up_to<A: Adapter + ?Sized>(adapter: &mut A, len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = adapter.read(&mut out[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    out.truncate(filled);
    Ok(out)
}
