//! Serial adapter for RS-232/USB-serial instruments
//!
//! Wraps the serialport crate. Serial I/O is synchronous, so every call runs
//! on Tokio's blocking pool.

use super::Adapter;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Serial adapter for binary-framed instruments
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Read timeout
    timeout: Duration,

    /// The actual serial port (behind Arc<Mutex> for async access)
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Create a disconnected adapter
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_millis(1000),
            port: None,
        }
    }

    /// Set read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if connected to serial port
    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("Serial port {} not connected", self.port_name))
    }
}

#[async_trait]
impl Adapter for SerialAdapter {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port()?;
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await?
    }

    async fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let port = self.port()?;
        let len = buffer.len();
        let chunk = tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            let mut chunk = vec![0u8; len];
            match port.read(&mut chunk) {
                Ok(n) => {
                    chunk.truncate(n);
                    Ok(chunk)
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(anyhow!(e)),
            }
        })
        .await??;
        buffer[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    async fn connect(&mut self) -> Result<()> {
        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let timeout = self.timeout;

        let port = tokio::task::spawn_blocking(move || {
            let port = serialport::new(&port_name, baud_rate)
                .timeout(timeout)
                .open()
                .with_context(|| format!("Failed to open serial port {}", port_name))?;

            Ok::<Box<dyn SerialPort>, anyhow::Error>(port)
        })
        .await??;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(port = %self.port_name, "connected to serial port");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "disconnected from serial port");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0".to_string(), 115200)
            .with_timeout(Duration::from_millis(500));
        assert_eq!(adapter.port_name, "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate, 115200);
        assert_eq!(adapter.timeout, Duration::from_millis(500));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_write_without_connect_fails() {
        let mut adapter = SerialAdapter::new("/dev/null-port".to_string(), 115200);
        assert!(adapter.write(&[0x00]).await.is_err());
    }
}
