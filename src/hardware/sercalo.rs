//! Sercalo 1xN fiber optic switch
//!
//! Binary protocol at 115200 baud. Requests are framed as
//!
//! ```text
//! EF EF | len | addr | cmd | data.. | checksum        len = 3 + data.len()
//! ```
//!
//! and replies as
//!
//! ```text
//! FE FE | len | addr | cmd | error | data.. | checksum
//! ```
//!
//! where `len` counts the bytes after it and the checksum is the low byte of
//! the sum of every byte before it.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::{ProductInfo, SwitchPort};
use crate::adapters::{read_up_to, Adapter};

const WRITE_PREAMBLE: [u8; 2] = [0xEF, 0xEF];
const READ_PREAMBLE: [u8; 2] = [0xFE, 0xFE];
const BROADCAST_ADDRESS: u8 = 0xFF;

/// Switch commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Identification block
    ProductInfo = 0x01,
    /// Currently selected input
    GetChannel = 0x02,
    /// Reset the device
    Reset = 0x03,
    /// Select an input
    SetChannel = 0x04,
}

/// Error codes reported in a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Code 1
    InvalidCommand,
    /// Code 2
    InvalidParameter,
    /// Code 3
    CommandFailed,
    /// Code 4
    Checksum,
    /// Any other non-zero code
    Other(u8),
}

impl DeviceError {
    /// Classify a reply error byte. `None` means success.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::InvalidCommand),
            2 => Some(Self::InvalidParameter),
            3 => Some(Self::CommandFailed),
            4 => Some(Self::Checksum),
            other => Some(Self::Other(other)),
        }
    }
}

/// Decoded reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Responding device address
    pub address: u8,
    /// Echoed command
    pub command: u8,
    /// Raw error byte, 0 on success
    pub error: u8,
    /// Command payload
    pub data: Vec<u8>,
}

/// Low byte of the sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Build a request frame.
pub fn encode_request(command: Command, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + data.len());
    frame.extend_from_slice(&WRITE_PREAMBLE);
    // addr + cmd + payload + checksum
    frame.push(3 + data.len() as u8);
    frame.push(BROADCAST_ADDRESS);
    frame.push(command as u8);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));
    frame
}

/// Decode a complete reply frame, preamble included.
pub fn decode_reply(frame: &[u8]) -> Result<Reply> {
    if frame.len() < 7 {
        bail!("reply too short: {} bytes", frame.len());
    }
    if frame[..2] != READ_PREAMBLE {
        bail!("unexpected reply preamble {:02X?}", &frame[..2]);
    }
    let len = frame[2] as usize;
    if frame.len() != 3 + len {
        bail!("reply length byte {} does not match {} bytes", len, frame.len() - 3);
    }
    let (body, trailer) = frame.split_at(frame.len() - 1);
    if checksum(body) != trailer[0] {
        bail!(
            "reply checksum mismatch: computed {:02X}, received {:02X}",
            checksum(body),
            trailer[0]
        );
    }
    Ok(Reply {
        address: frame[3],
        command: frame[4],
        error: frame[5],
        data: frame[6..frame.len() - 1].to_vec(),
    })
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ';' || c.is_whitespace() || c == '\0')
        .to_string()
}

/// Parse the payload of a product-info reply.
pub fn parse_product_info(data: &[u8]) -> Result<ProductInfo> {
    if data.len() < 29 {
        bail!("product info payload too short: {} bytes", data.len());
    }
    Ok(ProductInfo {
        vendor: ascii_field(&data[0..10]),
        model: ascii_field(&data[10..20]),
        hardware_version: (data[21], data[22]),
        firmware_version: (data[23], data[24]),
        production_date: format!(
            "{:02}{:02}-{:02}-{:02}",
            data[25], data[26], data[27], data[28]
        ),
        serial_number: ascii_field(&data[29..]),
    })
}

/// Driver for a Sercalo 1xN switch on any byte adapter
pub struct SercaloSwitch<A: Adapter> {
    adapter: A,
    number_of_channels: u8,
}

impl<A: Adapter> SercaloSwitch<A> {
    /// Wrap an already connected adapter.
    pub fn new(adapter: A, number_of_channels: u8) -> Self {
        Self {
            adapter,
            number_of_channels,
        }
    }

    /// Number of selectable inputs
    pub fn number_of_channels(&self) -> u8 {
        self.number_of_channels
    }

    async fn transact(&mut self, command: Command, data: &[u8]) -> Result<Reply> {
        let request = encode_request(command, data);
        debug!(frame = ?request, "sending switch frame");
        self.adapter.write(&request).await?;

        let header = read_up_to(&mut self.adapter, 3).await?;
        if header.is_empty() {
            bail!("switch returned nothing for {:?}", command);
        }
        if header.len() < 3 || header[..2] != READ_PREAMBLE {
            let junk = read_up_to(&mut self.adapter, 64).await.unwrap_or_default();
            bail!(
                "unexpected switch reply {:02X?}, discarded {} buffered bytes",
                header,
                junk.len()
            );
        }

        let len = header[2] as usize;
        let body = read_up_to(&mut self.adapter, len).await?;
        if body.len() < len {
            bail!("switch reply truncated: {} of {} bytes", body.len(), len);
        }

        let mut frame = header;
        frame.extend_from_slice(&body);
        let reply = decode_reply(&frame)?;
        if let Some(err) = DeviceError::from_code(reply.error) {
            error!(?command, device_error = ?err, "switch reported an error");
        }
        Ok(reply)
    }

    /// Currently selected input
    pub async fn get_channel(&mut self) -> Result<u8> {
        let reply = self.transact(Command::GetChannel, &[]).await?;
        reply
            .data
            .first()
            .copied()
            .ok_or_else(|| anyhow!("get-channel reply carried no data"))
    }

    /// Reset the device. Returns whether it acknowledged.
    pub async fn reset(&mut self) -> Result<bool> {
        let reply = self.transact(Command::Reset, &[]).await?;
        Ok(reply.error == 0)
    }
}

#[async_trait]
impl<A: Adapter> SwitchPort for SercaloSwitch<A> {
    async fn set_channel(&mut self, channel: u8) -> Result<bool> {
        if channel < 1 || channel > self.number_of_channels {
            warn!(channel, max = self.number_of_channels, "invalid switch channel");
            return Ok(false);
        }
        let reply = self.transact(Command::SetChannel, &[channel]).await?;
        Ok(reply.error == 0)
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.adapter.close().await?;
        self.adapter.connect().await
    }

    async fn product_info(&mut self) -> Result<ProductInfo> {
        let reply = self.transact(Command::ProductInfo, &[]).await?;
        parse_product_info(&reply.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    fn reply(command: u8, error: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFE, 0xFE, 4 + data.len() as u8, 0x01, command, error];
        frame.extend_from_slice(data);
        frame.push(checksum(&frame));
        frame
    }

    #[test]
    fn test_product_info_request_frame() {
        assert_eq!(
            encode_request(Command::ProductInfo, &[]),
            vec![0xEF, 0xEF, 0x03, 0xFF, 0x01, 0xE1]
        );
        assert_eq!(
            encode_request(Command::GetChannel, &[]),
            vec![0xEF, 0xEF, 0x03, 0xFF, 0x02, 0xE2]
        );
    }

    #[test]
    fn test_set_channel_frame_length_and_checksum() {
        let frame = encode_request(Command::SetChannel, &[3]);
        assert_eq!(&frame[..5], &[0xEF, 0xEF, 0x04, 0xFF, 0x04]);
        assert_eq!(frame[5], 3);
        assert_eq!(frame[6], checksum(&frame[..6]));
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut frame = reply(0x04, 0, &[]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(decode_reply(&frame).is_err());
    }

    #[tokio::test]
    async fn test_set_channel_success() {
        let adapter = MockAdapter::new();
        adapter.push_reply(reply(0x04, 0, &[]));
        let mut switch = SercaloSwitch::new(adapter.clone(), 8);

        assert!(switch.set_channel(5).await.unwrap());
        assert_eq!(adapter.written()[0], encode_request(Command::SetChannel, &[5]));
    }

    #[tokio::test]
    async fn test_set_channel_device_error() {
        let adapter = MockAdapter::new();
        adapter.push_reply(reply(0x04, 3, &[]));
        let mut switch = SercaloSwitch::new(adapter, 8);

        assert!(!switch.set_channel(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_range_channel_sends_nothing() {
        let adapter = MockAdapter::new();
        let mut switch = SercaloSwitch::new(adapter.clone(), 8);

        assert!(!switch.set_channel(9).await.unwrap());
        assert!(!switch.set_channel(0).await.unwrap());
        assert!(adapter.written().is_empty());
    }

    #[tokio::test]
    async fn test_silent_device_is_an_error() {
        let adapter = MockAdapter::new();
        adapter.push_reply(Vec::new());
        let mut switch = SercaloSwitch::new(adapter, 8);

        assert!(switch.set_channel(1).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_reply_is_an_error() {
        let adapter = MockAdapter::new();
        adapter.push_reply(b"OK\r\n".to_vec());
        let mut switch = SercaloSwitch::new(adapter, 8);

        assert!(switch.set_channel(1).await.is_err());
    }

    #[tokio::test]
    async fn test_get_channel() {
        let adapter = MockAdapter::new();
        adapter.push_reply(reply(0x02, 0, &[6]));
        let mut switch = SercaloSwitch::new(adapter, 8);

        assert_eq!(switch.get_channel().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_product_info() {
        let mut data = Vec::new();
        data.extend_from_slice(b"SERCALO;;;");
        data.extend_from_slice(b"SR1x8;;;;;");
        data.push(0);
        data.extend_from_slice(&[1, 2, 3, 4, 20, 21, 6, 15]);
        data.extend_from_slice(b"SN12345");

        let adapter = MockAdapter::new();
        adapter.push_reply(reply(0x01, 0, &data));
        let mut switch = SercaloSwitch::new(adapter, 8);

        let info = switch.product_info().await.unwrap();
        assert_eq!(info.vendor, "SERCALO");
        assert_eq!(info.model, "SR1x8");
        assert_eq!(info.hardware_version, (1, 2));
        assert_eq!(info.firmware_version, (3, 4));
        assert_eq!(info.production_date, "2021-06-15");
        assert_eq!(info.serial_number, "SN12345");
    }

    #[tokio::test]
    async fn test_reconnect_reopens_adapter() {
        let adapter = MockAdapter::new();
        let mut switch = SercaloSwitch::new(adapter.clone(), 8);

        switch.reconnect().await.unwrap();
        assert_eq!(adapter.connects(), 1);
    }
}
