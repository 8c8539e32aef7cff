//! DFU transport abstraction.
//!
//! Defines the `DfuTransport` trait the session drives, allowing different
//! link implementations (USB CDC, UART, mock).

use async_trait::async_trait;
use thiserror::Error;

use crate::version::{FirmwareVersion, HardwareVersion};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to open transport: {0}")]
    OpenFailed(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Device is not in bootloader mode: {0}")]
    NotInBootloader(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("USB error: {0}")]
    Usb(String),
}

/// Asynchronous DFU transport.
///
/// Methods take `&mut self`: a handle serves one request at a time, and
/// later queries may rely on state left by earlier ones.
#[async_trait]
pub trait DfuTransport: Send + Sync {
    /// Open the underlying link.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Close the underlying link.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// DFU protocol version spoken by the bootloader.
    async fn protocol_version(&mut self) -> Result<u8, TransportError>;

    async fn hardware_version(&mut self) -> Result<HardwareVersion, TransportError>;

    /// Installed images, in bootloader order.
    async fn firmware_versions(&mut self) -> Result<Vec<FirmwareVersion>, TransportError>;

    /// Transmit an encoded control packet.
    async fn send_packet(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Transmit one chunk of image payload at `offset`.
    async fn send_data(&mut self, offset: u32, data: &[u8]) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
