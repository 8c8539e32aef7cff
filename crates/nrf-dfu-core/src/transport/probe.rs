//! Device probes - how a session reaches its target.
//!
//! A probe is chosen when a device is selected and yields a transport for
//! it. The link itself (framing, port I/O) lives behind
//! [`TransportConnector`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::traits::{DfuTransport, TransportError};
use super::usb;
use crate::protocol::constants::DEFAULT_BAUD_RATE;

/// Address of a link, handed to the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEndpoint {
    Serial { port: String, baud_rate: u32 },
    Usb { serial_number: String },
}

impl fmt::Display for LinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEndpoint::Serial { port, baud_rate } => write!(f, "{port}@{baud_rate}"),
            LinkEndpoint::Usb { serial_number } => write!(f, "usb:{serial_number}"),
        }
    }
}

/// Link layer factory.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, endpoint: &LinkEndpoint)
    -> Result<Box<dyn DfuTransport>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Usb,
    Serial,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Usb => write!(f, "USB"),
            ProbeKind::Serial => write!(f, "Serial"),
        }
    }
}

/// Way of reaching one device.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// Human readable device name for logs and errors.
    fn describe(&self) -> String;

    /// Produce a fresh, not yet opened transport for the device.
    async fn acquire(&self) -> Result<Box<dyn DfuTransport>, TransportError>;
}

/// Device behind a serial port.
pub struct SerialProbe {
    port: String,
    baud_rate: u32,
    connector: Arc<dyn TransportConnector>,
}

impl SerialProbe {
    pub fn new(port: impl Into<String>, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            connector,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn endpoint(&self) -> LinkEndpoint {
        LinkEndpoint::Serial {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
        }
    }
}

#[async_trait]
impl DeviceProbe for SerialProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Serial
    }

    fn describe(&self) -> String {
        self.port.clone()
    }

    #[instrument(skip(self), fields(port = %self.port))]
    async fn acquire(&self) -> Result<Box<dyn DfuTransport>, TransportError> {
        debug!(baud_rate = self.baud_rate, "Connecting serial transport");
        self.connector.connect(&self.endpoint()).await
    }
}

/// Native USB device, identified by its serial number.
///
/// Unless disabled, the device must identify as the DFU bootloader before
/// a transport is handed out.
pub struct UsbProbe {
    serial_number: String,
    verify_bootloader: bool,
    connector: Arc<dyn TransportConnector>,
}

impl UsbProbe {
    pub fn new(serial_number: impl Into<String>, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            serial_number: serial_number.into(),
            verify_bootloader: true,
            connector,
        }
    }

    /// Skip the bootloader descriptor check.
    pub fn without_bootloader_check(mut self) -> Self {
        self.verify_bootloader = false;
        self
    }

    pub fn endpoint(&self) -> LinkEndpoint {
        LinkEndpoint::Usb {
            serial_number: self.serial_number.clone(),
        }
    }
}

#[async_trait]
impl DeviceProbe for UsbProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Usb
    }

    fn describe(&self) -> String {
        format!("usb:{}", self.serial_number)
    }

    #[instrument(skip(self), fields(serial = %self.serial_number))]
    async fn acquire(&self) -> Result<Box<dyn DfuTransport>, TransportError> {
        if self.verify_bootloader {
            let serial = self.serial_number.clone();
            let in_bootloader =
                tokio::task::spawn_blocking(move || usb::check_bootloader_mode(&serial))
                    .await
                    .map_err(|e| TransportError::Usb(e.to_string()))??;
            if !in_bootloader {
                return Err(TransportError::NotInBootloader(self.serial_number.clone()));
            }
        }
        self.connector.connect(&self.endpoint()).await
    }
}
