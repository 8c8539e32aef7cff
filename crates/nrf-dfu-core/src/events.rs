//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to follow a session without tight coupling
//! to the core logic.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::SessionStep;
use crate::protocol::OpCode;
use crate::state::SessionState;
use crate::transport::ProbeKind;
use crate::version::{Capability, VersionInfo};

/// Events emitted by sessions and the dispatcher.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Device selected, probe starting.
    DeviceConnected { device: String, kind: ProbeKind },
    /// Session torn down.
    DeviceDisconnected { device: String },
    /// Session state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Probe sequence finished.
    VersionKnown(VersionInfo),
    /// Capability resolved from the registry and device report.
    CapabilityKnown(Capability),
    /// Image transfer progress.
    WriteProgress {
        image: PathBuf,
        current: u64,
        total: u64,
    },
    /// All images transferred.
    WriteComplete { images: usize },
    /// Control packet transmitted.
    PacketSent {
        op_code: OpCode,
        signed: bool,
        length: usize,
    },
    /// Local files re-read.
    FilesRefreshed { count: usize, failed: usize },
    /// Error occurred.
    Error {
        device: Option<String>,
        step: Option<SessionStep>,
        message: String,
    },
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that forwards events into a channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DfuEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DfuEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DfuObserver for ChannelObserver {
    fn on_event(&self, event: &DfuEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.tx.send(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::DeviceConnected { device, kind } => {
                tracing::info!(device = %device, kind = %kind, "Device selected");
            }
            DfuEvent::DeviceDisconnected { device } => {
                tracing::info!(device = %device, "Target device closed");
            }
            DfuEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Session state changed");
            }
            DfuEvent::VersionKnown(info) => {
                tracing::info!(
                    protocol = info.protocol_version,
                    part = %format!("{:X}", info.hardware_version.part),
                    images = info.firmware_versions.len(),
                    "Device versions known"
                );
            }
            DfuEvent::CapabilityKnown(cap) => {
                tracing::info!(
                    hardware_id = %cap.hardware_id,
                    rom_size = %format!("{:#X}", cap.rom_size),
                    page_size = %format!("{:#X}", cap.page_size),
                    "Target size known"
                );
            }
            DfuEvent::WriteProgress {
                image,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(image = %image.display(), progress = %format!("{}%", pct), "Progress");
            }
            DfuEvent::WriteComplete { images } => {
                tracing::info!(images, "Write complete");
            }
            DfuEvent::PacketSent {
                op_code,
                signed,
                length,
            } => {
                tracing::trace!(op = %op_code, signed, len = length, "Control packet sent");
            }
            DfuEvent::FilesRefreshed { count, failed } => {
                tracing::info!(count, failed, "Files refreshed");
            }
            DfuEvent::Error {
                device,
                step,
                message,
            } => {
                tracing::error!(device = ?device, step = ?step, "Error: {}", message);
            }
        }
    }
}
