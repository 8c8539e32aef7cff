//! nRF-DFU-Core: Nordic secure DFU control packets and device sessions.
//!
//! This crate builds the protobuf-encoded control packets a Nordic secure
//! DFU bootloader consumes, and drives the per-device session that probes
//! a target, writes firmware images to it and recovers it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Wire enums, message schema, protobuf writer
//! - **Packet**: Reset/Init packet builders and encoder
//! - **Device**: Built-in device definition registry
//! - **Transport**: Transport trait, device probes, USB helpers, mock
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Per-device orchestrator, its task and the dispatcher
//! - **Firmware**: Intel HEX / binary images and the open-file store
//!
//! # Example
//!
//! ```no_run
//! use nrf_dfu_core::packet::{InitPacketParams, encode_init_packet};
//! use nrf_dfu_core::protocol::{FwType, HashType};
//!
//! let bytes = encode_init_packet(InitPacketParams {
//!     hw_version: Some(52),
//!     sd_req: Some(vec![0xFFFE]),
//!     fw_type: Some(FwType::Application),
//!     sd_size: Some(0),
//!     bl_size: Some(0),
//!     app_size: Some(0x1000),
//!     hash_type: Some(HashType::NoHash),
//!     ..Default::default()
//! })
//! .expect("invalid init packet");
//! assert!(!bytes.is_empty());
//! ```

pub mod actor;
pub mod device;
pub mod digest;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod firmware;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod version;

// Re-exports for convenience
pub use actor::{Pending, SessionHandle, SessionSnapshot, spawn_session};
pub use device::{DeviceDefinition, DeviceRegistry};
pub use dispatch::{Dispatcher, UiAction};
pub use error::{SessionError, SessionStep};
pub use events::{ChannelObserver, DfuEvent, DfuObserver, NullObserver, TracingObserver};
pub use firmware::{FileStore, FirmwareError, FirmwareImage, MemoryMap};
pub use packet::{Packet, PacketError, build_init_packet, build_reset_packet, encode};
pub use protocol::{FwType, HashType, OpCode, SignatureType};
pub use session::{CancelHandle, DeviceSession, SessionConfig, WriteOutcome};
pub use state::SessionState;
pub use transport::{DeviceProbe, DfuTransport, MockTransport, TransportError};
pub use version::{Capability, HardwareVersion, VersionInfo};
