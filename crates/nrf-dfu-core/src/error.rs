//! Session error taxonomy.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::firmware::FirmwareError;
use crate::packet::PacketError;
use crate::state::SessionState;
use crate::transport::TransportError;

/// Step of a session operation, for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    Acquire,
    Open,
    ProtocolVersion,
    HardwareVersion,
    FirmwareVersions,
    Close,
    SendInitPacket,
    SendData,
    SendResetPacket,
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStep::Acquire => "acquire transport",
            SessionStep::Open => "open transport",
            SessionStep::ProtocolVersion => "get protocol version",
            SessionStep::HardwareVersion => "get hardware version",
            SessionStep::FirmwareVersions => "get firmware versions",
            SessionStep::Close => "close transport",
            SessionStep::SendInitPacket => "send init packet",
            SessionStep::SendData => "send firmware data",
            SessionStep::SendResetPacket => "send reset packet",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("{device}: {step} failed: {source}")]
    Transport {
        device: String,
        step: SessionStep,
        #[source]
        source: TransportError,
    },

    #[error("{device}: unsupported device (hardware id {hardware_id}, no ROM size reported)")]
    DeviceUnsupported { device: String, hardware_id: String },

    #[error("{device}: cancelled during {step}")]
    Cancelled { device: String, step: SessionStep },

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("{path}: image spans {start:#X}..{end:#X}, outside target flash")]
    ImageOutOfRange { path: PathBuf, start: u32, end: u64 },

    #[error(transparent)]
    File(#[from] FirmwareError),
}

impl From<PacketError> for SessionError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::InvalidArgument(msg) => SessionError::InvalidArgument(msg),
            PacketError::Encoding(msg) => SessionError::Encoding(msg),
        }
    }
}

impl SessionError {
    /// Step at which a device-level error happened.
    pub fn step(&self) -> Option<SessionStep> {
        match self {
            SessionError::Transport { step, .. } | SessionError::Cancelled { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_context() {
        let err = SessionError::Transport {
            device: "/dev/ttyACM0".into(),
            step: SessionStep::HardwareVersion,
            source: TransportError::Timeout { timeout_ms: 100 },
        };
        assert_eq!(
            err.to_string(),
            "/dev/ttyACM0: get hardware version failed: Timeout after 100ms"
        );
        assert_eq!(err.step(), Some(SessionStep::HardwareVersion));
    }

    #[test]
    fn test_packet_error_mapping() {
        let err: SessionError = PacketError::InvalidArgument("x".into()).into();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
        let err: SessionError = PacketError::Encoding("y".into()).into();
        assert!(matches!(err, SessionError::Encoding(_)));
    }
}
