//! Packet Builder - DFU control command object graph.
//!
//! A [`Packet`] is the unit transmitted to the bootloader. It carries either
//! a plain [`Command`] or a [`SignedCommand`] wrapping one. Packets are
//! plain values: build them with [`build_reset_packet`] /
//! [`build_init_packet`] and serialize them with [`encode`].

mod builder;
mod encode;

pub use builder::{
    InitPacketParams, build_init_packet, build_reset_packet, encode_init_packet,
    encode_reset_packet,
};
pub use encode::encode;

use thiserror::Error;

use crate::protocol::wire::SchemaError;
use crate::protocol::{FwType, HashType, OpCode, SignatureType};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<SchemaError> for PacketError {
    fn from(e: SchemaError) -> Self {
        PacketError::Encoding(e.to_string())
    }
}

/// Image digest descriptor (`dfu.Hash`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hash {
    pub hash_type: HashType,
    pub hash: Vec<u8>,
}

/// `dfu.ResetCommand`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetCommand {
    pub timeout: u32,
}

/// `dfu.InitCommand`: describes the image about to be transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommand {
    pub fw_version: u32,
    pub hw_version: u32,
    pub sd_req: Vec<u32>,
    pub fw_type: FwType,
    pub sd_size: u32,
    pub bl_size: u32,
    pub app_size: u32,
    pub hash: Hash,
    pub is_debug: bool,
}

/// `dfu.Command`. The op code is implied by the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reset(ResetCommand),
    Init(InitCommand),
}

impl Command {
    pub fn op_code(&self) -> OpCode {
        match self {
            Command::Reset(_) => OpCode::Reset,
            Command::Init(_) => OpCode::Init,
        }
    }
}

/// `dfu.SignedCommand`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCommand {
    pub command: Command,
    pub signature_type: SignatureType,
    pub signature: Vec<u8>,
}

/// `dfu.Packet`: exactly one of `command` / `signed_command` is set.
///
/// Fields are public so that packets received from elsewhere can be
/// represented; [`encode`] rejects packets that break the one-of rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub command: Option<Command>,
    pub signed_command: Option<SignedCommand>,
}

impl Packet {
    pub fn unsigned(command: Command) -> Self {
        Self {
            command: Some(command),
            signed_command: None,
        }
    }

    pub fn signed(signed_command: SignedCommand) -> Self {
        Self {
            command: None,
            signed_command: Some(signed_command),
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signed_command.is_some()
    }

    /// The carried command, looking through the signature wrapper.
    pub fn inner_command(&self) -> Option<&Command> {
        match (&self.command, &self.signed_command) {
            (Some(c), None) => Some(c),
            (None, Some(s)) => Some(&s.command),
            _ => None,
        }
    }

    pub fn op_code(&self) -> Option<OpCode> {
        self.inner_command().map(Command::op_code)
    }
}
