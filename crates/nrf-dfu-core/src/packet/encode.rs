//! Serialization of packets against the `dfu` schema.

use super::{Command, Hash, InitCommand, Packet, PacketError, ResetCommand, SignedCommand};
use crate::protocol::MessageWriter;

/// Encode a packet to its wire bytes.
///
/// Identical packets always produce identical bytes.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, PacketError> {
    let mut w = MessageWriter::new("dfu.Packet")?;
    match (&packet.command, &packet.signed_command) {
        (Some(command), None) => {
            w.message("command", command_writer(command)?)?;
        }
        (None, Some(signed)) => {
            w.message("signed_command", signed_writer(signed)?)?;
        }
        (Some(_), Some(_)) => {
            return Err(PacketError::Encoding(
                "packet has both command and signed_command".into(),
            ));
        }
        (None, None) => {
            return Err(PacketError::Encoding(
                "packet has neither command nor signed_command".into(),
            ));
        }
    }
    Ok(w.finish())
}

fn signed_writer(signed: &SignedCommand) -> Result<MessageWriter, PacketError> {
    let mut w = MessageWriter::new("dfu.SignedCommand")?;
    w.message("command", command_writer(&signed.command)?)?
        .enumeration("signature_type", signed.signature_type.as_u32())?
        .bytes("signature", &signed.signature)?;
    Ok(w)
}

fn command_writer(command: &Command) -> Result<MessageWriter, PacketError> {
    let mut w = MessageWriter::new("dfu.Command")?;
    w.enumeration("op_code", command.op_code().as_u32())?;
    match command {
        Command::Init(init) => w.message("init", init_writer(init)?)?,
        Command::Reset(reset) => w.message("reset", reset_writer(reset)?)?,
    };
    Ok(w)
}

fn reset_writer(reset: &ResetCommand) -> Result<MessageWriter, PacketError> {
    let mut w = MessageWriter::new("dfu.ResetCommand")?;
    w.uint32("timeout", reset.timeout)?;
    Ok(w)
}

fn init_writer(init: &InitCommand) -> Result<MessageWriter, PacketError> {
    let mut w = MessageWriter::new("dfu.InitCommand")?;
    w.uint32("fw_version", init.fw_version)?
        .uint32("hw_version", init.hw_version)?
        .packed_uint32("sd_req", &init.sd_req)?
        .enumeration("type", init.fw_type.as_u32())?
        .uint32("sd_size", init.sd_size)?
        .uint32("bl_size", init.bl_size)?
        .uint32("app_size", init.app_size)?
        .message("hash", hash_writer(&init.hash)?)?
        .boolean("is_debug", init.is_debug)?;
    Ok(w)
}

fn hash_writer(hash: &Hash) -> Result<MessageWriter, PacketError> {
    let mut w = MessageWriter::new("dfu.Hash")?;
    w.enumeration("hash_type", hash.hash_type.as_u32())?
        .bytes("hash", &hash.hash)?;
    Ok(w)
}
