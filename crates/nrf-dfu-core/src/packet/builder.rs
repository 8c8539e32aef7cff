//! Packet construction with argument validation.

use super::{Command, Hash, InitCommand, Packet, PacketError, ResetCommand, SignedCommand, encode};
use crate::protocol::constants::DEFAULT_FW_VERSION;
use crate::protocol::{FwType, HashType, SignatureType};

/// Pair up the optional signature arguments.
///
/// Both or neither must be given; a lone half is rejected instead of being
/// dropped.
fn signature_pair(
    signature_type: Option<SignatureType>,
    signature: Option<Vec<u8>>,
) -> Result<Option<(SignatureType, Vec<u8>)>, PacketError> {
    match (signature_type, signature) {
        (Some(t), Some(s)) => Ok(Some((t, s))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(PacketError::InvalidArgument(
            "signature type given without signature".into(),
        )),
        (None, Some(_)) => Err(PacketError::InvalidArgument(
            "signature given without signature type".into(),
        )),
    }
}

fn wrap(command: Command, signature: Option<(SignatureType, Vec<u8>)>) -> Packet {
    match signature {
        Some((signature_type, signature)) => Packet::signed(SignedCommand {
            command,
            signature_type,
            signature,
        }),
        None => Packet::unsigned(command),
    }
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, PacketError> {
    value.ok_or_else(|| PacketError::InvalidArgument(format!("{name} is not set")))
}

/// Build a Reset packet.
pub fn build_reset_packet(
    timeout: Option<u32>,
    signature_type: Option<SignatureType>,
    signature: Option<Vec<u8>>,
) -> Result<Packet, PacketError> {
    let timeout = required(timeout, "timeout")?;
    let signature = signature_pair(signature_type, signature)?;
    Ok(wrap(Command::Reset(ResetCommand { timeout }), signature))
}

/// Inputs of an Init packet.
///
/// `fw_version` and `is_debug` fall back to 0 / false; every other field
/// except the signature pair is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitPacketParams {
    pub fw_version: Option<u32>,
    pub hw_version: Option<u32>,
    pub sd_req: Option<Vec<u32>>,
    pub fw_type: Option<FwType>,
    pub sd_size: Option<u32>,
    pub bl_size: Option<u32>,
    pub app_size: Option<u32>,
    pub hash_type: Option<HashType>,
    pub hash: Option<Vec<u8>>,
    pub is_debug: Option<bool>,
    pub signature_type: Option<SignatureType>,
    pub signature: Option<Vec<u8>>,
}

/// Build an Init packet.
pub fn build_init_packet(params: InitPacketParams) -> Result<Packet, PacketError> {
    let sd_req = required(params.sd_req, "sd_req")?;
    if sd_req.is_empty() {
        return Err(PacketError::InvalidArgument("sd_req is empty".into()));
    }
    let hash = Hash {
        hash_type: params.hash_type.unwrap_or(HashType::NoHash),
        hash: params.hash.unwrap_or_default(),
    };

    let init = InitCommand {
        fw_version: params.fw_version.unwrap_or(DEFAULT_FW_VERSION),
        hw_version: required(params.hw_version, "hw_version")?,
        sd_req,
        fw_type: required(params.fw_type, "fw_type")?,
        sd_size: required(params.sd_size, "sd_size")?,
        bl_size: required(params.bl_size, "bl_size")?,
        app_size: required(params.app_size, "app_size")?,
        hash,
        is_debug: params.is_debug.unwrap_or(false),
    };
    let signature = signature_pair(params.signature_type, params.signature)?;
    Ok(wrap(Command::Init(init), signature))
}

/// Build and encode a Reset packet.
pub fn encode_reset_packet(
    timeout: Option<u32>,
    signature_type: Option<SignatureType>,
    signature: Option<Vec<u8>>,
) -> Result<Vec<u8>, PacketError> {
    encode(&build_reset_packet(timeout, signature_type, signature)?)
}

/// Build and encode an Init packet.
pub fn encode_init_packet(params: InitPacketParams) -> Result<Vec<u8>, PacketError> {
    encode(&build_init_packet(params)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;

    fn app_params() -> InitPacketParams {
        InitPacketParams {
            hw_version: Some(52),
            sd_req: Some(vec![0xFFFE]),
            fw_type: Some(FwType::Application),
            sd_size: Some(0),
            bl_size: Some(0),
            app_size: Some(4),
            hash_type: Some(HashType::Sha256),
            hash: Some(vec![1, 2]),
            ..Default::default()
        }
    }

    #[test]
    fn test_reset_requires_timeout() {
        let err = build_reset_packet(None, None, None).unwrap_err();
        assert!(matches!(err, PacketError::InvalidArgument(_)));
    }

    #[test]
    fn test_reset_unsigned() {
        let packet = build_reset_packet(Some(0), None, None).unwrap();
        assert!(!packet.is_signed());
        assert_eq!(
            packet.command,
            Some(Command::Reset(ResetCommand { timeout: 0 }))
        );
    }

    #[test]
    fn test_reset_signed() {
        let packet =
            build_reset_packet(Some(10), Some(SignatureType::Ed25519), Some(vec![0xAA])).unwrap();
        assert!(packet.is_signed());
        assert!(packet.command.is_none());
        let signed = packet.signed_command.unwrap();
        assert_eq!(signed.signature_type, SignatureType::Ed25519);
        assert_eq!(signed.signature, vec![0xAA]);
    }

    #[test]
    fn test_reset_half_signature_rejected() {
        assert!(matches!(
            build_reset_packet(Some(1), Some(SignatureType::Ed25519), None),
            Err(PacketError::InvalidArgument(_))
        ));
        assert!(matches!(
            build_reset_packet(Some(1), None, Some(vec![1, 2, 3])),
            Err(PacketError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_init_defaults() {
        let packet = build_init_packet(app_params()).unwrap();
        let Some(Command::Init(init)) = packet.command else {
            panic!("expected unsigned init command");
        };
        assert_eq!(init.fw_version, 0);
        assert!(!init.is_debug);
        assert_eq!(init.hash.hash_type, HashType::Sha256);
    }

    #[test]
    fn test_init_missing_required_field() {
        for strip in ["hw_version", "sd_req", "fw_type", "sd_size", "bl_size", "app_size"] {
            let mut params = app_params();
            match strip {
                "hw_version" => params.hw_version = None,
                "sd_req" => params.sd_req = None,
                "fw_type" => params.fw_type = None,
                "sd_size" => params.sd_size = None,
                "bl_size" => params.bl_size = None,
                _ => params.app_size = None,
            }
            let err = build_init_packet(params).unwrap_err();
            assert_eq!(err, PacketError::InvalidArgument(format!("{strip} is not set")));
        }
    }

    #[test]
    fn test_init_empty_sd_req_rejected() {
        let mut params = app_params();
        params.sd_req = Some(vec![]);
        assert!(build_init_packet(params).is_err());
    }

    #[test]
    fn test_init_no_hash_allowed() {
        let mut params = app_params();
        params.hash_type = None;
        params.hash = None;
        let packet = build_init_packet(params).unwrap();
        let Some(Command::Init(init)) = packet.inner_command().cloned() else {
            panic!("expected init");
        };
        assert_eq!(init.hash.hash_type, HashType::NoHash);
        assert!(init.hash.hash.is_empty());
    }

    #[test]
    fn test_init_signature_pairing() {
        let mut params = app_params();
        params.signature_type = Some(SignatureType::EcdsaP256Sha256);
        assert!(matches!(
            build_init_packet(params.clone()),
            Err(PacketError::InvalidArgument(_))
        ));

        params.signature = Some(vec![0u8; 64]);
        let packet = build_init_packet(params).unwrap();
        assert!(packet.is_signed());
        assert_eq!(packet.op_code(), Some(OpCode::Init));
    }

    #[test]
    fn test_encode_init_packet_uses_init_builder() {
        let bytes = encode_init_packet(app_params()).unwrap();
        let reset = encode_reset_packet(Some(0), None, None).unwrap();
        assert_ne!(bytes, reset);
        // Command.op_code = INIT inside Packet.command
        assert_eq!(&bytes[2..4], &[0x08, 0x01]);
    }

    #[test]
    fn test_encode_reset_packet_propagates_errors() {
        assert!(encode_reset_packet(None, None, None).is_err());
    }
}
