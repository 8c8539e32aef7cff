//! Enumerations carried on the wire.
//!
//! Discriminants match the numeric tags of the `dfu` schema enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Command discriminant (`dfu.OpCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reset = 0,
    Init = 1,
}

/// Kind of image described by an Init command (`dfu.FwType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FwType {
    #[default]
    Application = 0,
    Softdevice = 1,
    Bootloader = 2,
    SoftdeviceBootloader = 3,
}

/// Hash algorithm of the image digest (`dfu.HashType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashType {
    NoHash = 0,
    Crc = 1,
    Sha128 = 2,
    #[default]
    Sha256 = 3,
    Sha512 = 4,
}

/// Signature scheme of a signed command (`dfu.SignatureType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    EcdsaP256Sha256 = 0,
    Ed25519 = 1,
}

macro_rules! wire_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Numeric tag written on the wire.
            pub fn as_u32(self) -> u32 {
                self as u32
            }

            /// Parse a numeric wire tag.
            pub fn from_u32(value: u32) -> Option<Self> {
                $(
                    if value == $ty::$variant as u32 {
                        return Some($ty::$variant);
                    }
                )+
                None
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($ty::$variant => write!(f, $name),)+
                }
            }
        }
    };
}

wire_enum!(OpCode {
    Reset => "RESET",
    Init => "INIT",
});

wire_enum!(FwType {
    Application => "APPLICATION",
    Softdevice => "SOFTDEVICE",
    Bootloader => "BOOTLOADER",
    SoftdeviceBootloader => "SOFTDEVICE_BOOTLOADER",
});

wire_enum!(HashType {
    NoHash => "NO_HASH",
    Crc => "CRC",
    Sha128 => "SHA128",
    Sha256 => "SHA256",
    Sha512 => "SHA512",
});

wire_enum!(SignatureType {
    EcdsaP256Sha256 => "ECDSA_P256_SHA256",
    Ed25519 => "ED25519",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags() {
        assert_eq!(OpCode::Init.as_u32(), 1);
        assert_eq!(FwType::SoftdeviceBootloader.as_u32(), 3);
        assert_eq!(HashType::Sha512.as_u32(), 4);
        assert_eq!(SignatureType::Ed25519.as_u32(), 1);
    }

    #[test]
    fn test_from_u32() {
        assert_eq!(HashType::from_u32(1), Some(HashType::Crc));
        assert_eq!(FwType::from_u32(7), None);
    }

    #[test]
    fn test_display_uses_schema_names() {
        assert_eq!(SignatureType::EcdsaP256Sha256.to_string(), "ECDSA_P256_SHA256");
        assert_eq!(HashType::NoHash.to_string(), "NO_HASH");
    }
}
