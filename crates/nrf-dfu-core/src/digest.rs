//! Image digests for the Init command hash descriptor.
//!
//! The bootloader compares digests as little-endian integers, so SHA
//! outputs are stored byte-reversed.

use sha2::{Digest, Sha256, Sha512};

use crate::packet::PacketError;
use crate::protocol::HashType;

/// Digest `data` the way the Init command carries it.
pub fn image_digest(hash_type: HashType, data: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut digest = match hash_type {
        HashType::NoHash => return Ok(Vec::new()),
        HashType::Crc => return Ok(crc32fast::hash(data).to_le_bytes().to_vec()),
        HashType::Sha256 => Sha256::digest(data).to_vec(),
        HashType::Sha512 => Sha512::digest(data).to_vec(),
        HashType::Sha128 => {
            return Err(PacketError::InvalidArgument(
                "SHA128 digests are not supported".into(),
            ));
        }
    };
    digest.reverse();
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(
            image_digest(HashType::Crc, b"123456789").unwrap(),
            vec![0x26, 0x39, 0xF4, 0xCB]
        );
        assert_eq!(
            image_digest(HashType::Crc, b"").unwrap(),
            vec![0, 0, 0, 0]
        );
    }

    #[test]
    fn test_sha256_reversed() {
        let digest = image_digest(HashType::Sha256, b"abc").unwrap();
        assert_eq!(digest.len(), 32);
        assert_eq!(digest[0], 0xAD);
        assert_eq!(digest[31], 0xBA);
    }

    #[test]
    fn test_sha512_len() {
        assert_eq!(image_digest(HashType::Sha512, b"").unwrap().len(), 64);
    }

    #[test]
    fn test_no_hash_and_unsupported() {
        assert!(image_digest(HashType::NoHash, b"x").unwrap().is_empty());
        assert!(matches!(
            image_digest(HashType::Sha128, b"x"),
            Err(PacketError::InvalidArgument(_))
        ));
    }
}
