//! Local firmware file store.
//!
//! Images are read from Intel HEX (`.hex`, `.ihex`) or raw binary files
//! into a [`MemoryMap`]. The store keeps the set of opened files so it can
//! re-read all of them on request.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::protocol::FwType;
use crate::protocol::constants::FLASH_ERASED_BYTE;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: {message}")]
    Hex { line: usize, message: String },

    #[error("Image {0} contains no data")]
    Empty(PathBuf),
}

const ADDRESS_SPACE: u64 = 1 << 32;

fn hex_error(line: usize, message: impl Into<String>) -> FirmwareError {
    FirmwareError::Hex {
        line,
        message: message.into(),
    }
}

/// Sparse flash contents, keyed by start address.
///
/// Adjacent blocks are merged, so each entry is a maximal contiguous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap {
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `data` at `addr`.
    ///
    /// Bytes already present in the range are overwritten and blocks that
    /// overlap or touch it are merged. Data past the 32-bit address space
    /// is dropped.
    pub fn insert(&mut self, addr: u32, data: &[u8]) {
        let start = addr as u64;
        let room = ADDRESS_SPACE - start;
        let data = &data[..(data.len() as u64).min(room) as usize];
        if data.is_empty() {
            return;
        }
        let end = start + data.len() as u64;

        // Descending by start address; stops at the first block ending
        // before `start`.
        let touching: Vec<u32> = self
            .blocks
            .range(..=end.min(u32::MAX as u64) as u32)
            .rev()
            .take_while(|(a, d)| **a as u64 + d.len() as u64 >= start)
            .map(|(a, _)| *a)
            .collect();

        // Appending to, or overwriting inside, a single earlier block.
        if let [only] = touching[..] {
            if let Some(block) = self.blocks.get_mut(&only).filter(|_| only <= addr) {
                let offset = (start - only as u64) as usize;
                let needed = offset + data.len();
                if block.len() < needed {
                    block.resize(needed, FLASH_ERASED_BYTE);
                }
                block[offset..needed].copy_from_slice(data);
                return;
            }
        }

        let old: Vec<(u32, Vec<u8>)> = touching
            .iter()
            .filter_map(|a| self.blocks.remove_entry(a))
            .collect();
        let merged_start = old.iter().map(|(a, _)| *a as u64).fold(start, u64::min);
        let merged_end = old
            .iter()
            .map(|(a, d)| *a as u64 + d.len() as u64)
            .fold(end, u64::max);

        let mut block = vec![FLASH_ERASED_BYTE; (merged_end - merged_start) as usize];
        for (a, d) in old.iter().chain(std::iter::once(&(addr, data.to_vec()))) {
            let offset = (*a as u64 - merged_start) as usize;
            block[offset..offset + d.len()].copy_from_slice(d);
        }
        self.blocks.insert(merged_start as u32, block);
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.blocks.iter().map(|(&a, d)| (a, d.as_slice()))
    }

    /// Number of data bytes held.
    pub fn total_len(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    pub fn start_address(&self) -> Option<u32> {
        self.blocks.keys().next().copied()
    }

    /// One past the last byte; may equal 2^32.
    pub fn end_address(&self) -> Option<u64> {
        self.blocks
            .iter()
            .map(|(&a, d)| a as u64 + d.len() as u64)
            .max()
    }

    /// Flatten into one buffer from the start address, filling gaps with
    /// the erased-flash value.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let (Some(start), Some(end)) = (self.start_address(), self.end_address()) else {
            return Vec::new();
        };
        let mut out = vec![FLASH_ERASED_BYTE; (end - start as u64) as usize];
        for (addr, data) in self.blocks() {
            let offset = (addr - start) as usize;
            out[offset..offset + data.len()].copy_from_slice(data);
        }
        out
    }
}

/// Parse Intel HEX text.
pub fn parse_intel_hex(text: &str) -> Result<MemoryMap, FirmwareError> {
    let mut map = MemoryMap::new();
    let mut base: u32 = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let body = line
            .strip_prefix(':')
            .ok_or_else(|| hex_error(line_no, "missing ':' start code"))?;
        let bytes = hex::decode(body).map_err(|e| hex_error(line_no, e.to_string()))?;
        if bytes.len() < 5 {
            return Err(hex_error(line_no, "record too short"));
        }
        let checksum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if checksum != 0 {
            return Err(hex_error(line_no, "checksum mismatch"));
        }

        let mut cursor = Cursor::new(&bytes[..]);
        let count = cursor.read_u8().map_err(|e| hex_error(line_no, e.to_string()))? as usize;
        let offset = cursor
            .read_u16::<BigEndian>()
            .map_err(|e| hex_error(line_no, e.to_string()))?;
        let record_type = cursor.read_u8().map_err(|e| hex_error(line_no, e.to_string()))?;
        if bytes.len() != count + 5 {
            return Err(hex_error(line_no, "byte count does not match record length"));
        }
        let data = &bytes[4..4 + count];

        match record_type {
            0x00 => {
                let addr = base as u64 + offset as u64;
                if addr + count as u64 > ADDRESS_SPACE {
                    return Err(hex_error(line_no, "data runs past the 4 GiB address space"));
                }
                map.insert(addr as u32, data);
            }
            0x01 => break,
            0x02 | 0x04 => {
                if count != 2 {
                    return Err(hex_error(line_no, "address record must hold 2 bytes"));
                }
                let value = Cursor::new(data)
                    .read_u16::<BigEndian>()
                    .map_err(|e| hex_error(line_no, e.to_string()))? as u32;
                base = if record_type == 0x02 { value << 4 } else { value << 16 };
            }
            // Start address records carry no flash contents.
            0x03 | 0x05 => {}
            other => {
                return Err(hex_error(line_no, format!("unknown record type {other:#04x}")));
            }
        }
    }
    Ok(map)
}

/// An opened firmware file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub fw_type: FwType,
    pub memory_map: MemoryMap,
}

impl FirmwareImage {
    /// Load an image; the format follows the file extension.
    pub fn load(path: impl AsRef<Path>, fw_type: FwType) -> Result<Self, FirmwareError> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read(&path).map_err(|source| FirmwareError::Io {
            path: path.clone(),
            source,
        })?;
        let memory_map = Self::parse(&path, &content)?;
        if memory_map.is_empty() {
            return Err(FirmwareError::Empty(path));
        }
        Ok(Self {
            path,
            fw_type,
            memory_map,
        })
    }

    fn parse(path: &Path, content: &[u8]) -> Result<MemoryMap, FirmwareError> {
        let is_hex = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("hex") || e.eq_ignore_ascii_case("ihex"));
        if is_hex {
            parse_intel_hex(&String::from_utf8_lossy(content))
        } else {
            let mut map = MemoryMap::new();
            map.insert(0, content);
            Ok(map)
        }
    }

    /// Flattened image payload.
    pub fn payload(&self) -> Vec<u8> {
        self.memory_map.to_contiguous()
    }
}

/// A file that could not be re-read.
#[derive(Debug)]
pub struct RefreshFailure {
    pub path: PathBuf,
    pub error: FirmwareError,
}

/// Set of opened firmware files.
#[derive(Debug, Default)]
pub struct FileStore {
    images: Vec<FirmwareImage>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file, replacing an earlier copy of the same path.
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub fn open_file(
        &mut self,
        path: impl AsRef<Path>,
        fw_type: FwType,
    ) -> Result<&FirmwareImage, FirmwareError> {
        let image = FirmwareImage::load(path, fw_type)?;
        info!(
            bytes = image.memory_map.total_len(),
            start = %format!("{:#X}", image.memory_map.start_address().unwrap_or(0)),
            "Opened firmware file"
        );
        let idx = match self.images.iter().position(|i| i.path == image.path) {
            Some(idx) => {
                self.images[idx] = image;
                idx
            }
            None => {
                self.images.push(image);
                self.images.len() - 1
            }
        };
        Ok(&self.images[idx])
    }

    pub fn remove_file(&mut self, path: impl AsRef<Path>) -> bool {
        let before = self.images.len();
        self.images.retain(|i| i.path != path.as_ref());
        self.images.len() != before
    }

    /// Re-read every opened file.
    ///
    /// Files that fail keep their previous contents and are reported.
    #[instrument(skip(self), fields(files = self.images.len()))]
    pub fn refresh_all_files(&mut self) -> Vec<RefreshFailure> {
        let mut failures = Vec::new();
        for image in &mut self.images {
            match FirmwareImage::load(&image.path, image.fw_type) {
                Ok(fresh) => *image = fresh,
                Err(error) => {
                    warn!(path = %image.path.display(), error = %error, "Failed to refresh file");
                    failures.push(RefreshFailure {
                        path: image.path.clone(),
                        error,
                    });
                }
            }
        }
        failures
    }

    pub fn images(&self) -> &[FirmwareImage] {
        &self.images
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINKY: &str = "\
:020000040000FA
:10100000000004202D1100003D1100003F110000E0
:04101000DEADBEEFA4
:020000040001F9
:02000000AA55FF
:00000001FF
";

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nrf-dfu-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_parse_intel_hex() {
        let map = parse_intel_hex(BLINKY).unwrap();
        let blocks: Vec<_> = map.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, 0x1000);
        assert_eq!(blocks[0].1.len(), 20);
        assert_eq!(&blocks[0].1[16..], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(blocks[1], (0x10000, &[0xAA, 0x55][..]));
        assert_eq!(map.total_len(), 22);
        assert_eq!(map.end_address(), Some(0x10002));
    }

    #[test]
    fn test_checksum_rejected() {
        let err = parse_intel_hex(":0400000001020304F0\n").unwrap_err();
        assert!(matches!(err, FirmwareError::Hex { line: 1, .. }));
    }

    #[test]
    fn test_missing_start_code() {
        assert!(parse_intel_hex("0400000001020304F2\n").is_err());
    }

    #[test]
    fn test_contiguous_fills_gaps() {
        let mut map = MemoryMap::new();
        map.insert(0x10, &[1, 2]);
        map.insert(0x14, &[3]);
        assert_eq!(map.to_contiguous(), vec![1, 2, 0xFF, 0xFF, 3]);
    }

    #[test]
    fn test_insert_merges_adjacent() {
        let mut map = MemoryMap::new();
        map.insert(4, &[2]);
        map.insert(0, &[0, 0, 0, 1]);
        assert_eq!(map.blocks().count(), 1);
        assert_eq!(map.to_contiguous(), vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_overlapping_records_overwrite() {
        let text = "\
:10000000000102030405060708090A0B0C0D0E0F78
:020004000102F7
:00000001FF
";
        let map = parse_intel_hex(text).unwrap();
        assert_eq!(map.blocks().count(), 1);
        assert_eq!(map.end_address(), Some(16));
        assert_eq!(
            map.to_contiguous(),
            vec![0, 1, 2, 3, 1, 2, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
    }

    #[test]
    fn test_insert_spanning_blocks() {
        let mut map = MemoryMap::new();
        map.insert(0, &[1, 1]);
        map.insert(4, &[2, 2]);
        map.insert(8, &[3]);
        map.insert(1, &[9; 5]);
        assert_eq!(map.blocks().count(), 2);
        assert_eq!(map.start_address(), Some(0));
        assert_eq!(map.end_address(), Some(9));
        assert_eq!(map.to_contiguous(), vec![1, 9, 9, 9, 9, 9, 0xFF, 0xFF, 3]);
    }

    #[test]
    fn test_end_of_address_space() {
        let mut map = MemoryMap::new();
        map.insert(0xFFFF_FFF0, &[0xAA; 32]);
        assert_eq!(map.total_len(), 16);
        assert_eq!(map.end_address(), Some(1 << 32));
        assert_eq!(map.to_contiguous().len(), 16);

        let text = ":02000004FFFFFC\n:10FFF80000000000000000000000000000000000F9\n";
        assert!(matches!(
            parse_intel_hex(text),
            Err(FirmwareError::Hex { line: 2, .. })
        ));
    }

    #[test]
    fn test_file_store_refresh() {
        let path = temp_path("app.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let mut store = FileStore::new();
        store.open_file(&path, FwType::Application).unwrap();
        assert_eq!(store.images()[0].payload(), vec![1, 2, 3]);

        std::fs::write(&path, [9u8, 9]).unwrap();
        assert!(store.refresh_all_files().is_empty());
        assert_eq!(store.images()[0].payload(), vec![9, 9]);

        std::fs::remove_file(&path).unwrap();
        let failures = store.refresh_all_files();
        assert_eq!(failures.len(), 1);
        assert_eq!(store.images()[0].payload(), vec![9, 9]);

        assert!(store.remove_file(&path));
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_reopen_replaces() {
        let path = temp_path("twice.hex");
        std::fs::write(&path, BLINKY).unwrap();

        let mut store = FileStore::new();
        store.open_file(&path, FwType::Application).unwrap();
        store.open_file(&path, FwType::Application).unwrap();
        assert_eq!(store.images().len(), 1);
        std::fs::remove_file(&path).unwrap();
    }
}
