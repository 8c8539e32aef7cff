//! Version and capability records reported by a connected target.

use std::fmt;

use crate::device::{DeviceDefinition, DeviceRegistry};
use crate::protocol::constants::DEFAULT_PAGE_SIZE;

/// Memory figures a device reports about itself. Any of them may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub rom_size: Option<u32>,
    pub ram_size: Option<u32>,
    pub rom_page_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareVersion {
    /// Part number, e.g. `0x52840`.
    pub part: u32,
    pub variant: u32,
    pub memory: MemoryInfo,
}

impl HardwareVersion {
    /// Part number as lowercase hex, the registry lookup key.
    pub fn hardware_id(&self) -> String {
        format!("{:x}", self.part)
    }
}

/// Kind of image slot reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareImageType {
    Softdevice,
    Application,
    Bootloader,
    Unknown(u8),
}

impl From<u8> for FirmwareImageType {
    fn from(value: u8) -> Self {
        match value {
            0 => FirmwareImageType::Softdevice,
            1 => FirmwareImageType::Application,
            2 => FirmwareImageType::Bootloader,
            other => FirmwareImageType::Unknown(other),
        }
    }
}

impl fmt::Display for FirmwareImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareImageType::Softdevice => write!(f, "SoftDevice"),
            FirmwareImageType::Application => write!(f, "Application"),
            FirmwareImageType::Bootloader => write!(f, "Bootloader"),
            FirmwareImageType::Unknown(v) => write!(f, "Unknown({v})"),
        }
    }
}

/// One installed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub image_type: FirmwareImageType,
    pub version: u32,
    pub addr: u32,
    pub length: u32,
}

/// Everything the probe sequence learned about a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub protocol_version: u8,
    pub hardware_version: HardwareVersion,
    pub firmware_versions: Vec<FirmwareVersion>,
}

/// Resolved capability of a connected target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub hardware_id: String,
    pub rom_size: u32,
    pub page_size: u32,
    pub definition: Option<DeviceDefinition>,
}

impl Capability {
    /// Merge the registry entry with what the device reports.
    ///
    /// Device-reported values take precedence. Returns `None` when there is
    /// neither a registry entry nor a reported ROM size.
    pub fn resolve(registry: &DeviceRegistry, hardware: &HardwareVersion) -> Option<Self> {
        let hardware_id = hardware.hardware_id();
        let definition = registry.lookup(&hardware_id).cloned();

        let rom_size = hardware
            .memory
            .rom_size
            .or(definition.as_ref().map(|d| d.rom_size))?;
        let page_size = hardware
            .memory
            .rom_page_size
            .or(definition.as_ref().map(|d| d.page_size))
            .unwrap_or(DEFAULT_PAGE_SIZE);

        Some(Self {
            hardware_id,
            rom_size,
            page_size,
            definition,
        })
    }

    pub fn rom_base_addr(&self) -> u32 {
        self.definition.as_ref().map_or(0, |d| d.rom_base_addr)
    }

    /// Whether `[start, end)` fits inside the target flash.
    pub fn fits(&self, start: u32, end: u64) -> bool {
        let base = self.rom_base_addr() as u64;
        start as u64 >= base && end <= base + self.rom_size as u64
    }
}
