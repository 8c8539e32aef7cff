//! Device Definition Registry.
//!
//! Static capability table of the supported targets, looked up by the
//! hardware id a device reports in bootloader mode.

use std::sync::{Arc, LazyLock};

use serde::Serialize;

/// One hardware variant.
///
/// Sizes are in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDefinition {
    pub family: &'static str,
    /// Hardware id match key, e.g. `nRF52840`.
    pub device_type: &'static str,
    pub name: &'static str,
    pub rom_size: u32,
    pub rom_base_addr: u32,
    pub ram_size: u32,
    pub page_size: u32,
    pub block_size: u32,
    /// Factory information configuration registers.
    pub ficr_base_addr: u32,
    /// User information configuration registers.
    pub uicr_base_addr: u32,
    /// UICR word holding the bootloader start address.
    pub bl_addr_base_addr: u32,
}

impl DeviceDefinition {
    /// Whether `addr` falls inside the on-chip flash.
    pub fn contains_address(&self, addr: u32) -> bool {
        addr >= self.rom_base_addr && (addr - self.rom_base_addr) < self.rom_size
    }

    /// Numeric hardware generation, taken from the family name (`nRF52` -> 52).
    pub fn hw_generation(&self) -> Option<u32> {
        let digits: String = self
            .family
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }
}

const BUILTIN_DEFINITIONS: &[DeviceDefinition] = &[DeviceDefinition {
    family: "nRF52",
    device_type: "nRF52840",
    name: "Graviton",
    rom_size: 0x100000,   // 1 MB
    rom_base_addr: 0x0,
    ram_size: 0x40000,    // 256 KB
    page_size: 0x1000,    // 4 KB
    block_size: 0x200,    // 512 B
    ficr_base_addr: 0x10000000,
    uicr_base_addr: 0x10001000,
    bl_addr_base_addr: 0x10001014,
}];

static BUILTIN: LazyLock<Arc<DeviceRegistry>> =
    LazyLock::new(|| Arc::new(DeviceRegistry::new(BUILTIN_DEFINITIONS.to_vec())));

/// Read-only table of device definitions.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    definitions: Vec<DeviceDefinition>,
}

impl DeviceRegistry {
    pub fn new(definitions: Vec<DeviceDefinition>) -> Self {
        Self { definitions }
    }

    /// The built-in table, shared by every session.
    pub fn builtin() -> Arc<DeviceRegistry> {
        BUILTIN.clone()
    }

    /// Find the first definition whose type contains `hardware_id`.
    ///
    /// Registration order breaks ties. No match is not an error.
    pub fn lookup(&self, hardware_id: &str) -> Option<&DeviceDefinition> {
        if hardware_id.is_empty() {
            return None;
        }
        let found = self
            .definitions
            .iter()
            .find(|d| d.device_type.contains(hardware_id));
        tracing::debug!(hardware_id, found = ?found.map(|d| d.device_type), "Device definition lookup");
        found
    }

    pub fn definitions(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
