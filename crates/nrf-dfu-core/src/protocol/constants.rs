//! Protocol constants for the Nordic secure DFU bootloader.
//!
//! Derived from the `dfu-cc.proto` control-command schema and the
//! USB descriptors exposed by the SDFU bootloader.

// ============================================================================
// Device Identification
// ============================================================================

/// Nordic Semiconductor ASA Vendor ID
pub const NORDIC_VENDOR_ID: u16 = 0x1915;

/// Manufacturer string reported by a target in bootloader mode
pub const BOOTLOADER_MANUFACTURER: &str = "Nordic Semiconductor";

/// Substring of the product string reported by a target in bootloader mode
pub const BOOTLOADER_PRODUCT_TAG: &str = "USB SDFU";

/// Default serial link speed of the DFU bootloader
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Schema
// ============================================================================

/// Protobuf package of the control-command schema
pub const SCHEMA_PACKAGE: &str = "dfu";

/// Version tag of the embedded control-command schema
pub const SCHEMA_VERSION: &str = "dfu-cc/1";

// ============================================================================
// Init Command Defaults
// ============================================================================

/// Firmware version written when none is supplied
pub const DEFAULT_FW_VERSION: u32 = 0;

/// SoftDevice requirement meaning "any SoftDevice, or none"
pub const SD_REQ_ANY: u32 = 0xFFFE;

/// SoftDevice requirement meaning "no SoftDevice present"
pub const SD_REQ_NONE: u32 = 0x0000;

// ============================================================================
// Session Defaults
// ============================================================================

/// Default per-call transport timeout (ms)
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;

/// Fallback flash page size when neither device nor registry reports one
pub const DEFAULT_PAGE_SIZE: u32 = 0x1000; // 4 KB

/// Fill byte for gaps in a firmware memory map
pub const FLASH_ERASED_BYTE: u8 = 0xFF;
