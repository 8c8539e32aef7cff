//! USB enumeration and bootloader-mode detection using nusb.
//!
//! The DFU bootloader identifies itself through its manufacturer and
//! product string descriptors. Reading them requires opening the device;
//! the handle is dropped on every path before returning.

use std::num::NonZeroU8;
use std::time::Duration;

use nusb::{MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::TransportError;
use crate::protocol::constants::{BOOTLOADER_MANUFACTURER, BOOTLOADER_PRODUCT_TAG, NORDIC_VENDOR_ID};

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(500);

/// A Nordic device found in bootloader mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: String,
    pub product: String,
}

/// Whether the descriptor strings belong to the DFU bootloader.
pub fn is_bootloader_descriptor(manufacturer: &str, product: &str) -> bool {
    manufacturer == BOOTLOADER_MANUFACTURER && product.contains(BOOTLOADER_PRODUCT_TAG)
}

fn read_string(device: &nusb::Device, index: Option<NonZeroU8>) -> Result<String, TransportError> {
    let index = index.ok_or_else(|| TransportError::Usb("missing string descriptor".into()))?;
    let language = device
        .get_string_descriptor_supported_languages(DESCRIPTOR_TIMEOUT)
        .wait()
        .map_err(|e| TransportError::Usb(e.to_string()))?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);
    device
        .get_string_descriptor(index, language, DESCRIPTOR_TIMEOUT)
        .wait()
        .map_err(|e| TransportError::Usb(e.to_string()))
}

/// Read manufacturer and product strings of an opened device.
fn read_identity(device_info: &nusb::DeviceInfo) -> Result<(String, String), TransportError> {
    let device = device_info
        .open()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
    let descriptor = device.device_descriptor();
    let manufacturer = read_string(&device, descriptor.manufacturer_string_index())?;
    let product = read_string(&device, descriptor.product_string_index())?;
    Ok((manufacturer, product))
}

/// Check whether the USB device with `serial_number` runs the bootloader.
#[instrument(level = "debug")]
pub fn check_bootloader_mode(serial_number: &str) -> Result<bool, TransportError> {
    let device_info = list_devices()
        .wait()
        .map_err(|e| TransportError::Usb(e.to_string()))?
        .find(|d| d.serial_number() == Some(serial_number))
        .ok_or_else(|| TransportError::OpenFailed(format!("no USB device {serial_number}")))?;

    let (manufacturer, product) = read_identity(&device_info)?;
    let bootloader = is_bootloader_descriptor(&manufacturer, &product);
    debug!(%manufacturer, %product, bootloader, "Read USB identity");
    Ok(bootloader)
}

/// Enumerate Nordic devices currently in bootloader mode.
#[instrument(level = "info")]
pub fn list_bootloaders() -> Result<Vec<BootloaderDevice>, TransportError> {
    let devices = list_devices()
        .wait()
        .map_err(|e| TransportError::Usb(e.to_string()))?;

    let mut found = Vec::new();
    for device_info in devices.filter(|d| d.vendor_id() == NORDIC_VENDOR_ID) {
        let (manufacturer, product) = match read_identity(&device_info) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable device");
                continue;
            }
        };
        if !is_bootloader_descriptor(&manufacturer, &product) {
            continue;
        }
        info!(
            vendor_id = %format!("{:04X}", device_info.vendor_id()),
            product_id = %format!("{:04X}", device_info.product_id()),
            "Found bootloader"
        );
        found.push(BootloaderDevice {
            vendor_id: device_info.vendor_id(),
            product_id: device_info.product_id(),
            serial_number: device_info.serial_number().unwrap_or_default().to_string(),
            product,
        });
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootloader_descriptor() {
        assert!(is_bootloader_descriptor(
            "Nordic Semiconductor",
            "Open DFU Bootloader USB SDFU"
        ));
        assert!(!is_bootloader_descriptor("Nordic Semiconductor", "J-Link"));
        assert!(!is_bootloader_descriptor("Acme", "USB SDFU"));
    }
}
