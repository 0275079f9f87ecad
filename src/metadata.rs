//! Device metadata snapshot.
//!
//! [`DeviceMeta`] is a lightweight, cloneable description of a device
//! suitable for UI display, logging, and persistence. Backends populate
//! what they know; unknown fields remain `None`.
//!
//! ## Persistence notes
//! - `vid`/`pid` and `serial_number` (when present) are generally stable and
//!   useful for re-identification.
//! - `path` is platform-specific and may change across ports, drivers, and
//!   reconnects; treat it as diagnostic first, identity second.

use serde::{Deserialize, Serialize};

use crate::device::Device;

/// High-level device category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceCategory {
    Hid,
    Serial,
    Ble,
}

/// Snapshot of metadata describing a single device.
///
/// All fields except `category` and `path` are optional; backends populate
/// what is known on the current platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceMeta {
    /// Device category.
    pub category: DeviceCategory,

    /// OS path to the device (opaque; platform-specific format).
    pub path: String,

    /// USB Vendor ID (VID), if known.
    pub vid: Option<u16>,

    /// USB Product ID (PID), if known.
    pub pid: Option<u16>,

    /// Device release number in binary-coded decimal, if known.
    pub release_bcd: Option<u16>,

    /// Manufacturer name from the driver/firmware.
    pub manufacturer: Option<String>,

    /// Human-readable product name from the driver/firmware.
    pub product_string: Option<String>,

    /// Device serial number supplied by firmware/OS, if present.
    pub serial_number: Option<String>,
}

impl DeviceMeta {
    /// Captures a snapshot of `device`. Metadata lookups that fail are
    /// recorded as `None` rather than failing the snapshot.
    pub fn of(device: &Device) -> DeviceMeta {
        match device {
            Device::Hid(hid) => DeviceMeta {
                category: DeviceCategory::Hid,
                path: hid.device_path().to_string(),
                vid: Some(hid.vendor_id()),
                pid: Some(hid.product_id()),
                release_bcd: Some(hid.release_bcd()),
                manufacturer: hid.manufacturer().ok(),
                product_string: hid.product_name().ok(),
                serial_number: hid.serial_number().ok(),
            },
            Device::Serial(serial) => DeviceMeta {
                category: DeviceCategory::Serial,
                path: serial.device_path().to_string(),
                vid: None,
                pid: None,
                release_bcd: None,
                manufacturer: None,
                product_string: None,
                serial_number: None,
            },
            Device::Ble(ble) => DeviceMeta {
                category: DeviceCategory::Ble,
                path: ble.device_path().to_string(),
                vid: None,
                pid: None,
                release_bcd: None,
                manufacturer: None,
                product_string: Some(ble.friendly_name()),
                serial_number: None,
            },
        }
    }
}
