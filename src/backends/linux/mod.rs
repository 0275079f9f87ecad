//! Linux backend: hidraw enumeration through hidapi, tty serial ports,
//! and a /dev inotify watcher for hotplug signals.

mod fd;
mod hid;
mod serial;

use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use hidapi::HidApi;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::ble::BleDevice;
use crate::error::{DeviceError, Result};
use crate::hid::{HidBackend, HidDevice};
use crate::manager::{DeviceKey, DeviceManager};
use crate::serial::{SerialBackend, SerialDevice};

use self::hid::LinuxHidBackend;
use self::serial::LinuxSerialBackend;

/// Drops duplicate keys wherever they appear, keeping first-seen order.
fn unique_keys(keys: impl IntoIterator<Item = DeviceKey>) -> Vec<DeviceKey> {
    let mut seen = std::collections::HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

pub struct LinuxDeviceManager {
    api: Mutex<Option<HidApi>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl LinuxDeviceManager {
    pub fn new() -> LinuxDeviceManager {
        LinuxDeviceManager {
            api: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// Runs `f` against the shared hidapi context, creating it on first use.
    fn with_api<T>(&self, f: impl FnOnce(&mut HidApi) -> Result<T>) -> Result<T> {
        let mut slot = self.api.lock();
        if slot.is_none() {
            *slot = Some(HidApi::new()?);
        }
        match slot.as_mut() {
            Some(api) => f(api),
            None => Err(DeviceError::NotSupported),
        }
    }
}

impl Default for LinuxDeviceManager {
    fn default() -> Self {
        LinuxDeviceManager::new()
    }
}

impl DeviceManager for LinuxDeviceManager {
    fn is_supported(&self) -> bool {
        static SUPPORTED: OnceLock<bool> = OnceLock::new();
        *SUPPORTED.get_or_init(|| Path::new("/sys/class/hidraw").exists())
    }

    fn friendly_name(&self) -> &str {
        "Linux hidraw"
    }

    fn hid_device_keys(&self) -> Vec<DeviceKey> {
        let keys = self.with_api(|api| {
            api.refresh_devices()?;
            // hidapi lists one entry per usage on some devices, with no
            // ordering guarantee between them.
            Ok(unique_keys(
                api.device_list()
                    .filter_map(|info| info.path().to_str().ok())
                    .map(DeviceKey::new),
            ))
        });
        match keys {
            Ok(keys) => keys,
            Err(e) => {
                debug!("hidraw enumeration failed: {e}");
                Vec::new()
            }
        }
    }

    fn serial_device_keys(&self) -> Vec<DeviceKey> {
        let entries = match std::fs::read_dir("/dev") {
            Ok(entries) => entries,
            Err(e) => {
                debug!("/dev enumeration failed: {e}");
                return Vec::new();
            }
        };
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("ttyUSB") || name.starts_with("ttyACM") {
                keys.push(DeviceKey::new(format!("/dev/{name}")));
            }
        }
        keys.sort_by(|a, b| a.raw().cmp(b.raw()));
        keys
    }

    fn ble_device_keys(&self) -> Vec<DeviceKey> {
        // No BLE transport on this backend yet.
        Vec::new()
    }

    fn try_create_hid_device(&self, key: &DeviceKey) -> Option<HidDevice> {
        let backend = self
            .with_api(|api| {
                let info = api
                    .device_list()
                    .find(|info| info.path().to_str() == Ok(key.raw()))
                    .ok_or(DeviceError::NotSupported)?;
                Ok(LinuxHidBackend::new(
                    key.raw().to_string(),
                    info.vendor_id(),
                    info.product_id(),
                    info.release_number(),
                    info.manufacturer_string().map(str::to_string),
                    info.product_string().map(str::to_string),
                    info.serial_number().map(str::to_string),
                ))
            })
            .ok()?;
        Some(HidDevice::new(Arc::new(backend) as Arc<dyn HidBackend>))
    }

    fn try_create_serial_device(&self, key: &DeviceKey) -> Option<SerialDevice> {
        if !Path::new(key.raw()).exists() {
            return None;
        }
        let backend = LinuxSerialBackend::new(key.raw());
        Some(SerialDevice::new(Arc::new(backend) as Arc<dyn SerialBackend>))
    }

    fn try_create_ble_device(&self, _key: &DeviceKey) -> Option<BleDevice> {
        None
    }

    fn watch(&self, on_change: Box<dyn Fn() + Send>) -> Result<()> {
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            let relevant = event.paths.iter().any(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("hidraw") || n.starts_with("tty"))
            });
            if relevant {
                trace!(?event.kind, "device node change");
                on_change();
            }
        })
        .map_err(|e| DeviceError::Io(e.to_string()))?;
        watcher
            .watch(Path::new("/dev"), RecursiveMode::NonRecursive)
            .map_err(|e| DeviceError::Io(e.to_string()))?;
        // Watcher runs for the rest of the process.
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_keys_drops_non_adjacent_duplicates() {
        let keys = vec![
            DeviceKey::new("/dev/hidraw0"),
            DeviceKey::new("/dev/hidraw1"),
            DeviceKey::new("/dev/hidraw0"),
            DeviceKey::new("/dev/hidraw2"),
            DeviceKey::new("/dev/hidraw1"),
        ];
        let unique = unique_keys(keys);
        assert_eq!(
            unique,
            vec![
                DeviceKey::new("/dev/hidraw0"),
                DeviceKey::new("/dev/hidraw1"),
                DeviceKey::new("/dev/hidraw2"),
            ]
        );
    }
}
