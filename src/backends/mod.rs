//! Platform backends.
//!
//! Each backend owns one way of reaching devices and plugs in through the
//! [`crate::manager::DeviceManager`] trait. `loopback` is an in-memory
//! backend for exercising the stream and registry machinery without
//! hardware.

pub mod loopback;

#[cfg(target_os = "linux")]
pub mod linux;

use std::sync::Arc;

use crate::manager::DeviceManager;

/// The device manager for the running platform.
#[cfg(target_os = "linux")]
pub fn local_manager() -> Arc<dyn DeviceManager> {
    Arc::new(linux::LinuxDeviceManager::new())
}

#[cfg(not(target_os = "linux"))]
pub fn local_manager() -> Arc<dyn DeviceManager> {
    Arc::new(unsupported::UnsupportedManager)
}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use crate::ble::BleDevice;
    use crate::error::{DeviceError, Result};
    use crate::hid::HidDevice;
    use crate::manager::{DeviceKey, DeviceManager};
    use crate::serial::SerialDevice;

    /// Placeholder manager for platforms without a native backend yet.
    pub struct UnsupportedManager;

    impl DeviceManager for UnsupportedManager {
        fn is_supported(&self) -> bool {
            false
        }

        fn friendly_name(&self) -> &str {
            "unsupported platform"
        }

        fn hid_device_keys(&self) -> Vec<DeviceKey> {
            Vec::new()
        }

        fn serial_device_keys(&self) -> Vec<DeviceKey> {
            Vec::new()
        }

        fn ble_device_keys(&self) -> Vec<DeviceKey> {
            Vec::new()
        }

        fn try_create_hid_device(&self, _key: &DeviceKey) -> Option<HidDevice> {
            None
        }

        fn try_create_serial_device(&self, _key: &DeviceKey) -> Option<SerialDevice> {
            None
        }

        fn try_create_ble_device(&self, _key: &DeviceKey) -> Option<BleDevice> {
            None
        }

        fn watch(&self, _on_change: Box<dyn Fn() + Send>) -> Result<()> {
            Err(DeviceError::NotSupported)
        }
    }
}
