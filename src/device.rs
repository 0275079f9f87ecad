//! Device identity and the open/exclusivity protocol.
//!
//! Device categories are a closed set ([`Device`]); platform quirks are
//! probed through [`ImplementationDetail`] set membership rather than a
//! type hierarchy, so a new quirk is a new tag, not a new type.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ble::BleDevice;
use crate::config::OpenConfiguration;
use crate::error::Result;
use crate::hid::HidDevice;
use crate::serial::SerialDevice;
use crate::stream::{Channel, StreamShared};

/// Opaque markers describing how a device is backed on this platform.
///
/// A device matches any number of tags (e.g. both `Linux` and `HidrawApi`);
/// probing is a set query, widened by each backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImplementationDetail {
    Linux,
    MacOs,
    Windows,
    HidDevice,
    SerialDevice,
    BleDevice,
    /// Backed by the Linux hidraw API.
    HidrawApi,
    /// Backed by the in-memory loopback backend.
    Loopback,
}

/// A discovered peripheral: closed set of category variants sharing the
/// identity and capability surface.
#[derive(Clone)]
pub enum Device {
    Hid(HidDevice),
    Serial(SerialDevice),
    Ble(BleDevice),
}

impl Device {
    /// The operating system's name for the device. Stable identity key,
    /// unique within a manager; useful for telling apart devices that share
    /// VID/PID/serial.
    pub fn device_path(&self) -> &str {
        match self {
            Device::Hid(d) => d.device_path(),
            Device::Serial(d) => d.device_path(),
            Device::Ble(d) => d.device_path(),
        }
    }

    /// File system path backing the device node, when one exists. BLE
    /// peripherals have no node.
    pub fn file_system_name(&self) -> Option<&str> {
        match self {
            Device::Hid(d) => Some(d.file_system_name()),
            Device::Serial(d) => Some(d.file_system_name()),
            Device::Ble(_) => None,
        }
    }

    /// A name appropriate for display.
    pub fn friendly_name(&self) -> String {
        match self {
            Device::Hid(d) => d.friendly_name(),
            Device::Serial(d) => d.friendly_name(),
            Device::Ble(d) => d.friendly_name(),
        }
    }

    /// Checks whether an implementation detail applies to this device.
    pub fn has_implementation_detail(&self, detail: ImplementationDetail) -> bool {
        match self {
            Device::Hid(d) => d.has_implementation_detail(detail),
            Device::Serial(d) => d.has_implementation_detail(detail),
            Device::Ble(d) => d.has_implementation_detail(detail),
        }
    }

    pub fn as_hid(&self) -> Option<&HidDevice> {
        match self {
            Device::Hid(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_serial(&self) -> Option<&SerialDevice> {
        match self {
            Device::Serial(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_ble(&self) -> Option<&BleDevice> {
        match self {
            Device::Ble(d) => Some(d),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Hid(d) => write!(f, "{d}"),
            Device::Serial(d) => write!(f, "{}", d.device_path()),
            Device::Ble(d) => write!(f, "{}", d.friendly_name()),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_path", &self.device_path())
            .finish()
    }
}

/// Opens a backend channel under the open/exclusivity/interrupt protocol.
///
/// Steps: resolve options; acquire the cross-process exclusion when asked
/// (bounded, never an indefinite wait); open the raw channel, releasing the
/// exclusion on partial failure so no lock leaks; wire the close hook and
/// interrupt forwarding; finally mark the stream open.
pub(crate) fn open_restricted(
    stream_path: &str,
    config: &OpenConfiguration,
    open_channel: impl FnOnce() -> Result<Box<dyn Channel>>,
) -> Result<Arc<StreamShared>> {
    let opts = config.resolve()?;

    #[cfg(target_os = "linux")]
    let guard = if opts.exclusive {
        Some(Arc::new(crate::exclusive::DeviceOpenGuard::acquire(
            stream_path,
            opts.lock_timeout,
            opts.interruptible,
        )?))
    } else {
        None
    };
    #[cfg(not(target_os = "linux"))]
    if opts.exclusive {
        return Err(crate::error::DeviceError::NotSupported);
    }

    let channel = match open_channel() {
        Ok(channel) => channel,
        Err(e) => {
            debug!(stream_path, error = %e, "backend open failed");
            #[cfg(target_os = "linux")]
            if let Some(guard) = &guard {
                guard.release();
            }
            return Err(e);
        }
    };

    let shared = StreamShared::open(channel);
    #[cfg(target_os = "linux")]
    if let Some(guard) = guard {
        let on_close = Arc::clone(&guard);
        shared.on_close(Box::new(move || on_close.release()));
        if opts.interruptible {
            let weak = Arc::downgrade(&shared);
            guard.watch(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.interrupt();
                }
            }));
        }
        // The close hook and monitor thread now keep the guard alive.
    }

    Ok(shared)
}
