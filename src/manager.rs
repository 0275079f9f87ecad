//! Platform device managers and the process-wide device registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::ble::BleDevice;
use crate::device::Device;
use crate::error::Result;
use crate::hid::HidDevice;
use crate::serial::SerialDevice;

/// Opaque per-device enumeration key. Only its owning manager can
/// interpret it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn new(raw: impl Into<String>) -> DeviceKey {
        DeviceKey(raw.into())
    }

    pub(crate) fn raw(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A platform backend: enumerates present devices and turns keys into
/// fully-populated device instances.
///
/// Enumeration queries the OS fresh on every call; caching happens one
/// level up, in [`DeviceList`]. `try_create_*` must never return a
/// partially populated device: if a required identity field is missing,
/// creation fails and the device is treated as not present.
pub trait DeviceManager: Send + Sync {
    /// One-shot platform gate (OS, minimum version); evaluated once per
    /// process by callers that care.
    fn is_supported(&self) -> bool;

    fn friendly_name(&self) -> &str;

    fn hid_device_keys(&self) -> Vec<DeviceKey>;
    fn serial_device_keys(&self) -> Vec<DeviceKey>;
    fn ble_device_keys(&self) -> Vec<DeviceKey>;

    fn try_create_hid_device(&self, key: &DeviceKey) -> Option<HidDevice>;
    fn try_create_serial_device(&self, key: &DeviceKey) -> Option<SerialDevice>;
    fn try_create_ble_device(&self, key: &DeviceKey) -> Option<BleDevice>;

    /// Starts the long-lived hotplug watcher. `on_change` is invoked on a
    /// watcher-owned thread; it must only raise the changed signal, not
    /// enumerate. The watcher lives for the rest of the process.
    fn watch(&self, on_change: Box<dyn Fn() + Send>) -> Result<()>;
}

/// Reacts to "device list changed" signals.
pub trait ChangeListener: Send {
    fn on_device_list_changed(&mut self);
}

impl<F: FnMut() + Send> ChangeListener for F {
    fn on_device_list_changed(&mut self) {
        self()
    }
}

/// Registry of currently known devices for one manager.
///
/// The list is rebuilt lazily: a change signal only marks it dirty, and the
/// next [`DeviceList::devices`] call re-enumerates. Use
/// [`DeviceList::local`] for the process-wide registry over the platform
/// backend, or [`DeviceList::new`] for an isolated instance (tests).
// Each listener sits behind its own mutex so dispatch can run callbacks
// without holding the table lock; callbacks may then add, remove, or
// re-signal without deadlocking the signalling thread.
type SharedListener = Arc<Mutex<Box<dyn ChangeListener>>>;

pub struct DeviceList {
    manager: Arc<dyn DeviceManager>,
    dirty: AtomicBool,
    cache: Mutex<Vec<Device>>,
    listeners: Mutex<HashMap<u64, SharedListener>>,
    next_listener_id: AtomicU64,
}

impl DeviceList {
    /// Builds an isolated registry over `manager`.
    pub fn new(manager: Arc<dyn DeviceManager>) -> DeviceList {
        DeviceList {
            manager,
            dirty: AtomicBool::new(true),
            cache: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// The process-wide registry over the local platform backend. First
    /// access constructs it and starts the hotplug watcher.
    pub fn local() -> &'static DeviceList {
        static LOCAL: OnceLock<DeviceList> = OnceLock::new();
        LOCAL.get_or_init(|| {
            let manager = crate::backends::local_manager();
            let list = DeviceList::new(Arc::clone(&manager));
            if let Err(e) = manager.watch(Box::new(|| DeviceList::local().raise_changed())) {
                debug!("hotplug watcher unavailable: {e}");
            }
            list
        })
    }

    pub fn manager(&self) -> &Arc<dyn DeviceManager> {
        &self.manager
    }

    /// All currently known devices, re-enumerating first if a change signal
    /// arrived since the last call.
    pub fn devices(&self) -> Vec<Device> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            let fresh = self.enumerate();
            trace!(count = fresh.len(), "device list rebuilt");
            *self.cache.lock() = fresh;
        }
        self.cache.lock().clone()
    }

    pub fn hid_devices(&self) -> Vec<HidDevice> {
        self.devices()
            .into_iter()
            .filter_map(|d| match d {
                Device::Hid(hid) => Some(hid),
                _ => None,
            })
            .collect()
    }

    pub fn serial_devices(&self) -> Vec<SerialDevice> {
        self.devices()
            .into_iter()
            .filter_map(|d| match d {
                Device::Serial(serial) => Some(serial),
                _ => None,
            })
            .collect()
    }

    pub fn ble_devices(&self) -> Vec<BleDevice> {
        self.devices()
            .into_iter()
            .filter_map(|d| match d {
                Device::Ble(ble) => Some(ble),
                _ => None,
            })
            .collect()
    }

    /// Marks the list dirty and notifies listeners. Called by the watcher;
    /// also useful from tests.
    ///
    /// Callbacks run outside the listener-table lock, so a callback may
    /// unregister itself or raise the signal again. A listener that is
    /// already mid-callback (a reentrant raise from its own body) is
    /// skipped; the dirty flag is set before dispatch either way.
    pub fn raise_changed(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        let snapshot: Vec<SharedListener> = self.listeners.lock().values().cloned().collect();
        for listener in snapshot {
            if let Some(mut listener) = listener.try_lock() {
                listener.on_device_list_changed();
            }
        }
    }

    /// Registers a listener; returns an id for [`DeviceList::remove_listener`].
    pub fn add_listener(&self, listener: impl ChangeListener + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .insert(id, Arc::new(Mutex::new(Box::new(listener))));
        id
    }

    /// Unregisters a listener entirely.
    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }

    fn enumerate(&self) -> Vec<Device> {
        let mut devices = Vec::new();
        for key in self.manager.hid_device_keys() {
            // Enrichment failure means "not present", never an error.
            if let Some(hid) = self.manager.try_create_hid_device(&key) {
                devices.push(Device::Hid(hid));
            } else {
                trace!(%key, "skipping HID key that failed to enrich");
            }
        }
        for key in self.manager.serial_device_keys() {
            if let Some(serial) = self.manager.try_create_serial_device(&key) {
                devices.push(Device::Serial(serial));
            }
        }
        for key in self.manager.ble_device_keys() {
            if let Some(ble) = self.manager.try_create_ble_device(&key) {
                devices.push(Device::Ble(ble));
            }
        }
        devices
    }
}
