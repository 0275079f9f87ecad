//! In-memory loopback backend.
//!
//! Ports hold a byte queue instead of an OS handle, so the whole open,
//! read/write, interrupt, and enumeration machinery can be exercised
//! without hardware. Data fed into a port comes out of reads; writes are
//! captured for inspection, and optionally echoed back into the input
//! queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::ble::{BleBackend, BleDevice, BleService};
use crate::config::OpenConfiguration;
use crate::device::ImplementationDetail;
use crate::error::{DeviceError, Result};
use crate::hid::{HidBackend, HidDevice};
use crate::manager::{DeviceKey, DeviceManager};
use crate::serial::{SerialBackend, SerialChannel, SerialDevice, SerialSettings};
use crate::stream::Channel;

const DETAILS: &[ImplementationDetail] = &[ImplementationDetail::Loopback];

#[derive(Default)]
struct PortState {
    input: VecDeque<u8>,
    output: Vec<u8>,
    woken: bool,
    fail_open: bool,
    echo: bool,
    applied_settings: Option<SerialSettings>,
}

struct PortInner {
    state: Mutex<PortState>,
    readable: Condvar,
    free_count: AtomicUsize,
}

/// Shared byte-queue endpoint behind a loopback device.
///
/// The same port instance backs every channel opened on its device, so a
/// test can feed data before or after opening.
#[derive(Clone)]
pub struct LoopbackPort {
    inner: Arc<PortInner>,
}

impl LoopbackPort {
    pub fn new() -> LoopbackPort {
        LoopbackPort {
            inner: Arc::new(PortInner {
                state: Mutex::new(PortState::default()),
                readable: Condvar::new(),
                free_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Queues bytes for subsequent reads, waking any blocked reader.
    pub fn feed(&self, bytes: &[u8]) {
        let mut state = self.inner.state.lock();
        state.input.extend(bytes.iter().copied());
        drop(state);
        self.inner.readable.notify_all();
    }

    /// Everything written to the port so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.state.lock().output.clone()
    }

    /// When set, writes are also appended to the input queue.
    pub fn set_echo(&self, echo: bool) {
        self.inner.state.lock().echo = echo;
    }

    /// When set, subsequent channel opens fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.state.lock().fail_open = fail;
    }

    /// How many times a channel on this port has been freed.
    pub fn free_count(&self) -> usize {
        self.inner.free_count.load(Ordering::SeqCst)
    }

    /// The line settings most recently applied, if any.
    pub fn applied_settings(&self) -> Option<SerialSettings> {
        self.inner.state.lock().applied_settings
    }

    fn open_channel(&self) -> Result<LoopbackChannel> {
        if self.inner.state.lock().fail_open {
            return Err(DeviceError::Io("loopback port refused to open".into()));
        }
        Ok(LoopbackChannel {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl Default for LoopbackPort {
    fn default() -> Self {
        LoopbackPort::new()
    }
}

struct LoopbackChannel {
    inner: Arc<PortInner>,
}

impl Channel for LoopbackChannel {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.woken {
                state.woken = false;
                return Err(DeviceError::Interrupted);
            }
            if !state.input.is_empty() {
                let n = buf.len().min(state.input.len());
                for slot in buf.iter_mut().take(n) {
                    // n <= input.len() guards this pop.
                    *slot = state.input.pop_front().unwrap_or_default();
                }
                return Ok(n);
            }
            if self.inner.readable.wait_until(&mut state, deadline).timed_out() {
                return Err(DeviceError::Timeout);
            }
        }
    }

    fn write(&self, buf: &[u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.inner.state.lock();
        state.output.extend_from_slice(buf);
        if state.echo {
            state.input.extend(buf.iter().copied());
            drop(state);
            self.inner.readable.notify_all();
        }
        Ok(buf.len())
    }

    fn wake(&self) {
        self.inner.state.lock().woken = true;
        self.inner.readable.notify_all();
    }

    fn free(&self) {
        self.inner.free_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl SerialChannel for LoopbackChannel {
    fn apply_settings(&self, settings: &SerialSettings) -> Result<()> {
        self.inner.state.lock().applied_settings = Some(*settings);
        Ok(())
    }
}

/// Identity and metadata for a loopback HID device.
pub struct LoopbackHidBackend {
    path: String,
    port: LoopbackPort,
    pub vendor_id: u16,
    pub product_id: u16,
    pub release_bcd: u16,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub report_descriptor: Vec<u8>,
}

impl LoopbackHidBackend {
    pub fn new(path: impl Into<String>) -> LoopbackHidBackend {
        LoopbackHidBackend {
            path: path.into(),
            port: LoopbackPort::new(),
            vendor_id: 0x16C0,
            product_id: 0x0001,
            release_bcd: 0x0102,
            manufacturer: Some("Loopback Labs".into()),
            product_name: Some("Loopback HID".into()),
            serial_number: Some("LB-0001".into()),
            report_descriptor: Vec::new(),
        }
    }

    pub fn port(&self) -> &LoopbackPort {
        &self.port
    }
}

impl HidBackend for LoopbackHidBackend {
    fn device_path(&self) -> &str {
        &self.path
    }

    fn file_system_name(&self) -> &str {
        &self.path
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn release_bcd(&self) -> u16 {
        self.release_bcd
    }

    fn manufacturer(&self) -> Option<String> {
        self.manufacturer.clone()
    }

    fn product_name(&self) -> Option<String> {
        self.product_name.clone()
    }

    fn serial_number(&self) -> Option<String> {
        self.serial_number.clone()
    }

    fn raw_report_descriptor(&self) -> Result<Vec<u8>> {
        if self.report_descriptor.is_empty() {
            return Err(DeviceError::NotSupported);
        }
        Ok(self.report_descriptor.clone())
    }

    fn details(&self) -> &[ImplementationDetail] {
        DETAILS
    }

    fn open_channel(&self, _config: &OpenConfiguration) -> Result<Box<dyn Channel>> {
        Ok(Box::new(self.port.open_channel()?))
    }
}

/// Identity for a loopback serial port.
pub struct LoopbackSerialBackend {
    path: String,
    port: LoopbackPort,
}

impl LoopbackSerialBackend {
    pub fn new(path: impl Into<String>) -> LoopbackSerialBackend {
        LoopbackSerialBackend {
            path: path.into(),
            port: LoopbackPort::new(),
        }
    }

    pub fn port(&self) -> &LoopbackPort {
        &self.port
    }
}

impl SerialBackend for LoopbackSerialBackend {
    fn device_path(&self) -> &str {
        &self.path
    }

    fn file_system_name(&self) -> &str {
        &self.path
    }

    fn details(&self) -> &[ImplementationDetail] {
        DETAILS
    }

    fn open_channel(&self, _config: &OpenConfiguration) -> Result<Arc<dyn SerialChannel>> {
        Ok(Arc::new(self.port.open_channel()?))
    }
}

/// A loopback BLE peripheral with a fixed service table.
pub struct LoopbackBleBackend {
    path: String,
    name: String,
    pub services: Vec<BleService>,
}

impl LoopbackBleBackend {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> LoopbackBleBackend {
        LoopbackBleBackend {
            path: path.into(),
            name: name.into(),
            services: Vec::new(),
        }
    }
}

impl BleBackend for LoopbackBleBackend {
    fn device_path(&self) -> &str {
        &self.path
    }

    fn friendly_name(&self) -> String {
        self.name.clone()
    }

    fn services(&self) -> Result<Vec<BleService>> {
        Ok(self.services.clone())
    }

    fn details(&self) -> &[ImplementationDetail] {
        DETAILS
    }
}

struct Registered<B> {
    backend: Arc<B>,
    vanished: Arc<AtomicBool>,
}

/// Enumerates only the loopback devices registered on it.
#[derive(Default)]
pub struct LoopbackDeviceManager {
    hid: Mutex<Vec<Registered<LoopbackHidBackend>>>,
    serial: Mutex<Vec<Registered<LoopbackSerialBackend>>>,
    ble: Mutex<Vec<Registered<LoopbackBleBackend>>>,
    on_change: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl LoopbackDeviceManager {
    pub fn new() -> LoopbackDeviceManager {
        LoopbackDeviceManager::default()
    }

    /// Registers a HID device; the returned handle controls the vanish
    /// flag via [`LoopbackDeviceManager::set_vanished`].
    pub fn add_hid(&self, backend: LoopbackHidBackend) -> Arc<LoopbackHidBackend> {
        let backend = Arc::new(backend);
        self.hid.lock().push(Registered {
            backend: Arc::clone(&backend),
            vanished: Arc::new(AtomicBool::new(false)),
        });
        backend
    }

    pub fn add_serial(&self, backend: LoopbackSerialBackend) -> Arc<LoopbackSerialBackend> {
        let backend = Arc::new(backend);
        self.serial.lock().push(Registered {
            backend: Arc::clone(&backend),
            vanished: Arc::new(AtomicBool::new(false)),
        });
        backend
    }

    pub fn add_ble(&self, backend: LoopbackBleBackend) -> Arc<LoopbackBleBackend> {
        let backend = Arc::new(backend);
        self.ble.lock().push(Registered {
            backend: Arc::clone(&backend),
            vanished: Arc::new(AtomicBool::new(false)),
        });
        backend
    }

    /// Simulates unplugging (or replugging) the device at `path`.
    pub fn set_vanished(&self, path: &str, vanished: bool) {
        for entry in self.hid.lock().iter() {
            if entry.backend.device_path() == path {
                entry.vanished.store(vanished, Ordering::SeqCst);
            }
        }
        for entry in self.serial.lock().iter() {
            if entry.backend.device_path() == path {
                entry.vanished.store(vanished, Ordering::SeqCst);
            }
        }
        for entry in self.ble.lock().iter() {
            if entry.backend.device_path() == path {
                entry.vanished.store(vanished, Ordering::SeqCst);
            }
        }
    }

    /// Fires the watch callback, as a hotplug event would.
    pub fn trigger_change(&self) {
        if let Some(cb) = self.on_change.lock().as_ref() {
            cb();
        }
    }

    fn keys<B>(entries: &Mutex<Vec<Registered<B>>>, path: fn(&B) -> &str) -> Vec<DeviceKey> {
        entries
            .lock()
            .iter()
            .filter(|e| !e.vanished.load(Ordering::SeqCst))
            .map(|e| DeviceKey::new(path(&e.backend)))
            .collect()
    }

    fn lookup<B>(entries: &Mutex<Vec<Registered<B>>>, path: fn(&B) -> &str, key: &DeviceKey) -> Option<Arc<B>> {
        entries
            .lock()
            .iter()
            .find(|e| path(&e.backend) == key.raw() && !e.vanished.load(Ordering::SeqCst))
            .map(|e| Arc::clone(&e.backend))
    }
}

impl DeviceManager for LoopbackDeviceManager {
    fn is_supported(&self) -> bool {
        true
    }

    fn friendly_name(&self) -> &str {
        "loopback"
    }

    fn hid_device_keys(&self) -> Vec<DeviceKey> {
        Self::keys(&self.hid, |b| b.device_path())
    }

    fn serial_device_keys(&self) -> Vec<DeviceKey> {
        Self::keys(&self.serial, |b| b.device_path())
    }

    fn ble_device_keys(&self) -> Vec<DeviceKey> {
        Self::keys(&self.ble, |b| b.device_path())
    }

    fn try_create_hid_device(&self, key: &DeviceKey) -> Option<HidDevice> {
        Self::lookup(&self.hid, |b| b.device_path(), key)
            .map(|b| HidDevice::new(b as Arc<dyn HidBackend>))
    }

    fn try_create_serial_device(&self, key: &DeviceKey) -> Option<SerialDevice> {
        Self::lookup(&self.serial, |b| b.device_path(), key)
            .map(|b| SerialDevice::new(b as Arc<dyn SerialBackend>))
    }

    fn try_create_ble_device(&self, key: &DeviceKey) -> Option<BleDevice> {
        Self::lookup(&self.ble, |b| b.device_path(), key)
            .map(|b| BleDevice::new(b as Arc<dyn BleBackend>))
    }

    fn watch(&self, on_change: Box<dyn Fn() + Send>) -> Result<()> {
        *self.on_change.lock() = Some(on_change);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_read_returns_fed_bytes() {
        let port = LoopbackPort::new();
        port.feed(b"hello");
        let ch = port.open_channel().expect("open");
        let mut buf = [0u8; 3];
        let n = ch.read(&mut buf, Duration::from_millis(100)).expect("read");
        assert_eq!(&buf[..n], b"hel");
        let mut rest = [0u8; 8];
        let n = ch.read(&mut rest, Duration::from_millis(100)).expect("read");
        assert_eq!(&rest[..n], b"lo");
    }

    #[test]
    fn empty_port_read_times_out() {
        let port = LoopbackPort::new();
        let ch = port.open_channel().expect("open");
        let mut buf = [0u8; 4];
        let err = ch.read(&mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
    }

    #[test]
    fn wake_interrupts_without_consuming_data() {
        let port = LoopbackPort::new();
        let ch = port.open_channel().expect("open");
        ch.wake();
        let mut buf = [0u8; 4];
        let err = ch.read(&mut buf, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, DeviceError::Interrupted));
        // One wake, one interrupt; later reads behave normally.
        port.feed(b"ok");
        let n = ch.read(&mut buf, Duration::from_millis(100)).expect("read");
        assert_eq!(&buf[..n], b"ok");
    }

    #[test]
    fn echo_loops_writes_back() {
        let port = LoopbackPort::new();
        port.set_echo(true);
        let ch = port.open_channel().expect("open");
        ch.write(b"ping", Duration::from_millis(100)).expect("write");
        assert_eq!(port.written(), b"ping");
        let mut buf = [0u8; 8];
        let n = ch.read(&mut buf, Duration::from_millis(100)).expect("read");
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn manager_hides_vanished_devices() {
        let mgr = LoopbackDeviceManager::new();
        mgr.add_hid(LoopbackHidBackend::new("loop/hid0"));
        mgr.add_serial(LoopbackSerialBackend::new("loop/tty0"));
        assert_eq!(mgr.hid_device_keys().len(), 1);
        mgr.set_vanished("loop/hid0", true);
        assert!(mgr.hid_device_keys().is_empty());
        let key = DeviceKey::new("loop/hid0");
        assert!(mgr.try_create_hid_device(&key).is_none());
        assert_eq!(mgr.serial_device_keys().len(), 1);
    }
}
