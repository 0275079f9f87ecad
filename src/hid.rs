//! HID devices and streams.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::OpenConfiguration;
use crate::descriptor::ReportDescriptor;
use crate::device::{open_restricted, ImplementationDetail};
use crate::error::{DeviceError, Result};
use crate::stream::{Channel, StreamShared};

/// Backend collaborator supplying HID identity, metadata, and channels.
///
/// String metadata returns `None` when the OS never reported the field; the
/// device surface turns that into the matching [`DeviceError::Io`].
pub trait HidBackend: Send + Sync {
    /// Enumeration identity path.
    fn device_path(&self) -> &str;

    /// Path used for the stream and its cross-process exclusion key. May
    /// differ from the enumeration identity.
    fn stream_path(&self) -> &str {
        self.device_path()
    }

    /// File system path, e.g. for permission checks on hidraw nodes.
    fn file_system_name(&self) -> &str;

    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;

    /// Device release number in binary-coded decimal.
    fn release_bcd(&self) -> u16;

    fn manufacturer(&self) -> Option<String>;
    fn product_name(&self) -> Option<String>;
    fn serial_number(&self) -> Option<String>;

    /// Raw report descriptor bytes. Backends that can only reconstruct the
    /// descriptor fail with [`DeviceError::NotSupported`].
    fn raw_report_descriptor(&self) -> Result<Vec<u8>>;

    fn details(&self) -> &[ImplementationDetail];

    fn open_channel(&self, config: &OpenConfiguration) -> Result<Box<dyn Channel>>;
}

/// A USB/Bluetooth HID-class device.
#[derive(Clone)]
pub struct HidDevice {
    backend: Arc<dyn HidBackend>,
    // Descriptor summary, fetched whole on first use. Clones share the
    // cache, so concurrent first access still yields one canonical parse.
    descriptor: Arc<Mutex<Option<Arc<ReportDescriptor>>>>,
}

impl HidDevice {
    pub fn new(backend: Arc<dyn HidBackend>) -> HidDevice {
        HidDevice {
            backend,
            descriptor: Arc::new(Mutex::new(None)),
        }
    }

    pub fn device_path(&self) -> &str {
        self.backend.device_path()
    }

    pub fn file_system_name(&self) -> &str {
        self.backend.file_system_name()
    }

    pub fn friendly_name(&self) -> String {
        self.product_name()
            .unwrap_or_else(|_| "(unnamed product)".to_string())
    }

    pub fn vendor_id(&self) -> u16 {
        self.backend.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.backend.product_id()
    }

    /// Release number in binary-coded decimal, e.g. `0x0121` for 1.21.
    pub fn release_bcd(&self) -> u16 {
        self.backend.release_bcd()
    }

    /// Release number decoded to `(major, minor)`.
    pub fn release_version(&self) -> (u16, u16) {
        let bcd = self.backend.release_bcd();
        (bcd_digits((bcd >> 8) as u8), bcd_digits((bcd & 0xFF) as u8))
    }

    pub fn manufacturer(&self) -> Result<String> {
        self.backend
            .manufacturer()
            .ok_or_else(|| DeviceError::Io("unnamed manufacturer".into()))
    }

    pub fn product_name(&self) -> Result<String> {
        self.backend
            .product_name()
            .ok_or_else(|| DeviceError::Io("unnamed product".into()))
    }

    pub fn serial_number(&self) -> Result<String> {
        self.backend
            .serial_number()
            .ok_or_else(|| DeviceError::Io("no serial number".into()))
    }

    /// Raw report descriptor bytes, when the backend can retrieve them.
    pub fn raw_report_descriptor(&self) -> Result<Vec<u8>> {
        self.backend.raw_report_descriptor()
    }

    /// Parsed report descriptor. Fetched and parsed once, then cached;
    /// a partially-populated state is never observable.
    pub fn report_descriptor(&self) -> Result<Arc<ReportDescriptor>> {
        let mut cache = self.descriptor.lock();
        if let Some(parsed) = &*cache {
            return Ok(Arc::clone(parsed));
        }
        let raw = self.backend.raw_report_descriptor()?;
        let parsed = Arc::new(ReportDescriptor::parse(&raw)?);
        *cache = Some(Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Maximum input report length, including the report-ID byte.
    pub fn max_input_report_length(&self) -> Result<usize> {
        Ok(self.report_descriptor()?.max_input_report_length())
    }

    pub fn max_output_report_length(&self) -> Result<usize> {
        Ok(self.report_descriptor()?.max_output_report_length())
    }

    pub fn max_feature_report_length(&self) -> Result<usize> {
        Ok(self.report_descriptor()?.max_feature_report_length())
    }

    /// First usage value of the first top-level descriptor item, or 0 when
    /// none exists. Never fails.
    pub fn top_level_usage(&self) -> u32 {
        self.report_descriptor()
            .map(|d| d.top_level_usage())
            .unwrap_or(0)
    }

    pub fn has_implementation_detail(&self, detail: ImplementationDetail) -> bool {
        detail == ImplementationDetail::HidDevice || self.backend.details().contains(&detail)
    }

    /// Makes a connection to the device, or fails.
    pub fn open(&self, config: &OpenConfiguration) -> Result<HidStream> {
        let shared = open_restricted(self.backend.stream_path(), config, || {
            self.backend.open_channel(config)
        })?;
        Ok(HidStream {
            shared,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Like [`HidDevice::open`], but never propagates a failure.
    pub fn try_open(&self, config: &OpenConfiguration) -> Option<HidStream> {
        match self.open(config) {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!(device = self.device_path(), error = %e, "try_open failed");
                None
            }
        }
    }
}

impl fmt::Display for HidDevice {
    /// Every field renders through isolated failure handling: a missing
    /// field becomes a fixed placeholder without failing the whole call.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let manufacturer = self
            .manufacturer()
            .unwrap_or_else(|_| "(unnamed manufacturer)".to_string());
        let product = self
            .product_name()
            .unwrap_or_else(|_| "(unnamed product)".to_string());
        let serial = self
            .serial_number()
            .unwrap_or_else(|_| "(no serial number)".to_string());
        let (major, minor) = self.release_version();
        write!(
            f,
            "{} {} {} (VID {:04X}, PID {:04X}, version {}.{})",
            manufacturer,
            product,
            serial,
            self.vendor_id(),
            self.product_id(),
            major,
            minor
        )
    }
}

impl fmt::Debug for HidDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HidDevice")
            .field("device_path", &self.device_path())
            .field("vendor_id", &self.vendor_id())
            .field("product_id", &self.product_id())
            .finish()
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// An open channel to a HID device. Reads and writes whole reports.
///
/// Dropping the stream closes it; closing releases any cross-process
/// exclusion and frees the OS handle once the last in-flight operation
/// finishes.
pub struct HidStream {
    shared: Arc<StreamShared>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl HidStream {
    /// Reads one input report, blocking up to the read timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read(buf, self.read_timeout)
    }

    /// Writes one output report, blocking up to the write timeout.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.shared.write(buf, self.write_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    /// Unblocks any in-flight read with [`DeviceError::Interrupted`]
    /// without closing the stream.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    /// Closes the stream. Idempotent; also performed on drop.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for HidStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn bcd_digits(byte: u8) -> u16 {
    u16::from(byte >> 4) * 10 + u16::from(byte & 0xF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_release_decoding() {
        assert_eq!(bcd_digits(0x21), 21);
        assert_eq!(bcd_digits(0x09), 9);
        assert_eq!(bcd_digits(0x00), 0);
    }
}
