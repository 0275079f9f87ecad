//! Serial devices and line-oriented streams.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OpenConfiguration;
use crate::device::{open_restricted, ImplementationDetail};
use crate::error::{DeviceError, Result};
use crate::stream::{Channel, StreamShared};

/// Parity bit policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}

/// Line parameters applied to an open serial channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud_rate: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        }
    }
}

/// A serial channel additionally accepts line-parameter changes.
pub trait SerialChannel: Channel {
    fn apply_settings(&self, settings: &SerialSettings) -> Result<()>;
}

/// Backend collaborator supplying serial identity and channels.
pub trait SerialBackend: Send + Sync {
    fn device_path(&self) -> &str;

    fn stream_path(&self) -> &str {
        self.device_path()
    }

    fn file_system_name(&self) -> &str;
    fn details(&self) -> &[ImplementationDetail];
    fn open_channel(&self, config: &OpenConfiguration) -> Result<Arc<dyn SerialChannel>>;
}

// StreamShared talks to a plain Channel; this keeps the settings-capable
// handle reachable from the stream while the lifetime core owns the free.
struct SerialChannelAdapter(Arc<dyn SerialChannel>);

impl Channel for SerialChannelAdapter {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.0.read(buf, timeout)
    }
    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.0.write(buf, timeout)
    }
    fn wake(&self) {
        self.0.wake();
    }
    fn free(&self) {
        self.0.free();
    }
}

/// A serial port.
#[derive(Clone)]
pub struct SerialDevice {
    backend: Arc<dyn SerialBackend>,
}

impl SerialDevice {
    pub fn new(backend: Arc<dyn SerialBackend>) -> SerialDevice {
        SerialDevice { backend }
    }

    pub fn device_path(&self) -> &str {
        self.backend.device_path()
    }

    pub fn file_system_name(&self) -> &str {
        self.backend.file_system_name()
    }

    pub fn friendly_name(&self) -> String {
        self.backend.device_path().to_string()
    }

    pub fn has_implementation_detail(&self, detail: ImplementationDetail) -> bool {
        detail == ImplementationDetail::SerialDevice || self.backend.details().contains(&detail)
    }

    /// Opens the port with default settings (9600 8N1).
    pub fn open(&self, config: &OpenConfiguration) -> Result<SerialStream> {
        let channel_slot: Arc<parking_lot::Mutex<Option<Arc<dyn SerialChannel>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&channel_slot);
        let backend = Arc::clone(&self.backend);
        let config_for_open = config.clone();
        let shared = open_restricted(self.backend.stream_path(), config, move || {
            let channel = backend.open_channel(&config_for_open)?;
            *slot.lock() = Some(Arc::clone(&channel));
            Ok(Box::new(SerialChannelAdapter(channel)) as Box<dyn Channel>)
        })?;
        let channel = channel_slot
            .lock()
            .take()
            .ok_or_else(|| DeviceError::Io("serial channel initialization failed".into()))?;

        let mut stream = SerialStream {
            shared,
            channel,
            settings: SerialSettings::default(),
            new_line: "\r\n".to_string(),
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        };
        stream.set_settings(SerialSettings::default())?;
        Ok(stream)
    }

    /// Like [`SerialDevice::open`], but never propagates a failure.
    pub fn try_open(&self, config: &OpenConfiguration) -> Option<SerialStream> {
        match self.open(config) {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!(device = self.device_path(), error = %e, "try_open failed");
                None
            }
        }
    }
}

impl fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDevice")
            .field("device_path", &self.device_path())
            .finish()
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// An open serial channel with line-oriented conveniences. Text is UTF-8;
/// the line terminator defaults to CR LF.
pub struct SerialStream {
    shared: Arc<StreamShared>,
    channel: Arc<dyn SerialChannel>,
    settings: SerialSettings,
    new_line: String,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SerialStream {
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read(buf, self.read_timeout)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.shared.write(buf, self.write_timeout)
    }

    /// Writes the whole buffer, retrying partial writes.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(DeviceError::Io("serial write made no progress".into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Reads and discards bytes up to and including the first occurrence of
    /// `ending`, returning the text observed before it. A timeout or end of
    /// input mid-scan returns the text read so far.
    pub fn read_to(&self, ending: &str) -> Result<String> {
        if ending.is_empty() {
            return Err(DeviceError::InvalidOption("ending must not be empty".into()));
        }
        let ending = ending.as_bytes();
        let mut bytes: Vec<u8> = Vec::new();
        let mut matched = 0usize;

        loop {
            let mut byte = [0u8; 1];
            let n = match self.read(&mut byte) {
                Ok(n) => n,
                Err(DeviceError::Timeout) => break,
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }
            bytes.push(byte[0]);

            if byte[0] == ending[matched] {
                matched += 1;
                if matched == ending.len() {
                    break;
                }
            } else {
                matched = if byte[0] == ending[0] { 1 } else { 0 };
            }
        }

        bytes.truncate(bytes.len() - matched);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads one line, using the configured terminator.
    pub fn read_line(&self) -> Result<String> {
        let new_line = self.new_line.clone();
        self.read_to(&new_line)
    }

    pub fn write_str(&self, s: &str) -> Result<()> {
        self.write_all(s.as_bytes())
    }

    /// Writes `s` followed by the configured terminator.
    pub fn write_line(&self, s: &str) -> Result<()> {
        self.write_str(s)?;
        self.write_all(self.new_line.as_bytes())
    }

    pub fn settings(&self) -> SerialSettings {
        self.settings
    }

    /// Applies new line parameters to the open channel.
    pub fn set_settings(&mut self, settings: SerialSettings) -> Result<()> {
        let _guard = self.shared.acquire()?;
        self.channel.apply_settings(&settings)?;
        self.settings = settings;
        Ok(())
    }

    pub fn baud_rate(&self) -> u32 {
        self.settings.baud_rate
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        let mut settings = self.settings;
        settings.baud_rate = baud_rate;
        self.set_settings(settings)
    }

    pub fn data_bits(&self) -> u8 {
        self.settings.data_bits
    }

    pub fn parity(&self) -> SerialParity {
        self.settings.parity
    }

    pub fn stop_bits(&self) -> u8 {
        self.settings.stop_bits
    }

    pub fn new_line(&self) -> &str {
        &self.new_line
    }

    pub fn set_new_line(&mut self, new_line: &str) -> Result<()> {
        if new_line.is_empty() {
            return Err(DeviceError::InvalidOption(
                "line terminator must not be empty".into(),
            ));
        }
        self.new_line = new_line.to_string();
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    /// Unblocks any in-flight read without closing the stream.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    /// Closes the stream. Idempotent; also performed on drop.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for SerialStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}
