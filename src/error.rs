//! Error taxonomy shared by every device category and stream.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors surfaced by enumeration, open, and stream operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The backend cannot provide this capability (e.g. raw report
    /// descriptors on platforms that only reconstruct them).
    #[error("operation not supported by this backend")]
    NotSupported,

    /// An OS call failed, or a metadata field the caller asked for was
    /// never reported by the device ("unnamed manufacturer" and friends).
    #[error("device I/O failed: {0}")]
    Io(String),

    /// The handle's reference count reached zero or a close was requested.
    #[error("device handle is closed")]
    Closed,

    /// Exclusive-lock acquisition or a read/write exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A blocking read was woken by an interrupt request. The stream is
    /// still open; retry or close as appropriate.
    #[error("interrupted by an exclusive access request")]
    Interrupted,

    /// An open option carried a value of the wrong type.
    #[error("invalid open option: {0}")]
    InvalidOption(String),
}

impl From<hidapi::HidError> for DeviceError {
    fn from(e: hidapi::HidError) -> Self {
        DeviceError::Io(e.to_string())
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Io(e.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<nix::errno::Errno> for DeviceError {
    fn from(e: nix::errno::Errno) -> Self {
        DeviceError::Io(e.desc().to_string())
    }
}
