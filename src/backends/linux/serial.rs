//! Serial ports on tty device nodes.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
};
use parking_lot::Mutex;

use super::fd::FdChannel;
use crate::config::OpenConfiguration;
use crate::device::ImplementationDetail;
use crate::error::{DeviceError, Result};
use crate::serial::{SerialBackend, SerialChannel, SerialParity, SerialSettings};
use crate::stream::Channel;

const DETAILS: &[ImplementationDetail] = &[ImplementationDetail::Linux];

pub struct LinuxSerialBackend {
    path: String,
}

impl LinuxSerialBackend {
    pub fn new(path: impl Into<String>) -> LinuxSerialBackend {
        LinuxSerialBackend { path: path.into() }
    }
}

impl SerialBackend for LinuxSerialBackend {
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
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(&self.path)?;
        let fd: OwnedFd = file.into();
        Ok(Arc::new(TtyChannel {
            // fd ownership moves into the channel; termios calls borrow it
            // back through the raw descriptor while the channel is open.
            channel: FdChannel::new(fd)?,
            termios_lock: Mutex::new(()),
        }))
    }
}

/// A tty node channel: poll-driven byte I/O plus termios line control.
struct TtyChannel {
    channel: FdChannel,
    termios_lock: Mutex<()>,
}

impl Channel for TtyChannel {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.channel.read(buf, timeout)
    }

    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.channel.write(buf, timeout)
    }

    fn wake(&self) {
        self.channel.wake();
    }

    fn free(&self) {
        self.channel.free();
    }
}

impl SerialChannel for TtyChannel {
    fn apply_settings(&self, settings: &SerialSettings) -> Result<()> {
        let _guard = self.termios_lock.lock();
        let fd = self.channel.borrow_fd()?;
        let mut tio = termios::tcgetattr(fd.as_fd())?;

        // Raw byte stream: no line discipline, no translation, no echo.
        tio.input_flags &= !(InputFlags::IXON
            | InputFlags::IXOFF
            | InputFlags::ICRNL
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ISTRIP
            | InputFlags::BRKINT);
        tio.output_flags &= !OutputFlags::OPOST;
        tio.local_flags &=
            !(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ISIG);
        tio.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;

        tio.control_flags &= !ControlFlags::CSIZE;
        tio.control_flags |= match settings.data_bits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            8 => ControlFlags::CS8,
            other => {
                return Err(DeviceError::InvalidOption(format!(
                    "unsupported data bits: {other}"
                )))
            }
        };

        match settings.parity {
            SerialParity::None => {
                tio.control_flags &= !(ControlFlags::PARENB | ControlFlags::PARODD);
            }
            SerialParity::Even => {
                tio.control_flags |= ControlFlags::PARENB;
                tio.control_flags &= !ControlFlags::PARODD;
            }
            SerialParity::Odd => {
                tio.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD;
            }
        }

        match settings.stop_bits {
            1 => tio.control_flags &= !ControlFlags::CSTOPB,
            2 => tio.control_flags |= ControlFlags::CSTOPB,
            other => {
                return Err(DeviceError::InvalidOption(format!(
                    "unsupported stop bits: {other}"
                )))
            }
        }

        let baud = baud_constant(settings.baud_rate)?;
        termios::cfsetispeed(&mut tio, baud)?;
        termios::cfsetospeed(&mut tio, baud)?;

        termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &tio)?;
        Ok(())
    }
}

fn baud_constant(rate: u32) -> Result<BaudRate> {
    Ok(match rate {
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => {
            return Err(DeviceError::InvalidOption(format!(
                "unsupported baud rate: {other}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_lookup_covers_common_rates() {
        assert!(baud_constant(9600).is_ok());
        assert!(baud_constant(115200).is_ok());
        assert!(matches!(
            baud_constant(12345),
            Err(DeviceError::InvalidOption(_))
        ));
    }
}
