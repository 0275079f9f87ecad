//! HID devices on hidraw nodes.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::fcntl::OFlag;
use nix::ioctl_read;
use nix::libc;

use super::fd::FdChannel;
use crate::config::OpenConfiguration;
use crate::device::ImplementationDetail;
use crate::error::{DeviceError, Result};
use crate::hid::HidBackend;
use crate::stream::Channel;

const DETAILS: &[ImplementationDetail] =
    &[ImplementationDetail::Linux, ImplementationDetail::HidrawApi];

const HIDRAW_DESCRIPTOR_MAX: usize = 4096;

#[repr(C)]
pub struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HIDRAW_DESCRIPTOR_MAX],
}

ioctl_read!(hidraw_descriptor_size, b'H', 0x01, libc::c_int);
ioctl_read!(hidraw_descriptor, b'H', 0x02, HidrawReportDescriptor);

/// One enumerated hidraw device, identity captured at enumeration time.
pub struct LinuxHidBackend {
    path: String,
    vendor_id: u16,
    product_id: u16,
    release_bcd: u16,
    manufacturer: Option<String>,
    product_name: Option<String>,
    serial_number: Option<String>,
}

impl LinuxHidBackend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: String,
        vendor_id: u16,
        product_id: u16,
        release_bcd: u16,
        manufacturer: Option<String>,
        product_name: Option<String>,
        serial_number: Option<String>,
    ) -> LinuxHidBackend {
        LinuxHidBackend {
            path,
            vendor_id,
            product_id,
            release_bcd,
            manufacturer,
            product_name,
            serial_number,
        }
    }
}

impl HidBackend for LinuxHidBackend {
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

    /// Reads the descriptor straight from the hidraw node, so the bytes are
    /// exactly what the device reported, not a reconstruction.
    fn raw_report_descriptor(&self) -> Result<Vec<u8>> {
        let file = File::open(&self.path)?;
        let fd = file.as_raw_fd();

        let mut size: libc::c_int = 0;
        unsafe { hidraw_descriptor_size(fd, &mut size) }?;
        if size < 0 || size as usize > HIDRAW_DESCRIPTOR_MAX {
            return Err(DeviceError::Io(format!(
                "hidraw reported descriptor size {size}"
            )));
        }

        let mut desc = HidrawReportDescriptor {
            size: size as u32,
            value: [0u8; HIDRAW_DESCRIPTOR_MAX],
        };
        unsafe { hidraw_descriptor(fd, &mut desc) }?;
        Ok(desc.value[..desc.size as usize].to_vec())
    }

    fn details(&self) -> &[ImplementationDetail] {
        DETAILS
    }

    fn open_channel(&self, _config: &OpenConfiguration) -> Result<Box<dyn Channel>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.path)?;
        let fd: OwnedFd = file.into();
        Ok(Box::new(FdChannel::new(fd)?))
    }
}
