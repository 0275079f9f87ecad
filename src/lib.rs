pub mod backends;
pub mod ble;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hid;
pub mod indexes;
pub mod manager;
pub mod metadata;
pub mod serial;
pub mod stream;

#[cfg(target_os = "linux")]
mod exclusive;

pub use ble::{BleCharacteristic, BleDevice, BleService};
pub use config::{OpenConfiguration, OpenOption, OptionValue};
pub use device::{Device, ImplementationDetail};
pub use error::{DeviceError, Result};
pub use hid::{HidDevice, HidStream};
pub use indexes::Indexes;
pub use manager::{ChangeListener, DeviceList, DeviceManager};
pub use serial::{SerialDevice, SerialParity, SerialSettings, SerialStream};
