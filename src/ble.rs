//! Bluetooth-LE device surface.
//!
//! Only the GATT lookup contract is modeled: a device exposes services,
//! each service exposes characteristics keyed by 128-bit UUID. Transport
//! details live behind the backend.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::device::ImplementationDetail;
use crate::error::Result;

/// A UUID-addressed data element exposed by a [`BleService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BleCharacteristic {
    uuid: Uuid,
}

impl BleCharacteristic {
    pub fn new(uuid: Uuid) -> BleCharacteristic {
        BleCharacteristic { uuid }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for BleCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// A GATT service: a UUID plus its characteristics.
#[derive(Clone, Debug)]
pub struct BleService {
    uuid: Uuid,
    characteristics: Vec<BleCharacteristic>,
}

impl BleService {
    pub fn new(uuid: Uuid, characteristics: Vec<BleCharacteristic>) -> BleService {
        BleService {
            uuid,
            characteristics,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn characteristics(&self) -> &[BleCharacteristic] {
        &self.characteristics
    }

    /// Linear scan for a characteristic by UUID. First match wins should
    /// UUIDs ever collide (they should not).
    pub fn try_get_characteristic(&self, uuid: Uuid) -> Option<&BleCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }

    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.try_get_characteristic(uuid).is_some()
    }
}

impl fmt::Display for BleService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// Backend collaborator supplying BLE identity and services.
pub trait BleBackend: Send + Sync {
    fn device_path(&self) -> &str;
    fn friendly_name(&self) -> String;
    fn services(&self) -> Result<Vec<BleService>>;
    fn details(&self) -> &[ImplementationDetail];
}

/// A Bluetooth-LE peripheral.
#[derive(Clone)]
pub struct BleDevice {
    backend: Arc<dyn BleBackend>,
}

impl BleDevice {
    pub fn new(backend: Arc<dyn BleBackend>) -> BleDevice {
        BleDevice { backend }
    }

    /// OS-stable identity key, unique within a manager.
    pub fn device_path(&self) -> &str {
        self.backend.device_path()
    }

    pub fn friendly_name(&self) -> String {
        self.backend.friendly_name()
    }

    pub fn services(&self) -> Result<Vec<BleService>> {
        self.backend.services()
    }

    /// Linear scan for a service by UUID.
    pub fn try_get_service(&self, uuid: Uuid) -> Result<Option<BleService>> {
        Ok(self.services()?.into_iter().find(|s| s.uuid() == uuid))
    }

    pub fn has_implementation_detail(&self, detail: ImplementationDetail) -> bool {
        detail == ImplementationDetail::BleDevice || self.backend.details().contains(&detail)
    }
}

impl fmt::Debug for BleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleDevice")
            .field("device_path", &self.device_path())
            .finish()
    }
}
