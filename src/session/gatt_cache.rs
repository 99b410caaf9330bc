//! Per-connection cache of the remote GATT hierarchy
//!
//! Entries are keyed by UUID and owned outright by their parent; nothing
//! points back up the tree. The cache only grows until the connection is
//! torn down.

use std::collections::HashMap;

use crate::ble::transport::{
    CharacteristicHandle, CharacteristicInfo, DescriptorHandle, DescriptorInfo, ServiceHandle,
    ServiceInfo,
};
use crate::types::{BleUuid, CharacteristicProperties};

#[derive(Debug)]
pub struct ServiceEntry {
    pub handle: ServiceHandle,
    pub characteristics: HashMap<BleUuid, CharacteristicEntry>,
}

#[derive(Debug)]
pub struct CharacteristicEntry {
    pub handle: CharacteristicHandle,
    pub properties: CharacteristicProperties,
    pub descriptors: HashMap<BleUuid, DescriptorHandle>,
}

/// The attribute an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Device,
    Service(BleUuid),
    Characteristic(BleUuid, BleUuid),
    Descriptor(BleUuid, BleUuid, BleUuid),
}

/// Native handle of a fully resolved target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Device,
    Service(ServiceHandle),
    Characteristic(CharacteristicHandle, CharacteristicProperties),
    Descriptor(DescriptorHandle),
}

/// Outcome of a cache walk: either the target, or the first missing level
/// together with the parent handle needed to look it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Ready(Resolved),
    MissingService(BleUuid),
    MissingCharacteristic {
        service: BleUuid,
        parent: ServiceHandle,
        uuid: BleUuid,
    },
    MissingDescriptor {
        service: BleUuid,
        characteristic: BleUuid,
        parent: CharacteristicHandle,
        uuid: BleUuid,
    },
}

#[derive(Debug, Default)]
pub struct GattCache {
    services: HashMap<BleUuid, ServiceEntry>,
}

impl GattCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, target: Target) -> Resolution {
        let (service_uuid, rest) = match target {
            Target::Device => return Resolution::Ready(Resolved::Device),
            Target::Service(s) => (s, None),
            Target::Characteristic(s, c) => (s, Some((c, None))),
            Target::Descriptor(s, c, d) => (s, Some((c, Some(d)))),
        };

        let Some(service) = self.services.get(&service_uuid) else {
            return Resolution::MissingService(service_uuid);
        };
        let Some((char_uuid, descriptor_uuid)) = rest else {
            return Resolution::Ready(Resolved::Service(service.handle));
        };

        let Some(characteristic) = service.characteristics.get(&char_uuid) else {
            return Resolution::MissingCharacteristic {
                service: service_uuid,
                parent: service.handle,
                uuid: char_uuid,
            };
        };
        let Some(descriptor_uuid) = descriptor_uuid else {
            return Resolution::Ready(Resolved::Characteristic(
                characteristic.handle,
                characteristic.properties,
            ));
        };

        match characteristic.descriptors.get(&descriptor_uuid) {
            Some(handle) => Resolution::Ready(Resolved::Descriptor(*handle)),
            None => Resolution::MissingDescriptor {
                service: service_uuid,
                characteristic: char_uuid,
                parent: characteristic.handle,
                uuid: descriptor_uuid,
            },
        }
    }

    /// Insert or refresh a service. Cached characteristics are kept.
    pub fn upsert_service(&mut self, info: &ServiceInfo) {
        self.services
            .entry(info.uuid)
            .and_modify(|entry| entry.handle = info.handle)
            .or_insert_with(|| ServiceEntry {
                handle: info.handle,
                characteristics: HashMap::new(),
            });
    }

    /// Insert or refresh a characteristic under a cached service. Returns
    /// false if the service is not cached.
    pub fn upsert_characteristic(&mut self, service: &BleUuid, info: &CharacteristicInfo) -> bool {
        let Some(entry) = self.services.get_mut(service) else {
            return false;
        };
        entry
            .characteristics
            .entry(info.uuid)
            .and_modify(|c| {
                c.handle = info.handle;
                c.properties = info.properties;
            })
            .or_insert_with(|| CharacteristicEntry {
                handle: info.handle,
                properties: info.properties,
                descriptors: HashMap::new(),
            });
        true
    }

    pub fn upsert_descriptor(
        &mut self,
        service: &BleUuid,
        characteristic: &BleUuid,
        info: &DescriptorInfo,
    ) -> bool {
        match self
            .services
            .get_mut(service)
            .and_then(|s| s.characteristics.get_mut(characteristic))
        {
            Some(entry) => {
                entry.descriptors.insert(info.uuid, info.handle);
                true
            }
            None => false,
        }
    }

    /// Find the UUID path of a characteristic by its native handle. Value
    /// change deliveries only carry the handle.
    pub fn locate_characteristic(&self, handle: CharacteristicHandle) -> Option<(BleUuid, BleUuid)> {
        self.services.iter().find_map(|(service_uuid, service)| {
            service
                .characteristics
                .iter()
                .find(|(_, c)| c.handle == handle)
                .map(|(char_uuid, _)| (*service_uuid, *char_uuid))
        })
    }
}
