//! GATT requests as explicit continuations
//!
//! A [`GattRequest`] travels through the executor and its spawned native
//! calls unchanged: it names the target to resolve, the native call to make
//! once resolved, and how to report a failure at any step.

use std::fmt::Display;

use crate::event::Event;
use crate::session::gatt_cache::Target;
use crate::types::BleUuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
    DiscoverServices {
        filter: Vec<BleUuid>,
    },
    DiscoverIncludedServices {
        service: BleUuid,
        filter: Vec<BleUuid>,
    },
    DiscoverCharacteristics {
        service: BleUuid,
        filter: Vec<BleUuid>,
    },
    Read {
        service: BleUuid,
        characteristic: BleUuid,
    },
    Write {
        service: BleUuid,
        characteristic: BleUuid,
        data: Vec<u8>,
        without_response: bool,
    },
    Notify {
        service: BleUuid,
        characteristic: BleUuid,
        on: bool,
    },
    DiscoverDescriptors {
        service: BleUuid,
        characteristic: BleUuid,
    },
    ReadDescriptor {
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    },
    WriteDescriptor {
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
        data: Vec<u8>,
    },
}

/// One GATT command for one peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattRequest {
    /// Peripheral id. Canonical once the request reaches the executor.
    pub id: String,
    pub op: GattOp,
}

impl GattRequest {
    pub fn new(id: impl Into<String>, op: GattOp) -> Self {
        Self { id: id.into(), op }
    }

    /// The attribute that must be resolved before the native call. Explicit
    /// discovery resolves the parent and enumerates its children.
    pub fn target(&self) -> Target {
        match &self.op {
            GattOp::DiscoverServices { .. } => Target::Device,
            GattOp::DiscoverIncludedServices { service, .. }
            | GattOp::DiscoverCharacteristics { service, .. } => Target::Service(*service),
            GattOp::Read {
                service,
                characteristic,
            }
            | GattOp::Write {
                service,
                characteristic,
                ..
            }
            | GattOp::Notify {
                service,
                characteristic,
                ..
            }
            | GattOp::DiscoverDescriptors {
                service,
                characteristic,
            } => Target::Characteristic(*service, *characteristic),
            GattOp::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            }
            | GattOp::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                ..
            } => Target::Descriptor(*service, *characteristic, *descriptor),
        }
    }

    /// What the request is doing, for error messages.
    pub fn activity(&self) -> String {
        match &self.op {
            GattOp::DiscoverServices { .. } => "discovering services".to_string(),
            GattOp::DiscoverIncludedServices { service, .. } => {
                format!("discovering included services for service {}", service)
            }
            GattOp::DiscoverCharacteristics { service, .. } => {
                format!("discovering characteristics for service {}", service)
            }
            GattOp::Read { characteristic, .. } => {
                format!("reading characteristic {}", characteristic)
            }
            GattOp::Write { characteristic, .. } => {
                format!("writing characteristic {}", characteristic)
            }
            GattOp::Notify {
                characteristic,
                on: true,
                ..
            } => format!("subscribing to characteristic {}", characteristic),
            GattOp::Notify { characteristic, .. } => {
                format!("unsubscribing from characteristic {}", characteristic)
            }
            GattOp::DiscoverDescriptors { characteristic, .. } => {
                format!("discovering descriptors for characteristic {}", characteristic)
            }
            GattOp::ReadDescriptor { descriptor, .. } => {
                format!("reading value of descriptor {}", descriptor)
            }
            GattOp::WriteDescriptor { descriptor, .. } => {
                format!("writing value of descriptor {}", descriptor)
            }
        }
    }

    /// The request's event carrying `"<reason> while <activity>"`.
    pub fn failure(&self, reason: impl Display) -> Event {
        self.event(Some(format!("{} while {}", reason, self.activity())))
    }

    /// The request's event for a call with no result payload: writes and
    /// notification changes. Discovery and reads build their own success
    /// events.
    pub fn event(&self, error: Option<String>) -> Event {
        let id = self.id.clone();
        match &self.op {
            GattOp::DiscoverServices { .. } => Event::ServicesDiscover {
                id,
                services: Vec::new(),
                error,
            },
            GattOp::DiscoverIncludedServices { service, .. } => Event::IncludedServicesDiscover {
                id,
                service: *service,
                services: Vec::new(),
                error,
            },
            GattOp::DiscoverCharacteristics { service, .. } => Event::CharacteristicsDiscover {
                id,
                service: *service,
                characteristics: Vec::new(),
                error,
            },
            GattOp::Read {
                service,
                characteristic,
            } => Event::Read {
                id,
                service: *service,
                characteristic: *characteristic,
                data: Vec::new(),
                is_notification: false,
                error,
            },
            GattOp::Write {
                service,
                characteristic,
                ..
            } => Event::Write {
                id,
                service: *service,
                characteristic: *characteristic,
                error,
            },
            GattOp::Notify {
                service,
                characteristic,
                on,
            } => Event::Notify {
                id,
                service: *service,
                characteristic: *characteristic,
                state: *on,
                error,
            },
            GattOp::DiscoverDescriptors {
                service,
                characteristic,
            } => Event::DescriptorsDiscover {
                id,
                service: *service,
                characteristic: *characteristic,
                descriptors: Vec::new(),
                error,
            },
            GattOp::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            } => Event::ValueRead {
                id,
                service: *service,
                characteristic: *characteristic,
                descriptor: *descriptor,
                data: Vec::new(),
                error,
            },
            GattOp::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                ..
            } => Event::ValueWrite {
                id,
                service: *service,
                characteristic: *characteristic,
                descriptor: *descriptor,
                error,
            },
        }
    }
}

/// Keep only UUIDs in `filter`; an empty filter keeps everything.
pub fn filter_uuids<T>(items: Vec<T>, filter: &[BleUuid], uuid: impl Fn(&T) -> BleUuid) -> Vec<T> {
    if filter.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| filter.contains(&uuid(item)))
        .collect()
}
