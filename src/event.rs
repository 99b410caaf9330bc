//! Events delivered to the application and the sink that carries them.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::types::{
    AddressType, Advertisement, BleUuid, CharacteristicProperties, Peripheral, RadioState,
};

/// A discovered characteristic as reported to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicSummary {
    pub uuid: BleUuid,
    pub properties: CharacteristicProperties,
}

/// Everything the session reports. `id` is always the canonical peripheral
/// id; `error` is set when the operation failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    StateChange {
        state: RadioState,
    },
    AddressChange {
        address: String,
    },
    ScanStart,
    ScanStop,
    Discover {
        id: String,
        address: String,
        #[serde(rename = "addressType")]
        address_type: AddressType,
        connectable: bool,
        advertisement: Advertisement,
        rssi: i16,
    },
    Connect {
        id: String,
        error: Option<String>,
    },
    Disconnect {
        id: String,
    },
    RssiUpdate {
        id: String,
        rssi: i16,
    },
    Mtu {
        id: String,
        mtu: u16,
    },
    ServicesDiscover {
        id: String,
        services: Vec<BleUuid>,
        error: Option<String>,
    },
    IncludedServicesDiscover {
        id: String,
        service: BleUuid,
        services: Vec<BleUuid>,
        error: Option<String>,
    },
    CharacteristicsDiscover {
        id: String,
        service: BleUuid,
        characteristics: Vec<CharacteristicSummary>,
        error: Option<String>,
    },
    Read {
        id: String,
        service: BleUuid,
        characteristic: BleUuid,
        #[serde(serialize_with = "serialize_hex")]
        data: Vec<u8>,
        #[serde(rename = "isNotification")]
        is_notification: bool,
        error: Option<String>,
    },
    Write {
        id: String,
        service: BleUuid,
        characteristic: BleUuid,
        error: Option<String>,
    },
    Notify {
        id: String,
        service: BleUuid,
        characteristic: BleUuid,
        state: bool,
        error: Option<String>,
    },
    DescriptorsDiscover {
        id: String,
        service: BleUuid,
        characteristic: BleUuid,
        descriptors: Vec<BleUuid>,
        error: Option<String>,
    },
    ValueRead {
        id: String,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
        #[serde(serialize_with = "serialize_hex")]
        data: Vec<u8>,
        error: Option<String>,
    },
    ValueWrite {
        id: String,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
        error: Option<String>,
    },
}

impl Event {
    pub fn discover(peripheral: &Peripheral) -> Self {
        Event::Discover {
            id: peripheral.id.clone(),
            address: peripheral.address_string(),
            address_type: peripheral.address_type,
            connectable: peripheral.connectable,
            advertisement: peripheral.advertisement.clone(),
            rssi: peripheral.rssi,
        }
    }

    /// Event name as seen by a binding layer.
    pub fn name(&self) -> &'static str {
        match self {
            Event::StateChange { .. } => "stateChange",
            Event::AddressChange { .. } => "addressChange",
            Event::ScanStart => "scanStart",
            Event::ScanStop => "scanStop",
            Event::Discover { .. } => "discover",
            Event::Connect { .. } => "connect",
            Event::Disconnect { .. } => "disconnect",
            Event::RssiUpdate { .. } => "rssiUpdate",
            Event::Mtu { .. } => "mtu",
            Event::ServicesDiscover { .. } => "servicesDiscover",
            Event::IncludedServicesDiscover { .. } => "includedServicesDiscover",
            Event::CharacteristicsDiscover { .. } => "characteristicsDiscover",
            Event::Read { .. } => "read",
            Event::Write { .. } => "write",
            Event::Notify { .. } => "notify",
            Event::DescriptorsDiscover { .. } => "descriptorsDiscover",
            Event::ValueRead { .. } => "valueRead",
            Event::ValueWrite { .. } => "valueWrite",
        }
    }

    /// Positional arguments for a binding layer that calls
    /// `emit(name, ...args)`. Optional errors are trailing and `null` when
    /// absent; read payloads are `null` when an error is present.
    pub fn payload(&self) -> Vec<Value> {
        match self {
            Event::StateChange { state } => vec![json!(state.as_str())],
            Event::AddressChange { address } => vec![json!(address)],
            Event::ScanStart | Event::ScanStop => Vec::new(),
            Event::Discover {
                id,
                address,
                address_type,
                connectable,
                advertisement,
                rssi,
            } => vec![
                json!(id),
                json!(address),
                json!(address_type),
                json!(connectable),
                json!(advertisement),
                json!(rssi),
            ],
            Event::Connect { id, error } => vec![json!(id), json!(error)],
            Event::Disconnect { id } => vec![json!(id)],
            Event::RssiUpdate { id, rssi } => vec![json!(id), json!(rssi)],
            Event::Mtu { id, mtu } => vec![json!(id), json!(mtu)],
            Event::ServicesDiscover {
                id,
                services,
                error,
            } => vec![json!(id), json!(services), json!(error)],
            Event::IncludedServicesDiscover {
                id,
                service,
                services,
                error,
            } => vec![json!(id), json!(service), json!(services), json!(error)],
            Event::CharacteristicsDiscover {
                id,
                service,
                characteristics,
                error,
            } => vec![json!(id), json!(service), json!(characteristics), json!(error)],
            Event::Read {
                id,
                service,
                characteristic,
                data,
                is_notification,
                error,
            } => vec![
                json!(id),
                json!(service),
                json!(characteristic),
                hex_or_null(data, error),
                json!(is_notification),
                json!(error),
            ],
            Event::Write {
                id,
                service,
                characteristic,
                error,
            } => vec![json!(id), json!(service), json!(characteristic), json!(error)],
            Event::Notify {
                id,
                service,
                characteristic,
                state,
                error,
            } => vec![
                json!(id),
                json!(service),
                json!(characteristic),
                json!(state),
                json!(error),
            ],
            Event::DescriptorsDiscover {
                id,
                service,
                characteristic,
                descriptors,
                error,
            } => vec![
                json!(id),
                json!(service),
                json!(characteristic),
                json!(descriptors),
                json!(error),
            ],
            Event::ValueRead {
                id,
                service,
                characteristic,
                descriptor,
                data,
                error,
            } => vec![
                json!(id),
                json!(service),
                json!(characteristic),
                json!(descriptor),
                hex_or_null(data, error),
                json!(error),
            ],
            Event::ValueWrite {
                id,
                service,
                characteristic,
                descriptor,
                error,
            } => vec![
                json!(id),
                json!(service),
                json!(characteristic),
                json!(descriptor),
                json!(error),
            ],
        }
    }

    /// The error carried by the event, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            Event::Connect { error, .. }
            | Event::ServicesDiscover { error, .. }
            | Event::IncludedServicesDiscover { error, .. }
            | Event::CharacteristicsDiscover { error, .. }
            | Event::Read { error, .. }
            | Event::Write { error, .. }
            | Event::Notify { error, .. }
            | Event::DescriptorsDiscover { error, .. }
            | Event::ValueRead { error, .. }
            | Event::ValueWrite { error, .. } => error.as_deref(),
            _ => None,
        }
    }
}

fn hex_or_null(data: &[u8], error: &Option<String>) -> Value {
    match error {
        Some(_) => Value::Null,
        None => json!(hex::encode(data)),
    }
}

pub fn serialize_hex<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(data))
}

pub fn serialize_opt_hex<S: Serializer>(
    data: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match data {
        Some(data) => serializer.serialize_str(&hex::encode(data)),
        None => serializer.serialize_none(),
    }
}

/// Ordered, non-blocking delivery of events to the application.
///
/// Implementations must not block and must tolerate the consumer having
/// gone away.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        if let Err(mpsc::error::SendError(event)) = self.send(event) {
            log::trace!("dropping {} event: receiver gone", event.name());
        }
    }
}

/// Sink backed by an unbounded channel, plus its receiving end.
pub fn event_channel() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}
