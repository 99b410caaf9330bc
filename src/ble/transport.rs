//! Platform trait definitions and boundary types
//!
//! The session core drives the native Bluetooth stack only through
//! [`Platform`]. Every GATT call is asynchronous and completes with either a
//! failure status, a null result, or a value; unsolicited notifications
//! (radio changes, advertisements, link loss, value changes) arrive as
//! [`PlatformEvent`]s on a broadcast channel.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::advertisement::{self, DataSection};
use super::{NativeResult, PlatformError};
use crate::types::{BleUuid, CharacteristicProperties};

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

native_handle!(
    /// An open native device object.
    DeviceHandle
);
native_handle!(
    /// A GATT service object on an open device.
    ServiceHandle
);
native_handle!(
    /// A GATT characteristic object.
    CharacteristicHandle
);
native_handle!(
    /// A GATT descriptor object.
    DescriptorHandle
);
native_handle!(
    /// Registration of an event listener, needed to unregister it.
    ListenerToken
);

/// Advertising PDU type of a received report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementKind {
    ConnectableUndirected,
    ConnectableDirected,
    ScannableUndirected,
    NonConnectableUndirected,
    ScanResponse,
}

impl AdvertisementKind {
    pub fn is_connectable(&self) -> bool {
        matches!(
            self,
            AdvertisementKind::ConnectableUndirected | AdvertisementKind::ConnectableDirected
        )
    }
}

/// One received advertisement, as handed over by the platform watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementReport {
    pub address: u64,
    pub rssi: i16,
    pub kind: AdvertisementKind,
    pub local_name: Option<String>,
    pub sections: Vec<DataSection>,
    pub service_uuids: Vec<BleUuid>,
}

impl AdvertisementReport {
    /// Build a report from raw AD bytes for platforms that do not pre-parse
    /// the payload.
    pub fn from_raw(address: u64, rssi: i16, kind: AdvertisementKind, raw: &[u8]) -> Self {
        let sections = advertisement::parse_sections(raw);
        Self {
            address,
            rssi,
            kind,
            local_name: advertisement::local_name(&sections),
            service_uuids: advertisement::service_uuids(&sections),
            sections,
        }
    }
}

/// Power state of the radio behind the default adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioPower {
    On,
    Off,
    Disabled,
    Unknown,
}

/// Capability snapshot of the default adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub address: u64,
    pub classic_secure_connections: bool,
    pub le_secure_connections: bool,
    pub extended_advertising: bool,
    pub low_energy: bool,
    pub max_advertisement_length: u32,
    pub peripheral_role: bool,
    pub central_role: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub power: RadioPower,
    pub capabilities: AdapterCapabilities,
}

/// Status of the advertisement watcher after a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Created,
    Started,
    Stopping,
    Stopped,
    Aborted,
}

impl WatcherStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatcherStatus::Stopped | WatcherStatus::Aborted)
    }
}

/// Radio enumeration and power notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    Added,
    Updated,
    Removed,
    EnumerationCompleted,
    PowerChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Value written to a characteristic's client configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConfiguration {
    None,
    Notify,
    Indicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: BleUuid,
    pub handle: ServiceHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: BleUuid,
    pub handle: CharacteristicHandle,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub uuid: BleUuid,
    pub handle: DescriptorHandle,
}

/// Unsolicited notifications from the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Radio(RadioEvent),
    Advertisement(AdvertisementReport),
    /// The watcher reached a terminal status, requested or not.
    WatcherStopped,
    ConnectionStatusChanged {
        device: DeviceHandle,
        token: ListenerToken,
        connected: bool,
    },
    MtuChanged {
        device: DeviceHandle,
        mtu: u16,
    },
    ValueChanged {
        device: DeviceHandle,
        characteristic: CharacteristicHandle,
        token: ListenerToken,
        data: Vec<u8>,
    },
}

/// The native BLE stack, seen from the central role.
///
/// Listener registration and teardown calls are synchronous; every call that
/// talks to the radio or a peer is async.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Subscribe to unsolicited platform events.
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;

    /// Begin radio enumeration. Delivers `Radio(Added)` for each radio
    /// present, then `Radio(EnumerationCompleted)`.
    fn start_radio_watch(&self);

    /// Resolve the default adapter, `None` if there is none.
    async fn default_adapter(&self) -> Result<Option<AdapterInfo>, PlatformError>;

    fn start_watcher(&self) -> Result<(), PlatformError>;

    /// Request the watcher to stop and report the status it reached.
    fn stop_watcher(&self) -> WatcherStatus;

    /// Open a device object for a 48-bit address.
    async fn connect(&self, address: u64) -> NativeResult<DeviceHandle>;

    fn watch_connection(&self, device: DeviceHandle) -> ListenerToken;

    fn unwatch_connection(&self, device: DeviceHandle, token: ListenerToken);

    fn close_device(&self, device: DeviceHandle);

    /// Open a GATT session and report the negotiated MTU.
    async fn open_session(&self, device: DeviceHandle) -> NativeResult<u16>;

    async fn services(&self, device: DeviceHandle) -> NativeResult<Vec<ServiceInfo>>;

    async fn services_for_uuid(
        &self,
        device: DeviceHandle,
        uuid: BleUuid,
    ) -> NativeResult<Vec<ServiceInfo>>;

    async fn included_services(&self, service: ServiceHandle) -> NativeResult<Vec<ServiceInfo>>;

    async fn characteristics(&self, service: ServiceHandle)
        -> NativeResult<Vec<CharacteristicInfo>>;

    async fn characteristics_for_uuid(
        &self,
        service: ServiceHandle,
        uuid: BleUuid,
    ) -> NativeResult<Vec<CharacteristicInfo>>;

    async fn descriptors(
        &self,
        characteristic: CharacteristicHandle,
    ) -> NativeResult<Vec<DescriptorInfo>>;

    async fn descriptors_for_uuid(
        &self,
        characteristic: CharacteristicHandle,
        uuid: BleUuid,
    ) -> NativeResult<Vec<DescriptorInfo>>;

    async fn read_characteristic(&self, characteristic: CharacteristicHandle)
        -> NativeResult<Vec<u8>>;

    async fn write_characteristic(
        &self,
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), PlatformError>;

    async fn write_client_configuration(
        &self,
        characteristic: CharacteristicHandle,
        value: ClientConfiguration,
    ) -> Result<(), PlatformError>;

    /// Register for value-changed events of a characteristic.
    fn watch_value(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicHandle,
    ) -> ListenerToken;

    fn unwatch_value(&self, characteristic: CharacteristicHandle, token: ListenerToken);

    async fn read_descriptor(&self, descriptor: DescriptorHandle) -> NativeResult<Vec<u8>>;

    async fn write_descriptor(
        &self,
        descriptor: DescriptorHandle,
        data: Vec<u8>,
    ) -> Result<(), PlatformError>;
}
