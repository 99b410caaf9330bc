//! In-process BLE simulator
//!
//! [`SimPlatform`] implements [`Platform`] over an in-memory radio and GATT
//! database. Peers advertise, accept connections, serve reads and writes,
//! push notifications and drop links on request. Every native call is
//! counted and can be made to fail, which is what the session tests lean on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::advertisement::{
    DataSection, AD_COMPLETE_UUIDS_16, AD_MANUFACTURER_DATA, AD_SERVICE_DATA_128,
    AD_SERVICE_DATA_16, AD_SERVICE_DATA_32, AD_TX_POWER_LEVEL,
};
use super::transport::{
    AdapterCapabilities, AdapterInfo, AdvertisementKind, AdvertisementReport,
    CharacteristicHandle, CharacteristicInfo, ClientConfiguration, DescriptorHandle,
    DescriptorInfo, DeviceHandle, ListenerToken, Platform, PlatformEvent, RadioEvent, RadioPower,
    ServiceHandle, ServiceInfo, WatcherStatus, WriteKind,
};
use super::{NativeResult, PlatformError};
use crate::types::{BleUuid, CharacteristicProperties};

/// Default address of the simulated local adapter.
pub const SIM_ADAPTER_ADDRESS: u64 = 0x001A_7DDA_7113;

/// Native operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    DefaultAdapter,
    StartWatcher,
    Connect,
    OpenSession,
    Services,
    ServicesForUuid,
    IncludedServices,
    Characteristics,
    CharacteristicsForUuid,
    Descriptors,
    DescriptorsForUuid,
    ReadCharacteristic,
    WriteCharacteristic,
    WriteClientConfiguration,
    ReadDescriptor,
    WriteDescriptor,
}

/// An injected outcome for the next call of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFailure {
    Error(PlatformError),
    /// Complete successfully with a null result. Calls without a result
    /// report `PlatformError::Failed` instead.
    NullResult,
}

#[derive(Debug, Clone)]
pub struct SimDescriptor {
    uuid: BleUuid,
    handle: DescriptorHandle,
    value: Vec<u8>,
}

impl SimDescriptor {
    pub fn new(uuid: BleUuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            handle: DescriptorHandle::new(0),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimCharacteristic {
    uuid: BleUuid,
    handle: CharacteristicHandle,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    configuration: ClientConfiguration,
    descriptors: Vec<SimDescriptor>,
}

impl SimCharacteristic {
    pub fn new(uuid: BleUuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            handle: CharacteristicHandle::new(0),
            properties,
            value: Vec::new(),
            configuration: ClientConfiguration::None,
            descriptors: Vec::new(),
        }
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn descriptor(mut self, descriptor: SimDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimService {
    uuid: BleUuid,
    handle: ServiceHandle,
    includes: Vec<BleUuid>,
    characteristics: Vec<SimCharacteristic>,
}

impl SimService {
    pub fn new(uuid: BleUuid) -> Self {
        Self {
            uuid,
            handle: ServiceHandle::new(0),
            includes: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn characteristic(mut self, characteristic: SimCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Reference another service of the same peer as included.
    pub fn include(mut self, uuid: BleUuid) -> Self {
        self.includes.push(uuid);
        self
    }
}

/// A simulated peer: what it advertises and the GATT database it serves.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    address: u64,
    rssi: i16,
    connectable: bool,
    name: Option<String>,
    tx_power: Option<i8>,
    manufacturer_data: Option<Vec<u8>>,
    advertised_services: Vec<BleUuid>,
    service_data: Vec<(BleUuid, Vec<u8>)>,
    mtu: u16,
    services: Vec<SimService>,
}

impl SimPeripheral {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            rssi: -60,
            connectable: true,
            name: None,
            tx_power: None,
            manufacturer_data: None,
            advertised_services: Vec::new(),
            service_data: Vec::new(),
            mtu: 247,
            services: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    pub fn tx_power(mut self, level: i8) -> Self {
        self.tx_power = Some(level);
        self
    }

    pub fn manufacturer_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data = Some(data.into());
        self
    }

    pub fn advertise_service(mut self, uuid: BleUuid) -> Self {
        self.advertised_services.push(uuid);
        self
    }

    pub fn service_data(mut self, uuid: BleUuid, data: impl Into<Vec<u8>>) -> Self {
        self.service_data.push((uuid, data.into()));
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn service(mut self, service: SimService) -> Self {
        self.services.push(service);
        self
    }

    /// The advertisement this peer currently broadcasts.
    pub fn report(&self) -> AdvertisementReport {
        let mut sections = Vec::new();
        let short_uuids: Vec<u8> = self
            .advertised_services
            .iter()
            .filter_map(|uuid| uuid.short())
            .filter(|short| *short <= 0xFFFF)
            .flat_map(|short| (short as u16).to_le_bytes())
            .collect();
        if !short_uuids.is_empty() {
            sections.push(DataSection::new(AD_COMPLETE_UUIDS_16, short_uuids));
        }
        if let Some(level) = self.tx_power {
            sections.push(DataSection::new(AD_TX_POWER_LEVEL, vec![level as u8]));
        }
        for (uuid, payload) in &self.service_data {
            let (data_type, mut data) = match uuid.short() {
                Some(short) if short <= 0xFFFF => {
                    (AD_SERVICE_DATA_16, (short as u16).to_le_bytes().to_vec())
                }
                Some(short) => (AD_SERVICE_DATA_32, short.to_le_bytes().to_vec()),
                None => (AD_SERVICE_DATA_128, uuid.to_le_bytes().to_vec()),
            };
            data.extend_from_slice(payload);
            sections.push(DataSection::new(data_type, data));
        }
        if let Some(data) = &self.manufacturer_data {
            sections.push(DataSection::new(AD_MANUFACTURER_DATA, data.clone()));
        }
        AdvertisementReport {
            address: self.address,
            rssi: self.rssi,
            kind: if self.connectable {
                AdvertisementKind::ConnectableUndirected
            } else {
                AdvertisementKind::NonConnectableUndirected
            },
            local_name: self.name.clone(),
            sections,
            service_uuids: self.advertised_services.clone(),
        }
    }
}

/// Position of a GATT attribute inside the database.
#[derive(Debug, Clone, Copy)]
enum Node {
    Service {
        address: u64,
        service: usize,
    },
    Characteristic {
        address: u64,
        service: usize,
        characteristic: usize,
    },
    Descriptor {
        address: u64,
        service: usize,
        characteristic: usize,
        descriptor: usize,
    },
}

struct SimState {
    adapter: Option<AdapterInfo>,
    watcher: WatcherStatus,
    acknowledge_stop: bool,
    peripherals: HashMap<u64, SimPeripheral>,
    nodes: HashMap<u64, Node>,
    /// Open device objects and the address each refers to.
    devices: HashMap<DeviceHandle, u64>,
    connection_listeners: HashMap<ListenerToken, DeviceHandle>,
    value_listeners: HashMap<ListenerToken, (DeviceHandle, CharacteristicHandle)>,
    failures: HashMap<SimOp, VecDeque<SimFailure>>,
    calls: HashMap<SimOp, usize>,
    closed: Vec<DeviceHandle>,
    connect_latency: Duration,
    gatt_latency: Duration,
}

impl SimState {
    fn is_linked(&self, address: u64) -> bool {
        self.devices.values().any(|linked| *linked == address)
    }

    fn device(&self, device: DeviceHandle) -> Result<&SimPeripheral, PlatformError> {
        self.devices
            .get(&device)
            .and_then(|address| self.peripherals.get(address))
            .ok_or(PlatformError::Unreachable)
    }

    /// Resolve a handle to its node, failing if the owning peer is not
    /// connected.
    fn node(&self, raw: u64) -> Result<Node, PlatformError> {
        let node = *self.nodes.get(&raw).ok_or(PlatformError::Failed)?;
        let address = match node {
            Node::Service { address, .. }
            | Node::Characteristic { address, .. }
            | Node::Descriptor { address, .. } => address,
        };
        if self.is_linked(address) {
            Ok(node)
        } else {
            Err(PlatformError::Unreachable)
        }
    }

    fn service(&self, handle: ServiceHandle) -> Result<(&SimPeripheral, &SimService), PlatformError> {
        match self.node(handle.raw())? {
            Node::Service { address, service } => {
                let peer = self.peripherals.get(&address).ok_or(PlatformError::Failed)?;
                Ok((peer, &peer.services[service]))
            }
            _ => Err(PlatformError::Failed),
        }
    }

    fn characteristic_mut(
        &mut self,
        handle: CharacteristicHandle,
    ) -> Result<&mut SimCharacteristic, PlatformError> {
        match self.node(handle.raw())? {
            Node::Characteristic {
                address,
                service,
                characteristic,
            } => self
                .peripherals
                .get_mut(&address)
                .map(|peer| &mut peer.services[service].characteristics[characteristic])
                .ok_or(PlatformError::Failed),
            _ => Err(PlatformError::Failed),
        }
    }

    fn descriptor_mut(&mut self, handle: DescriptorHandle) -> Result<&mut SimDescriptor, PlatformError> {
        match self.node(handle.raw())? {
            Node::Descriptor {
                address,
                service,
                characteristic,
                descriptor,
            } => self
                .peripherals
                .get_mut(&address)
                .map(|peer| {
                    &mut peer.services[service].characteristics[characteristic].descriptors
                        [descriptor]
                })
                .ok_or(PlatformError::Failed),
            _ => Err(PlatformError::Failed),
        }
    }

    fn find_characteristic(
        &self,
        address: u64,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<&SimCharacteristic> {
        self.peripherals
            .get(&address)?
            .services
            .iter()
            .find(|s| s.uuid == service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
    }
}

/// Simulated native platform.
pub struct SimPlatform {
    events: broadcast::Sender<PlatformEvent>,
    state: Mutex<SimState>,
    next_handle: AtomicU64,
}

impl SimPlatform {
    /// A platform with a powered-on, central-capable default adapter.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            state: Mutex::new(SimState {
                adapter: Some(Self::default_adapter_info()),
                watcher: WatcherStatus::Created,
                acknowledge_stop: true,
                peripherals: HashMap::new(),
                nodes: HashMap::new(),
                devices: HashMap::new(),
                connection_listeners: HashMap::new(),
                value_listeners: HashMap::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                closed: Vec::new(),
                connect_latency: Duration::ZERO,
                gatt_latency: Duration::ZERO,
            }),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn default_adapter_info() -> AdapterInfo {
        AdapterInfo {
            power: RadioPower::On,
            capabilities: AdapterCapabilities {
                address: SIM_ADAPTER_ADDRESS,
                classic_secure_connections: true,
                le_secure_connections: true,
                extended_advertising: true,
                low_energy: true,
                max_advertisement_length: 1650,
                peripheral_role: true,
                central_role: true,
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, event: PlatformEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// Count a call and pop its injected failure, if any.
    fn begin(&self, op: SimOp) -> Option<SimFailure> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        state.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    async fn gatt_latency(&self) {
        let latency = self.lock().gatt_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Run a counted GATT call that yields a value.
    async fn native<T>(
        &self,
        op: SimOp,
        body: impl FnOnce(&mut SimState) -> Result<T, PlatformError>,
    ) -> NativeResult<T> {
        let failure = self.begin(op);
        self.gatt_latency().await;
        match failure {
            Some(SimFailure::Error(err)) => Err(err),
            Some(SimFailure::NullResult) => Ok(None),
            None => body(&mut self.lock()).map(Some),
        }
    }

    /// Run a counted GATT call without a result value.
    async fn native_unit(
        &self,
        op: SimOp,
        body: impl FnOnce(&mut SimState) -> Result<(), PlatformError>,
    ) -> Result<(), PlatformError> {
        let failure = self.begin(op);
        self.gatt_latency().await;
        match failure {
            Some(SimFailure::Error(err)) => Err(err),
            Some(SimFailure::NullResult) => Err(PlatformError::Failed),
            None => body(&mut self.lock()),
        }
    }

    // ------------------------------------------------------------------
    // Scenario control
    // ------------------------------------------------------------------

    /// Add a peer, assigning handles to its GATT database.
    pub fn add_peripheral(&self, mut peripheral: SimPeripheral) {
        let address = peripheral.address;
        let mut nodes = Vec::new();
        for (s, service) in peripheral.services.iter_mut().enumerate() {
            service.handle = ServiceHandle::new(self.next_raw());
            nodes.push((service.handle.raw(), Node::Service { address, service: s }));
            for (c, characteristic) in service.characteristics.iter_mut().enumerate() {
                characteristic.handle = CharacteristicHandle::new(self.next_raw());
                nodes.push((
                    characteristic.handle.raw(),
                    Node::Characteristic {
                        address,
                        service: s,
                        characteristic: c,
                    },
                ));
                for (d, descriptor) in characteristic.descriptors.iter_mut().enumerate() {
                    descriptor.handle = DescriptorHandle::new(self.next_raw());
                    nodes.push((
                        descriptor.handle.raw(),
                        Node::Descriptor {
                            address,
                            service: s,
                            characteristic: c,
                            descriptor: d,
                        },
                    ));
                }
            }
        }
        let mut state = self.lock();
        state.nodes.extend(nodes);
        state.peripherals.insert(address, peripheral);
    }

    /// Broadcast the stored advertisement of a peer. Dropped unless the
    /// watcher is running.
    pub fn advertise(&self, address: u64) {
        let report = self.lock().peripherals.get(&address).map(SimPeripheral::report);
        if let Some(report) = report {
            self.advertise_report(report);
        }
    }

    pub fn advertise_report(&self, report: AdvertisementReport) {
        if self.lock().watcher == WatcherStatus::Started {
            self.send(PlatformEvent::Advertisement(report));
        }
    }

    /// Change what a peer advertises from now on.
    pub fn update_peripheral(&self, address: u64, update: impl FnOnce(SimPeripheral) -> SimPeripheral) {
        let mut state = self.lock();
        if let Some(peer) = state.peripherals.remove(&address) {
            state.peripherals.insert(address, update(peer));
        }
    }

    pub fn set_adapter(&self, adapter: Option<AdapterInfo>) {
        self.lock().adapter = adapter;
    }

    pub fn radio_event(&self, event: RadioEvent) {
        self.send(PlatformEvent::Radio(event));
    }

    /// When false, `stop_watcher` leaves the watcher in `Stopping` until
    /// [`confirm_watcher_stopped`](Self::confirm_watcher_stopped).
    pub fn set_watcher_acknowledges_stop(&self, acknowledge: bool) {
        self.lock().acknowledge_stop = acknowledge;
    }

    /// Stop the watcher from the platform side, as after a radio reset.
    pub fn confirm_watcher_stopped(&self) {
        self.lock().watcher = WatcherStatus::Stopped;
        self.send(PlatformEvent::WatcherStopped);
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        self.lock().watcher
    }

    /// Drop every link to a peer from the remote side.
    pub fn disconnect_peer(&self, address: u64) {
        let events: Vec<PlatformEvent> = {
            let mut state = self.lock();
            let devices: Vec<DeviceHandle> = state
                .devices
                .iter()
                .filter(|(_, linked)| **linked == address)
                .map(|(device, _)| *device)
                .collect();
            state.devices.retain(|_, linked| *linked != address);
            state
                .connection_listeners
                .iter()
                .filter(|(_, device)| devices.contains(device))
                .map(|(token, device)| PlatformEvent::ConnectionStatusChanged {
                    device: *device,
                    token: *token,
                    connected: false,
                })
                .collect()
        };
        for event in events {
            self.send(event);
        }
    }

    /// Push a new value to every listener of a characteristic.
    pub fn notify_value(
        &self,
        address: u64,
        service: BleUuid,
        characteristic: BleUuid,
        data: impl Into<Vec<u8>>,
    ) {
        let data = data.into();
        let events: Vec<PlatformEvent> = {
            let state = self.lock();
            let Some(handle) = state
                .find_characteristic(address, service, characteristic)
                .map(|c| c.handle)
            else {
                return;
            };
            state
                .value_listeners
                .iter()
                .filter(|(_, (_, watched))| *watched == handle)
                .map(|(token, (device, _))| PlatformEvent::ValueChanged {
                    device: *device,
                    characteristic: handle,
                    token: *token,
                    data: data.clone(),
                })
                .collect()
        };
        for event in events {
            self.send(event);
        }
    }

    /// Renegotiate the MTU of every open link to a peer.
    pub fn set_mtu(&self, address: u64, mtu: u16) {
        let devices: Vec<DeviceHandle> = {
            let mut state = self.lock();
            if let Some(peer) = state.peripherals.get_mut(&address) {
                peer.mtu = mtu;
            }
            state
                .devices
                .iter()
                .filter(|(_, linked)| **linked == address)
                .map(|(device, _)| *device)
                .collect()
        };
        for device in devices {
            self.send(PlatformEvent::MtuChanged { device, mtu });
        }
    }

    pub fn fail_next(&self, op: SimOp, failure: SimFailure) {
        self.lock().failures.entry(op).or_default().push_back(failure);
    }

    /// Number of times an operation was called.
    pub fn calls(&self, op: SimOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Devices closed so far, in order, including repeats.
    pub fn closed_devices(&self) -> Vec<DeviceHandle> {
        self.lock().closed.clone()
    }

    pub fn is_connected(&self, address: u64) -> bool {
        self.lock().is_linked(address)
    }

    pub fn connection_listener_count(&self) -> usize {
        self.lock().connection_listeners.len()
    }

    pub fn value_listener_count(&self) -> usize {
        self.lock().value_listeners.len()
    }

    pub fn characteristic_value(
        &self,
        address: u64,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<Vec<u8>> {
        self.lock()
            .find_characteristic(address, service, characteristic)
            .map(|c| c.value.clone())
    }

    pub fn client_configuration(
        &self,
        address: u64,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<ClientConfiguration> {
        self.lock()
            .find_characteristic(address, service, characteristic)
            .map(|c| c.configuration)
    }

    /// Delay applied to every connect call. Uses tokio time, so paused
    /// clocks advance instantly in tests.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.lock().connect_latency = latency;
    }

    /// Delay applied to every GATT call.
    pub fn set_gatt_latency(&self, latency: Duration) {
        self.lock().gatt_latency = latency;
    }
}

#[async_trait]
impl Platform for SimPlatform {
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }

    fn start_radio_watch(&self) {
        if self.lock().adapter.is_some() {
            self.send(PlatformEvent::Radio(RadioEvent::Added));
        }
        self.send(PlatformEvent::Radio(RadioEvent::EnumerationCompleted));
    }

    async fn default_adapter(&self) -> Result<Option<AdapterInfo>, PlatformError> {
        match self.begin(SimOp::DefaultAdapter) {
            Some(SimFailure::Error(err)) => Err(err),
            Some(SimFailure::NullResult) => Ok(None),
            None => Ok(self.lock().adapter.clone()),
        }
    }

    fn start_watcher(&self) -> Result<(), PlatformError> {
        match self.begin(SimOp::StartWatcher) {
            Some(SimFailure::Error(err)) => Err(err),
            Some(SimFailure::NullResult) => Err(PlatformError::Failed),
            None => {
                self.lock().watcher = WatcherStatus::Started;
                Ok(())
            }
        }
    }

    fn stop_watcher(&self) -> WatcherStatus {
        let mut state = self.lock();
        if state.watcher == WatcherStatus::Started || state.watcher == WatcherStatus::Stopping {
            state.watcher = if state.acknowledge_stop {
                WatcherStatus::Stopped
            } else {
                WatcherStatus::Stopping
            };
        }
        state.watcher
    }

    async fn connect(&self, address: u64) -> NativeResult<DeviceHandle> {
        let failure = self.begin(SimOp::Connect);
        let latency = self.lock().connect_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(SimFailure::Error(err)) => Err(err),
            Some(SimFailure::NullResult) => Ok(None),
            None => {
                let mut state = self.lock();
                if !state.peripherals.contains_key(&address) {
                    return Ok(None);
                }
                let device = DeviceHandle::new(self.next_raw());
                state.devices.insert(device, address);
                Ok(Some(device))
            }
        }
    }

    fn watch_connection(&self, device: DeviceHandle) -> ListenerToken {
        let token = ListenerToken::new(self.next_raw());
        self.lock().connection_listeners.insert(token, device);
        token
    }

    fn unwatch_connection(&self, _device: DeviceHandle, token: ListenerToken) {
        self.lock().connection_listeners.remove(&token);
    }

    fn close_device(&self, device: DeviceHandle) {
        let mut state = self.lock();
        state.devices.remove(&device);
        state.closed.push(device);
    }

    async fn open_session(&self, device: DeviceHandle) -> NativeResult<u16> {
        self.native(SimOp::OpenSession, |state| Ok(state.device(device)?.mtu))
            .await
    }

    async fn services(&self, device: DeviceHandle) -> NativeResult<Vec<ServiceInfo>> {
        self.native(SimOp::Services, |state| {
            Ok(state
                .device(device)?
                .services
                .iter()
                .map(|s| ServiceInfo {
                    uuid: s.uuid,
                    handle: s.handle,
                })
                .collect())
        })
        .await
    }

    async fn services_for_uuid(
        &self,
        device: DeviceHandle,
        uuid: BleUuid,
    ) -> NativeResult<Vec<ServiceInfo>> {
        self.native(SimOp::ServicesForUuid, |state| {
            Ok(state
                .device(device)?
                .services
                .iter()
                .filter(|s| s.uuid == uuid)
                .map(|s| ServiceInfo {
                    uuid: s.uuid,
                    handle: s.handle,
                })
                .collect())
        })
        .await
    }

    async fn included_services(&self, service: ServiceHandle) -> NativeResult<Vec<ServiceInfo>> {
        self.native(SimOp::IncludedServices, |state| {
            let (peer, parent) = state.service(service)?;
            Ok(peer
                .services
                .iter()
                .filter(|s| parent.includes.contains(&s.uuid))
                .map(|s| ServiceInfo {
                    uuid: s.uuid,
                    handle: s.handle,
                })
                .collect())
        })
        .await
    }

    async fn characteristics(
        &self,
        service: ServiceHandle,
    ) -> NativeResult<Vec<CharacteristicInfo>> {
        self.native(SimOp::Characteristics, |state| {
            let (_, parent) = state.service(service)?;
            Ok(parent.characteristics.iter().map(characteristic_info).collect())
        })
        .await
    }

    async fn characteristics_for_uuid(
        &self,
        service: ServiceHandle,
        uuid: BleUuid,
    ) -> NativeResult<Vec<CharacteristicInfo>> {
        self.native(SimOp::CharacteristicsForUuid, |state| {
            let (_, parent) = state.service(service)?;
            Ok(parent
                .characteristics
                .iter()
                .filter(|c| c.uuid == uuid)
                .map(characteristic_info)
                .collect())
        })
        .await
    }

    async fn descriptors(
        &self,
        characteristic: CharacteristicHandle,
    ) -> NativeResult<Vec<DescriptorInfo>> {
        self.native(SimOp::Descriptors, |state| {
            let parent = state.characteristic_mut(characteristic)?;
            Ok(parent.descriptors.iter().map(descriptor_info).collect())
        })
        .await
    }

    async fn descriptors_for_uuid(
        &self,
        characteristic: CharacteristicHandle,
        uuid: BleUuid,
    ) -> NativeResult<Vec<DescriptorInfo>> {
        self.native(SimOp::DescriptorsForUuid, |state| {
            let parent = state.characteristic_mut(characteristic)?;
            Ok(parent
                .descriptors
                .iter()
                .filter(|d| d.uuid == uuid)
                .map(descriptor_info)
                .collect())
        })
        .await
    }

    async fn read_characteristic(
        &self,
        characteristic: CharacteristicHandle,
    ) -> NativeResult<Vec<u8>> {
        self.native(SimOp::ReadCharacteristic, |state| {
            let target = state.characteristic_mut(characteristic)?;
            if !target.properties.contains(CharacteristicProperties::READ) {
                return Err(PlatformError::ProtocolError(0x02));
            }
            Ok(target.value.clone())
        })
        .await
    }

    async fn write_characteristic(
        &self,
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), PlatformError> {
        self.native_unit(SimOp::WriteCharacteristic, |state| {
            let target = state.characteristic_mut(characteristic)?;
            let required = match kind {
                WriteKind::WithResponse => CharacteristicProperties::WRITE,
                WriteKind::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            };
            if !target.properties.contains(required) {
                return Err(PlatformError::ProtocolError(0x03));
            }
            target.value = data;
            Ok(())
        })
        .await
    }

    async fn write_client_configuration(
        &self,
        characteristic: CharacteristicHandle,
        value: ClientConfiguration,
    ) -> Result<(), PlatformError> {
        self.native_unit(SimOp::WriteClientConfiguration, |state| {
            let target = state.characteristic_mut(characteristic)?;
            let supported = match value {
                ClientConfiguration::None => true,
                ClientConfiguration::Notify => {
                    target.properties.contains(CharacteristicProperties::NOTIFY)
                }
                ClientConfiguration::Indicate => {
                    target.properties.contains(CharacteristicProperties::INDICATE)
                }
            };
            if !supported {
                return Err(PlatformError::ProtocolError(0x03));
            }
            target.configuration = value;
            Ok(())
        })
        .await
    }

    fn watch_value(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicHandle,
    ) -> ListenerToken {
        let token = ListenerToken::new(self.next_raw());
        self.lock()
            .value_listeners
            .insert(token, (device, characteristic));
        token
    }

    fn unwatch_value(&self, _characteristic: CharacteristicHandle, token: ListenerToken) {
        self.lock().value_listeners.remove(&token);
    }

    async fn read_descriptor(&self, descriptor: DescriptorHandle) -> NativeResult<Vec<u8>> {
        self.native(SimOp::ReadDescriptor, |state| {
            Ok(state.descriptor_mut(descriptor)?.value.clone())
        })
        .await
    }

    async fn write_descriptor(
        &self,
        descriptor: DescriptorHandle,
        data: Vec<u8>,
    ) -> Result<(), PlatformError> {
        self.native_unit(SimOp::WriteDescriptor, |state| {
            state.descriptor_mut(descriptor)?.value = data;
            Ok(())
        })
        .await
    }
}

fn characteristic_info(characteristic: &SimCharacteristic) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: characteristic.uuid,
        handle: characteristic.handle,
        properties: characteristic.properties,
    }
}

fn descriptor_info(descriptor: &SimDescriptor) -> DescriptorInfo {
    DescriptorInfo {
        uuid: descriptor.uuid,
        handle: descriptor.handle,
    }
}
