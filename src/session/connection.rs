//! Peripheral table and connection lifecycle
//!
//! A peripheral may exist without a connection; a [`ConnectionState`] exists
//! exactly while a native device handle is held. The handle lives in a
//! [`NativeLink`] whose drop unregisters the status listener and closes the
//! device, so every teardown path (disconnect, cancel, link loss, shutdown)
//! releases it exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use super::gatt_cache::GattCache;
use super::notify::NotificationRegistry;
use super::{Completion, Session};
use crate::ble::transport::{DeviceHandle, ListenerToken, Platform};
use crate::ble::NativeResult;
use crate::event::Event;
use crate::types::{canonical_id, parse_address, Peripheral};

/// Identity of one connection of one peripheral. Work started on a
/// connection carries its token; a token whose epoch no longer matches
/// belongs to a connection that is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkToken {
    pub id: String,
    pub epoch: u64,
}

/// Scoped ownership of an open native device.
pub struct NativeLink {
    platform: Arc<dyn Platform>,
    device: DeviceHandle,
    listener: ListenerToken,
}

impl NativeLink {
    /// Take ownership of `device` and watch its connection status.
    pub fn open(platform: Arc<dyn Platform>, device: DeviceHandle) -> Self {
        let listener = platform.watch_connection(device);
        Self {
            platform,
            device,
            listener,
        }
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn listener(&self) -> ListenerToken {
        self.listener
    }
}

impl Drop for NativeLink {
    fn drop(&mut self) {
        self.platform.unwatch_connection(self.device, self.listener);
        self.platform.close_device(self.device);
    }
}

/// A live connection.
pub struct ConnectionState {
    // Field order is drop order: subscriptions and cache go before the link.
    pub notifications: NotificationRegistry,
    pub cache: GattCache,
    pub mtu: Option<u16>,
    epoch: u64,
    link: NativeLink,
}

impl ConnectionState {
    pub fn new(link: NativeLink, epoch: u64) -> Self {
        Self {
            notifications: NotificationRegistry::new(),
            cache: GattCache::new(),
            mtu: None,
            epoch,
            link,
        }
    }

    pub fn device(&self) -> DeviceHandle {
        self.link.device()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Record an MTU; returns true if it changed.
    pub fn update_mtu(&mut self, mtu: u16) -> bool {
        if self.mtu == Some(mtu) {
            return false;
        }
        self.mtu = Some(mtu);
        true
    }
}

pub struct PeripheralEntry {
    pub peripheral: Peripheral,
    pub connection: Option<ConnectionState>,
    /// Attempt id of the connect in flight, if any.
    pub pending_connect: Option<u64>,
    last_touched: u64,
}

impl PeripheralEntry {
    fn is_idle(&self) -> bool {
        self.connection.is_none() && self.pending_connect.is_none()
    }
}

/// All known peripherals, keyed by canonical id.
pub struct ConnectionRegistry {
    entries: HashMap<String, PeripheralEntry>,
    max_peripherals: Option<usize>,
    clock: u64,
    attempts: u64,
}

impl ConnectionRegistry {
    pub fn new(max_peripherals: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            max_peripherals,
            clock: 0,
            attempts: 0,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PeripheralEntry> {
        self.entries.get_mut(id)
    }

    pub fn connected_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.connection.is_some())
            .count()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Mark a peripheral recently used for bounded-table eviction.
    pub fn touch(&mut self, id: &str) {
        let now = self.tick();
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_touched = now;
        }
    }

    /// Add a peripheral. In bounded mode, returns the ids evicted to make
    /// room; only peripherals with no connection and no connect in flight
    /// are eligible.
    pub fn insert(&mut self, peripheral: Peripheral) -> Vec<String> {
        let id = peripheral.id.clone();
        let now = self.tick();
        self.entries.insert(
            id.clone(),
            PeripheralEntry {
                peripheral,
                connection: None,
                pending_connect: None,
                last_touched: now,
            },
        );

        let mut evicted = Vec::new();
        let Some(max) = self.max_peripherals else {
            return evicted;
        };
        while self.entries.len() > max {
            let victim = self
                .entries
                .iter()
                .filter(|(key, entry)| **key != id && entry.is_idle())
                .min_by_key(|(_, entry)| entry.last_touched)
                .map(|(key, _)| key.clone());
            match victim {
                Some(victim) => {
                    log::debug!("evicting peripheral {}", victim);
                    self.entries.remove(&victim);
                    evicted.push(victim);
                }
                None => {
                    log::warn!(
                        "Peripheral table over its limit of {}: nothing evictable",
                        max
                    );
                    break;
                }
            }
        }
        evicted
    }

    /// Register a new connect attempt, superseding any earlier one.
    pub fn begin_connect(&mut self, id: &str) -> Option<u64> {
        self.attempts += 1;
        let attempt = self.attempts;
        let now = self.tick();
        let entry = self.entries.get_mut(id)?;
        entry.pending_connect = Some(attempt);
        entry.last_touched = now;
        Some(attempt)
    }

    /// The live connection a token belongs to, if it is still live.
    pub fn connection(&mut self, link: &LinkToken) -> Option<&mut ConnectionState> {
        self.entries
            .get_mut(&link.id)?
            .connection
            .as_mut()
            .filter(|conn| conn.epoch == link.epoch)
    }

    pub fn connection_by_device(
        &mut self,
        device: DeviceHandle,
    ) -> Option<(&String, &mut ConnectionState)> {
        self.entries.iter_mut().find_map(|(id, entry)| {
            entry
                .connection
                .as_mut()
                .filter(|conn| conn.device() == device)
                .map(|conn| (id, conn))
        })
    }

    /// Id of the peripheral whose link matches a status listener delivery.
    fn find_link(&self, device: DeviceHandle, listener: ListenerToken) -> Option<String> {
        self.entries.iter().find_map(|(id, entry)| {
            entry
                .connection
                .as_ref()
                .filter(|conn| conn.device() == device && conn.link.listener() == listener)
                .map(|_| id.clone())
        })
    }

    /// Drop the connection and any connect in flight. Returns false if the
    /// peripheral is unknown.
    pub fn teardown(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.pending_connect = None;
        if entry.connection.take().is_some() {
            log::info!("Released connection to {}", id);
        }
        true
    }
}

impl Session {
    /// Add a peripheral to the table, keeping scan dedup in step with
    /// evictions.
    pub(super) fn insert_peripheral(&mut self, peripheral: Peripheral) {
        for evicted in self.registry.insert(peripheral) {
            self.scan.forget(&evicted);
        }
    }

    pub(super) fn connect(&mut self, address: &str) {
        let Some(id) = canonical_id(address) else {
            log::warn!("Rejecting connect to malformed address {:?}", address);
            self.sink.emit(Event::Connect {
                id: address.to_string(),
                error: Some("invalid device address format".to_string()),
            });
            return;
        };

        if !self.registry.contains(&id) {
            let Some(raw) = parse_address(&id) else {
                return;
            };
            let peripheral = Peripheral::synthesized(raw, self.config.direct_connect_rssi);
            self.sink.emit(Event::discover(&peripheral));
            self.insert_peripheral(peripheral);
        }

        let address = match self.registry.get(&id) {
            Some(entry) if entry.connection.is_some() => {
                self.sink.emit(Event::Connect { id, error: None });
                return;
            }
            Some(entry) => entry.peripheral.address,
            None => return,
        };
        let Some(attempt) = self.registry.begin_connect(&id) else {
            return;
        };
        log::info!("Connecting to {} (attempt {})", id, attempt);
        self.native.spawn(move |platform| async move {
            Completion::Connect {
                id,
                attempt,
                result: platform.connect(address).await,
            }
        });
    }

    pub(super) fn on_connect_complete(
        &mut self,
        id: String,
        attempt: u64,
        result: NativeResult<DeviceHandle>,
    ) {
        let entry = match self.registry.get_mut(&id) {
            Some(entry) if entry.pending_connect == Some(attempt) => entry,
            _ => {
                log::debug!("discarding stale connect attempt {} for {}", attempt, id);
                if let Ok(Some(device)) = result {
                    self.native.platform().close_device(device);
                }
                return;
            }
        };
        entry.pending_connect = None;

        let device = match result {
            Ok(Some(device)) => device,
            Ok(None) => {
                log::warn!("Connect to {} returned no device", id);
                self.sink.emit(Event::Connect {
                    id,
                    error: Some("could not connect to device: result is null".to_string()),
                });
                return;
            }
            Err(err) => {
                log::warn!("Connect to {} failed: {}", id, err);
                self.sink.emit(Event::Connect {
                    id,
                    error: Some(format!("could not connect to device: {}", err)),
                });
                return;
            }
        };

        let link = NativeLink::open(Arc::clone(self.native.platform()), device);
        entry.connection = Some(ConnectionState::new(link, attempt));
        log::info!("Connected to {}", id);
        self.sink.emit(Event::Connect {
            id: id.clone(),
            error: None,
        });

        let link = LinkToken { id, epoch: attempt };
        self.native.spawn(move |platform| async move {
            Completion::SessionOpened {
                link,
                result: platform.open_session(device).await,
            }
        });
    }

    pub(super) fn on_session_opened(&mut self, link: LinkToken, result: NativeResult<u16>) {
        let Some(conn) = self.registry.connection(&link) else {
            log::debug!("discarding GATT session result for {}: link gone", link.id);
            return;
        };
        match result {
            Ok(Some(mtu)) => {
                if conn.update_mtu(mtu) {
                    self.sink.emit(Event::Mtu { id: link.id, mtu });
                }
            }
            Ok(None) => log::warn!("GATT session for {} returned no result", link.id),
            Err(err) => log::warn!("Could not open GATT session for {}: {}", link.id, err),
        }
    }

    pub(super) fn on_mtu_changed(&mut self, device: DeviceHandle, mtu: u16) {
        let Some((id, conn)) = self.registry.connection_by_device(device) else {
            return;
        };
        if conn.update_mtu(mtu) {
            self.sink.emit(Event::Mtu { id: id.clone(), mtu });
        }
    }

    pub(super) fn on_connection_status(
        &mut self,
        device: DeviceHandle,
        listener: ListenerToken,
        connected: bool,
    ) {
        if connected {
            return;
        }
        let Some(id) = self.registry.find_link(device, listener) else {
            log::debug!("status change for unknown link {:?}", device);
            return;
        };
        log::info!("Peripheral {} disconnected", id);
        self.registry.teardown(&id);
        self.sink.emit(Event::Disconnect { id });
    }

    pub(super) fn disconnect(&mut self, address: &str) {
        match canonical_id(address) {
            Some(id) if self.registry.teardown(&id) => {
                self.sink.emit(Event::Disconnect { id });
            }
            _ => log::warn!("Disconnect: device {} not found", address),
        }
    }

    pub(super) fn cancel_connect(&mut self, address: &str) {
        match canonical_id(address) {
            Some(id) if self.registry.teardown(&id) => {
                log::info!("Cancelled connection to {}", id);
            }
            _ => log::warn!("Cancel connect: device {} not found", address),
        }
    }

    pub(super) fn update_rssi(&mut self, address: &str) {
        let entry = canonical_id(address).and_then(|id| self.registry.get(&id));
        match entry {
            Some(entry) => self.sink.emit(Event::RssiUpdate {
                id: entry.peripheral.id.clone(),
                rssi: entry.peripheral.rssi,
            }),
            None => log::warn!("Update RSSI: device {} not found", address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimPeripheral, SimPlatform};

    fn peripheral(address: u64) -> Peripheral {
        Peripheral::synthesized(address, -50)
    }

    #[test]
    fn test_unbounded_by_default() {
        let mut registry = ConnectionRegistry::new(None);
        for address in 0..100 {
            assert!(registry.insert(peripheral(address)).is_empty());
        }
        assert!((0..100).all(|address| registry.contains(&format!("{:012x}", address))));
    }

    #[test]
    fn test_bounded_evicts_least_recent_idle() {
        let mut registry = ConnectionRegistry::new(Some(2));
        registry.insert(peripheral(1));
        registry.insert(peripheral(2));
        registry.touch("000000000001");

        assert_eq!(registry.insert(peripheral(3)), vec!["000000000002".to_string()]);
        assert!(registry.contains("000000000001"));
        assert!(registry.contains("000000000003"));
    }

    #[test]
    fn test_bounded_skips_busy_peripherals() {
        let mut registry = ConnectionRegistry::new(Some(1));
        registry.insert(peripheral(1));
        registry.begin_connect("000000000001").unwrap();

        assert!(registry.insert(peripheral(2)).is_empty());
        assert!(registry.contains("000000000001"));
        assert!(registry.contains("000000000002"));
    }

    #[tokio::test]
    async fn test_link_released_once_on_teardown() {
        let sim = SimPlatform::new();
        sim.add_peripheral(SimPeripheral::new(1));
        let platform: Arc<dyn Platform> = sim.clone();
        let device = platform.connect(1).await.unwrap().unwrap();

        let mut registry = ConnectionRegistry::new(None);
        registry.insert(peripheral(1));
        let attempt = registry.begin_connect("000000000001").unwrap();
        let entry = registry.get_mut("000000000001").unwrap();
        entry.pending_connect = None;
        entry.connection = Some(ConnectionState::new(
            NativeLink::open(Arc::clone(&platform), device),
            attempt,
        ));
        assert_eq!(sim.connection_listener_count(), 1);

        let link = LinkToken {
            id: "000000000001".into(),
            epoch: attempt,
        };
        assert!(registry.connection(&link).is_some());
        assert!(registry
            .connection(&LinkToken {
                epoch: attempt + 1,
                ..link.clone()
            })
            .is_none());

        assert!(registry.teardown("000000000001"));
        assert!(registry.teardown("000000000001"));
        assert_eq!(sim.closed_devices(), vec![device]);
        assert_eq!(sim.connection_listener_count(), 0);
        assert!(registry.connection(&link).is_none());
        assert!(!registry.teardown("ffffffffffff"));
    }
}
