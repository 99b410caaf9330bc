//! Scan filter and discover deduplication

use std::collections::HashSet;

use super::Session;
use crate::ble::advertisement;
use crate::ble::transport::{AdvertisementReport, WatcherStatus};
use crate::event::Event;
use crate::types::{format_id, BleUuid, Peripheral, RadioState};

#[derive(Debug, Default)]
pub struct ScanSession {
    filter: HashSet<BleUuid>,
    allow_duplicates: bool,
    /// Ids reported since the current scan started.
    seen: HashSet<String>,
    active: bool,
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new scan. Called before the watcher is started.
    pub fn start(&mut self, filter: Vec<BleUuid>, allow_duplicates: bool) {
        self.seen.clear();
        self.filter = filter.into_iter().collect();
        self.allow_duplicates = allow_duplicates;
    }

    /// The watcher is running.
    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Handle the status returned by a stop request. Returns true if
    /// scan-stopped should be reported now.
    pub fn stop(&mut self, status: WatcherStatus) -> bool {
        if status.is_terminal() {
            self.finish()
        } else {
            log::debug!("watcher still {:?} after stop request", status);
            false
        }
    }

    /// The platform reported the watcher stopped.
    pub fn on_watcher_stopped(&mut self) -> bool {
        self.finish()
    }

    fn finish(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    /// Whether a report passes the service filter: an embedded service-data
    /// UUID or an advertised service UUID must match.
    pub fn accepts(&self, report: &AdvertisementReport) -> bool {
        if self.filter.is_empty() {
            return true;
        }
        let in_service_data = report
            .sections
            .iter()
            .filter_map(advertisement::service_data)
            .any(|(uuid, _)| self.filter.contains(&uuid));
        in_service_data || report.service_uuids.iter().any(|uuid| self.filter.contains(uuid))
    }

    /// Mark an id seen and report whether a discover event is due.
    pub fn mark_seen(&mut self, id: &str) -> bool {
        let first = self.seen.insert(id.to_string());
        first || self.allow_duplicates
    }

    pub fn forget(&mut self, id: &str) {
        self.seen.remove(id);
    }
}

impl Session {
    pub(super) fn start_scan(&mut self, filter: Vec<BleUuid>, allow_duplicates: bool) {
        self.scan.start(filter, allow_duplicates);
        let radio = self.radio.state();
        if radio != RadioState::PoweredOn {
            log::warn!("Starting scan while radio is {}", radio);
        }
        if let Err(err) = self.native.platform().start_watcher() {
            log::error!("Could not start scanning: {}", err);
            return;
        }
        self.scan.activate();
        log::info!("Scan started (allow duplicates: {})", allow_duplicates);
        self.sink.emit(Event::ScanStart);
    }

    pub(super) fn stop_scan(&mut self) {
        let status = self.native.platform().stop_watcher();
        if self.scan.stop(status) {
            log::info!("Scan stopped");
            self.sink.emit(Event::ScanStop);
        }
    }

    pub(super) fn on_watcher_stopped(&mut self) {
        if self.scan.on_watcher_stopped() {
            log::info!("Scan stopped by platform");
            self.sink.emit(Event::ScanStop);
        }
    }

    pub(super) fn on_advertisement(&mut self, report: AdvertisementReport) {
        if !self.scan.accepts(&report) {
            return;
        }
        let id = format_id(report.address);
        match self.registry.get_mut(&id) {
            Some(entry) => entry.peripheral.apply_report(&report),
            None => self.insert_peripheral(Peripheral::from_report(&report)),
        }
        self.registry.touch(&id);

        if self.scan.mark_seen(&id) {
            if let Some(entry) = self.registry.get(&id) {
                self.sink.emit(Event::discover(&entry.peripheral));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertisement::{DataSection, AD_SERVICE_DATA_16};
    use crate::ble::transport::AdvertisementKind;

    fn report(service_uuids: Vec<BleUuid>, sections: Vec<DataSection>) -> AdvertisementReport {
        AdvertisementReport {
            address: 0x0A0B_0C0D_0E0F,
            rssi: -55,
            kind: AdvertisementKind::ConnectableUndirected,
            local_name: None,
            sections,
            service_uuids,
        }
    }

    #[test]
    fn test_empty_filter_accepts_all() {
        let scan = ScanSession::new();
        assert!(scan.accepts(&report(vec![], vec![])));
    }

    #[test]
    fn test_filter_matches_service_uuid_or_service_data() {
        let mut scan = ScanSession::new();
        scan.start(vec![BleUuid::from_u16(0x180D)], false);

        assert!(scan.accepts(&report(vec![BleUuid::from_u16(0x180D)], vec![])));
        assert!(scan.accepts(&report(
            vec![],
            vec![DataSection::new(AD_SERVICE_DATA_16, vec![0x0D, 0x18, 0x01])],
        )));
        assert!(!scan.accepts(&report(
            vec![BleUuid::from_u16(0x180F)],
            vec![DataSection::new(AD_SERVICE_DATA_16, vec![0x0F, 0x18, 0x01])],
        )));
    }

    #[test]
    fn test_dedup_and_restart() {
        let mut scan = ScanSession::new();
        scan.start(vec![], false);
        assert!(scan.mark_seen("aabbccddeeff"));
        assert!(!scan.mark_seen("aabbccddeeff"));

        scan.start(vec![], false);
        assert!(scan.mark_seen("aabbccddeeff"));

        scan.start(vec![], true);
        assert!(scan.mark_seen("aabbccddeeff"));
        assert!(scan.mark_seen("aabbccddeeff"));
    }

    #[test]
    fn test_stop_requires_terminal_status_once() {
        let mut scan = ScanSession::new();
        scan.start(vec![], false);
        scan.activate();

        assert!(!scan.stop(WatcherStatus::Stopping));
        assert!(scan.is_active());
        assert!(scan.on_watcher_stopped());
        assert!(!scan.on_watcher_stopped());
        assert!(!scan.stop(WatcherStatus::Stopped));
    }
}
