//! Session lifecycle integration tests
//!
//! Drives a `SessionManager` over `SimPlatform` through scanning,
//! connection, GATT resolution and notification scenarios, checking both
//! the emitted events and the native calls the session made.
//!
//! Run with:
//!   cargo test --test session_lifecycle

use std::sync::Arc;
use std::time::Duration;

use gatt_session::ble::simulated::{
    SimCharacteristic, SimDescriptor, SimFailure, SimOp, SimPeripheral, SimPlatform, SimService,
};
use gatt_session::ble::transport::{
    AdapterCapabilities, AdapterInfo, ClientConfiguration, RadioEvent, RadioPower,
};
use gatt_session::event::CharacteristicSummary;
use gatt_session::types::CharacteristicProperties;
use gatt_session::{
    event_channel, BleUuid, ConfigError, Event, PlatformError, RadioState, SessionConfig,
    SessionManager,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PEER: u64 = 0xAA_BB_CC_DD_EE_01;
const PEER_ID: &str = "aabbccddee01";
const OTHER: u64 = 0xAA_BB_CC_DD_EE_02;
const OTHER_ID: &str = "aabbccddee02";

const HEART_RATE: BleUuid = BleUuid::from_u16(0x180D);
const MEASUREMENT: BleUuid = BleUuid::from_u16(0x2A37);
const BODY_LOCATION: BleUuid = BleUuid::from_u16(0x2A38);
const BATTERY: BleUuid = BleUuid::from_u16(0x180F);
const BATTERY_LEVEL: BleUuid = BleUuid::from_u16(0x2A19);
const DEVICE_INFO: BleUuid = BleUuid::from_u16(0x180A);
const CLIENT_CONFIG: BleUuid = BleUuid::from_u16(0x2902);
const USER_DESCRIPTION: BleUuid = BleUuid::from_u16(0x2901);

fn heart_rate_monitor(address: u64) -> SimPeripheral {
    SimPeripheral::new(address)
        .name("HRM")
        .rssi(-48)
        .advertise_service(HEART_RATE)
        .service(
            SimService::new(HEART_RATE)
                .include(DEVICE_INFO)
                .characteristic(
                    SimCharacteristic::new(MEASUREMENT, CharacteristicProperties::NOTIFY)
                        .descriptor(SimDescriptor::new(CLIENT_CONFIG, vec![0x00, 0x00]))
                        .descriptor(SimDescriptor::new(USER_DESCRIPTION, b"bpm".to_vec())),
                )
                .characteristic(
                    SimCharacteristic::new(
                        BODY_LOCATION,
                        CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                    )
                    .value(vec![0x01]),
                ),
        )
        .service(
            SimService::new(BATTERY).characteristic(
                SimCharacteristic::new(
                    BATTERY_LEVEL,
                    CharacteristicProperties::READ
                        | CharacteristicProperties::NOTIFY
                        | CharacteristicProperties::INDICATE,
                )
                .value(vec![64]),
            ),
        )
        .service(SimService::new(DEVICE_INFO))
}

struct Harness {
    platform: Arc<SimPlatform>,
    session: SessionManager,
    events: UnboundedReceiver<Event>,
}

async fn start_with(config: SessionConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let platform = SimPlatform::new();
    platform.add_peripheral(heart_rate_monitor(PEER));
    platform.add_peripheral(heart_rate_monitor(OTHER).name("Other").advertise_service(BATTERY));

    let (sink, events) = event_channel();
    let session = SessionManager::spawn(platform.clone(), sink, config).unwrap();
    let mut harness = Harness {
        platform,
        session,
        events,
    };
    assert_eq!(
        harness.next().await,
        Event::StateChange {
            state: RadioState::PoweredOn
        }
    );
    assert_eq!(
        harness.next().await,
        Event::AddressChange {
            address: "00:1a:7d:da:71:13".into()
        }
    );
    harness
}

async fn start() -> Harness {
    start_with(SessionConfig::default()).await
}

impl Harness {
    async fn next(&mut self) -> Event {
        // Must exceed every simulated latency used below.
        timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Commands are handled in order, so once the RSSI report for a known
    /// peripheral arrives every earlier command has been handled.
    async fn sync(&mut self, id: &str) -> Event {
        self.session.update_rssi(id).unwrap();
        self.next().await
    }

    async fn scan(&mut self, filter: Vec<BleUuid>, allow_duplicates: bool) {
        self.session.start_scan(filter, allow_duplicates).unwrap();
        assert_eq!(self.next().await, Event::ScanStart);
    }

    async fn connect(&mut self, id: &str) {
        self.session.connect(id).unwrap();
        assert_eq!(
            self.next().await,
            Event::Connect {
                id: id.into(),
                error: None
            }
        );
        assert_eq!(
            self.next().await,
            Event::Mtu {
                id: id.into(),
                mtu: 247
            }
        );
    }

    /// Connect to a peripheral never seen advertising.
    async fn connect_direct(&mut self, id: &str) {
        self.session.connect(id).unwrap();
        assert!(matches!(self.next().await, Event::Discover { .. }));
        assert_eq!(
            self.next().await,
            Event::Connect {
                id: id.into(),
                error: None
            }
        );
        assert!(matches!(self.next().await, Event::Mtu { .. }));
    }
}

fn discovered_id(event: &Event) -> &str {
    match event {
        Event::Discover { id, .. } => id,
        other => panic!("expected discover, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_discover_once_without_duplicates() {
    let mut h = start().await;
    h.scan(Vec::new(), false).await;

    h.platform.advertise(PEER);
    h.platform.advertise(PEER);
    // Platform events arrive in order: OTHER marks the end of PEER's reports.
    h.platform.advertise(OTHER);

    assert_eq!(discovered_id(&h.next().await), PEER_ID);
    assert_eq!(discovered_id(&h.next().await), OTHER_ID);
    assert_eq!(
        h.sync(PEER_ID).await,
        Event::RssiUpdate {
            id: PEER_ID.into(),
            rssi: -48
        }
    );
}

#[tokio::test]
async fn test_discover_every_report_with_duplicates() {
    let mut h = start().await;
    h.scan(Vec::new(), true).await;

    h.platform.advertise(PEER);
    h.platform.advertise(PEER);
    h.platform.advertise(OTHER);

    assert_eq!(discovered_id(&h.next().await), PEER_ID);
    assert_eq!(discovered_id(&h.next().await), PEER_ID);
    assert_eq!(discovered_id(&h.next().await), OTHER_ID);
}

#[tokio::test]
async fn test_restarting_scan_resets_dedup() {
    let mut h = start().await;
    h.scan(Vec::new(), false).await;
    h.platform.advertise(PEER);
    assert_eq!(discovered_id(&h.next().await), PEER_ID);

    h.scan(Vec::new(), false).await;
    h.platform.advertise(PEER);
    assert_eq!(discovered_id(&h.next().await), PEER_ID);
}

#[tokio::test]
async fn test_advertisement_fields_follow_latest_report() {
    let mut h = start().await;
    h.scan(Vec::new(), true).await;

    h.platform
        .update_peripheral(PEER, |p| p.tx_power(-8).service_data(BATTERY, vec![90]));
    h.platform.advertise(PEER);
    let Event::Discover { advertisement, .. } = h.next().await else {
        panic!("expected discover");
    };
    assert_eq!(advertisement.local_name.as_deref(), Some("HRM"));
    assert_eq!(advertisement.tx_power_level, Some(-8));

    // Second report: no name, different service data for another uuid.
    h.platform.update_peripheral(PEER, |_| {
        SimPeripheral::new(PEER)
            .rssi(-70)
            .service_data(HEART_RATE, vec![0x11])
    });
    h.platform.advertise(PEER);
    let Event::Discover {
        advertisement,
        rssi,
        ..
    } = h.next().await
    else {
        panic!("expected discover");
    };
    assert_eq!(rssi, -70);
    assert_eq!(advertisement.local_name, None);
    assert_eq!(advertisement.tx_power_level, None);
    assert!(advertisement.service_uuids.is_empty());
    let service_data: Vec<(BleUuid, Vec<u8>)> = advertisement
        .service_data
        .iter()
        .map(|entry| (entry.uuid, entry.data.clone()))
        .collect();
    assert_eq!(
        service_data,
        vec![(BATTERY, vec![90]), (HEART_RATE, vec![0x11])]
    );
}

#[tokio::test]
async fn test_scan_filter() {
    let mut h = start().await;
    h.scan(vec![BATTERY], false).await;

    // PEER advertises only the heart rate service; OTHER also battery.
    h.platform.advertise(PEER);
    h.platform.advertise(OTHER);
    assert_eq!(discovered_id(&h.next().await), OTHER_ID);

    // Service data alone also matches.
    h.platform
        .update_peripheral(PEER, |p| p.service_data(BATTERY, vec![50]));
    h.platform.advertise(PEER);
    assert_eq!(discovered_id(&h.next().await), PEER_ID);
}

#[tokio::test]
async fn test_scan_stop_waits_for_platform_confirmation() {
    let mut h = start().await;
    h.scan(Vec::new(), false).await;

    h.platform.set_watcher_acknowledges_stop(false);
    h.session.stop_scan().unwrap();
    // Not acknowledged: the next event is the one from this connect.
    h.session.connect("nope").unwrap();
    assert_eq!(
        h.next().await,
        Event::Connect {
            id: "nope".into(),
            error: Some("invalid device address format".into())
        }
    );

    h.platform.confirm_watcher_stopped();
    assert_eq!(h.next().await, Event::ScanStop);

    // A second confirmation for the same scan is ignored.
    h.platform.confirm_watcher_stopped();
    h.session.connect("nope").unwrap();
    assert!(matches!(h.next().await, Event::Connect { .. }));
}

#[tokio::test]
async fn test_scan_stop_acknowledged() {
    let mut h = start().await;
    h.scan(Vec::new(), false).await;
    h.session.stop_scan().unwrap();
    assert_eq!(h.next().await, Event::ScanStop);
}

#[tokio::test]
async fn test_zero_capacity_table_rejected() {
    let (sink, _events) = event_channel();
    let result = SessionManager::spawn(
        SimPlatform::new(),
        sink,
        SessionConfig {
            max_peripherals: Some(0),
            ..SessionConfig::default()
        },
    );
    assert!(matches!(result, Err(ConfigError::ZeroCapacity)));
}

#[tokio::test]
async fn test_bounded_table_evicts_idle_peripherals() {
    let mut h = start_with(SessionConfig {
        max_peripherals: Some(1),
        ..SessionConfig::default()
    })
    .await;
    h.scan(Vec::new(), false).await;
    h.platform.advertise(PEER);
    assert_eq!(discovered_id(&h.next().await), PEER_ID);
    h.platform.advertise(OTHER);
    assert_eq!(discovered_id(&h.next().await), OTHER_ID);

    // PEER is gone: no RSSI report for it, and it is rediscovered.
    h.session.update_rssi(PEER_ID).unwrap();
    assert!(matches!(h.sync(OTHER_ID).await, Event::RssiUpdate { .. }));
    h.platform.advertise(PEER);
    assert_eq!(discovered_id(&h.next().await), PEER_ID);
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_radio_power_and_removal() {
    let mut h = start().await;

    let mut info = SimPlatform::default_adapter_info();
    info.power = RadioPower::Off;
    h.platform.set_adapter(Some(info));
    h.platform.radio_event(RadioEvent::PowerChanged);
    assert_eq!(
        h.next().await,
        Event::StateChange {
            state: RadioState::PoweredOff
        }
    );
    assert!(matches!(h.next().await, Event::AddressChange { .. }));

    h.platform.set_adapter(None);
    h.platform.radio_event(RadioEvent::Removed);
    assert_eq!(
        h.next().await,
        Event::StateChange {
            state: RadioState::Unsupported
        }
    );

    h.platform.set_adapter(Some(AdapterInfo {
        power: RadioPower::On,
        capabilities: AdapterCapabilities {
            address: 0x0000_0000_0042,
            central_role: true,
            low_energy: true,
            ..Default::default()
        },
    }));
    h.platform.radio_event(RadioEvent::Added);
    assert_eq!(
        h.next().await,
        Event::StateChange {
            state: RadioState::PoweredOn
        }
    );
    assert_eq!(
        h.next().await,
        Event::AddressChange {
            address: "00:00:00:00:00:42".into()
        }
    );
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_by_address_discovers_first() {
    let mut h = start().await;
    h.session.connect("AA:BB:CC:DD:EE:01").unwrap();

    let Event::Discover {
        id,
        address,
        connectable,
        rssi,
        ..
    } = h.next().await
    else {
        panic!("expected discover");
    };
    assert_eq!(id, PEER_ID);
    assert_eq!(address, "aa:bb:cc:dd:ee:01");
    assert!(connectable);
    assert_eq!(rssi, 127);

    assert_eq!(
        h.next().await,
        Event::Connect {
            id: PEER_ID.into(),
            error: None
        }
    );
    assert_eq!(
        h.next().await,
        Event::Mtu {
            id: PEER_ID.into(),
            mtu: 247
        }
    );
    assert!(h.platform.is_connected(PEER));
}

#[tokio::test]
async fn test_connect_invalid_address() {
    let mut h = start().await;
    h.session.connect("AA:BB").unwrap();
    assert_eq!(
        h.next().await,
        Event::Connect {
            id: "AA:BB".into(),
            error: Some("invalid device address format".into())
        }
    );
    assert_eq!(h.platform.calls(SimOp::Connect), 0);
}

#[tokio::test]
async fn test_connect_failures() {
    let mut h = start().await;
    h.scan(Vec::new(), false).await;
    h.platform.advertise(PEER);
    h.next().await;

    h.platform
        .fail_next(SimOp::Connect, SimFailure::Error(PlatformError::Unreachable));
    h.session.connect(PEER_ID).unwrap();
    assert_eq!(
        h.next().await,
        Event::Connect {
            id: PEER_ID.into(),
            error: Some("could not connect to device: Device is unreachable".into())
        }
    );

    h.platform.fail_next(SimOp::Connect, SimFailure::NullResult);
    h.session.connect(PEER_ID).unwrap();
    assert_eq!(
        h.next().await,
        Event::Connect {
            id: PEER_ID.into(),
            error: Some("could not connect to device: result is null".into())
        }
    );

    // Nothing was left half-connected; a retry works.
    h.connect(PEER_ID).await;
    assert_eq!(h.platform.calls(SimOp::Connect), 3);
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session.connect(PEER_ID).unwrap();
    assert_eq!(
        h.next().await,
        Event::Connect {
            id: PEER_ID.into(),
            error: None
        }
    );
    assert_eq!(h.platform.calls(SimOp::Connect), 1);
}

#[tokio::test]
async fn test_disconnect_releases_and_clears_cache() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    assert!(matches!(h.next().await, Event::Read { error: None, .. }));
    h.session
        .set_notify(PEER_ID, BATTERY, BATTERY_LEVEL, true)
        .unwrap();
    assert!(matches!(h.next().await, Event::Notify { error: None, .. }));
    assert_eq!(h.platform.value_listener_count(), 1);

    h.session.disconnect(PEER_ID).unwrap();
    assert_eq!(h.next().await, Event::Disconnect { id: PEER_ID.into() });
    assert_eq!(h.platform.closed_devices().len(), 1);
    assert_eq!(h.platform.connection_listener_count(), 0);
    assert_eq!(h.platform.value_listener_count(), 0);

    // Reconnect starts with an empty cache and no subscriptions.
    h.connect(PEER_ID).await;
    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    assert!(matches!(h.next().await, Event::Read { error: None, .. }));
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 2);
    assert_eq!(h.platform.calls(SimOp::CharacteristicsForUuid), 2);

    h.session
        .set_notify(PEER_ID, BATTERY, BATTERY_LEVEL, true)
        .unwrap();
    assert!(matches!(h.next().await, Event::Notify { error: None, .. }));
    assert_eq!(h.platform.calls(SimOp::WriteClientConfiguration), 2);
}

#[tokio::test]
async fn test_disconnect_of_unconnected_peripheral_still_reports() {
    let mut h = start().await;
    h.scan(Vec::new(), false).await;
    h.platform.advertise(PEER);
    h.next().await;

    h.session.disconnect(PEER_ID).unwrap();
    assert_eq!(h.next().await, Event::Disconnect { id: PEER_ID.into() });

    // Unknown peripherals are ignored.
    h.session.disconnect("ff:ff:ff:ff:ff:ff").unwrap();
    h.session.cancel_connect("ff:ff:ff:ff:ff:ff").unwrap();
    h.session.update_rssi("ff:ff:ff:ff:ff:ff").unwrap();
    assert!(matches!(h.sync(PEER_ID).await, Event::RssiUpdate { .. }));
}

#[tokio::test]
async fn test_peer_initiated_disconnect() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;
    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, true)
        .unwrap();
    assert!(matches!(h.next().await, Event::Notify { error: None, .. }));

    h.platform.disconnect_peer(PEER);
    assert_eq!(h.next().await, Event::Disconnect { id: PEER_ID.into() });
    assert_eq!(h.platform.value_listener_count(), 0);
    assert_eq!(h.platform.closed_devices().len(), 1);

    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    assert_eq!(
        h.next().await.error(),
        Some("device not connected while reading characteristic 2a19")
    );
}

#[tokio::test]
async fn test_mtu_change_reported_once() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.platform.set_mtu(PEER, 185);
    assert_eq!(
        h.next().await,
        Event::Mtu {
            id: PEER_ID.into(),
            mtu: 185
        }
    );
    h.platform.set_mtu(PEER, 185);
    h.platform.set_mtu(PEER, 512);
    assert_eq!(
        h.next().await,
        Event::Mtu {
            id: PEER_ID.into(),
            mtu: 512
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_connect_discards_late_completion() {
    let mut h = start().await;
    h.platform.set_connect_latency(Duration::from_secs(5));

    h.session.connect(PEER_ID).unwrap();
    assert!(matches!(h.next().await, Event::Discover { .. }));
    h.session.cancel_connect(PEER_ID).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.platform.calls(SimOp::Connect), 1);
    assert_eq!(
        h.sync(PEER_ID).await,
        Event::RssiUpdate {
            id: PEER_ID.into(),
            rssi: 127
        }
    );
    // The device opened by the late completion was closed right away.
    assert_eq!(h.platform.closed_devices().len(), 1);
    assert!(!h.platform.is_connected(PEER));
    assert_eq!(h.platform.connection_listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_newer_connect_supersedes_pending_one() {
    let mut h = start().await;
    h.platform.set_connect_latency(Duration::from_secs(5));

    h.session.connect(PEER_ID).unwrap();
    assert!(matches!(h.next().await, Event::Discover { .. }));
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.session.connect(PEER_ID).unwrap();

    assert_eq!(
        h.next().await,
        Event::Connect {
            id: PEER_ID.into(),
            error: None
        }
    );
    assert!(matches!(h.next().await, Event::Mtu { .. }));
    assert_eq!(h.platform.calls(SimOp::Connect), 2);
    assert_eq!(h.platform.closed_devices().len(), 1);
    assert!(h.platform.is_connected(PEER));
}

#[tokio::test]
async fn test_shutdown_releases_connections() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session.shutdown();
    for _ in 0..100 {
        if !h.platform.closed_devices().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.platform.closed_devices().len(), 1);
    assert!(!h.platform.is_connected(PEER));
}

// ---------------------------------------------------------------------------
// GATT
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_gatt_on_unknown_device() {
    let mut h = start().await;
    h.session.read("11:22:33:44:55:66", BATTERY, BATTERY_LEVEL).unwrap();
    assert_eq!(
        h.next().await,
        Event::Read {
            id: "112233445566".into(),
            service: BATTERY,
            characteristic: BATTERY_LEVEL,
            data: Vec::new(),
            is_notification: false,
            error: Some("device not found while reading characteristic 2a19".into()),
        }
    );
}

#[tokio::test]
async fn test_discover_services_filter() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session.discover_services(PEER_ID, Vec::new()).unwrap();
    let Event::ServicesDiscover { mut services, .. } = h.next().await else {
        panic!("expected services");
    };
    services.sort();
    let mut expected = vec![HEART_RATE, BATTERY, DEVICE_INFO];
    expected.sort();
    assert_eq!(services, expected);

    h.session
        .discover_services(PEER_ID, vec![BATTERY])
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::ServicesDiscover {
            id: PEER_ID.into(),
            services: vec![BATTERY],
            error: None
        }
    );
    assert_eq!(h.platform.calls(SimOp::Services), 2);

    // Every discovered service is cached.
    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    assert!(matches!(h.next().await, Event::Read { error: None, .. }));
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 0);
}

#[tokio::test]
async fn test_filtered_characteristic_discovery_still_caches_all() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .discover_characteristics(PEER_ID, HEART_RATE, vec![MEASUREMENT])
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::CharacteristicsDiscover {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristics: vec![CharacteristicSummary {
                uuid: MEASUREMENT,
                properties: CharacteristicProperties::NOTIFY,
            }],
            error: None,
        }
    );

    h.session.read(PEER_ID, HEART_RATE, BODY_LOCATION).unwrap();
    assert_eq!(
        h.next().await,
        Event::Read {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: BODY_LOCATION,
            data: vec![0x01],
            is_notification: false,
            error: None,
        }
    );
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 1);
    assert_eq!(h.platform.calls(SimOp::Characteristics), 1);
    assert_eq!(h.platform.calls(SimOp::CharacteristicsForUuid), 0);
}

#[tokio::test]
async fn test_get_or_fetch_caches_lookups() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    for _ in 0..3 {
        h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
        assert_eq!(
            h.next().await,
            Event::Read {
                id: PEER_ID.into(),
                service: BATTERY,
                characteristic: BATTERY_LEVEL,
                data: vec![64],
                is_notification: false,
                error: None,
            }
        );
    }
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 1);
    assert_eq!(h.platform.calls(SimOp::CharacteristicsForUuid), 1);
    assert_eq!(h.platform.calls(SimOp::ReadCharacteristic), 3);
}

#[tokio::test]
async fn test_concurrent_misses_each_look_up() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    // Both requests miss the empty cache before either lookup completes.
    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    for _ in 0..2 {
        assert!(matches!(
            h.next().await,
            Event::Read {
                error: None,
                is_notification: false,
                ..
            }
        ));
    }
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 2);
    assert_eq!(h.platform.calls(SimOp::ReadCharacteristic), 2);

    // Later requests are served from the cache.
    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    assert!(matches!(h.next().await, Event::Read { error: None, .. }));
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 2);
}

#[tokio::test]
async fn test_lookup_failures_are_reported() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .read(PEER_ID, BATTERY, BleUuid::from_u16(0x2A00))
        .unwrap();
    assert_eq!(
        h.next().await.error(),
        Some("characteristic 2a00 not found while reading characteristic 2a00")
    );

    h.session
        .read(PEER_ID, BleUuid::from_u16(0x1800), BleUuid::from_u16(0x2A00))
        .unwrap();
    assert_eq!(
        h.next().await.error(),
        Some("service 1800 not found while reading characteristic 2a00")
    );

    h.platform.fail_next(SimOp::ServicesForUuid, SimFailure::NullResult);
    h.session
        .discover_characteristics(PEER_ID, HEART_RATE, Vec::new())
        .unwrap();
    assert_eq!(
        h.next().await.error(),
        Some("result is null while discovering characteristics for service 180d")
    );

    // The failed lookup cached nothing; the retry looks the service up again.
    h.session
        .discover_characteristics(PEER_ID, HEART_RATE, Vec::new())
        .unwrap();
    assert!(matches!(
        h.next().await,
        Event::CharacteristicsDiscover { error: None, .. }
    ));
}

#[tokio::test]
async fn test_read_failure_and_discovery_failure() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.platform.fail_next(
        SimOp::ReadCharacteristic,
        SimFailure::Error(PlatformError::ProtocolError(0x0E)),
    );
    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    assert_eq!(
        h.next().await,
        Event::Read {
            id: PEER_ID.into(),
            service: BATTERY,
            characteristic: BATTERY_LEVEL,
            data: Vec::new(),
            is_notification: false,
            error: Some("Protocol error while reading characteristic 2a19".into()),
        }
    );

    h.platform.fail_next(SimOp::Services, SimFailure::Error(PlatformError::AccessDenied));
    h.session.discover_services(PEER_ID, Vec::new()).unwrap();
    assert_eq!(
        h.next().await,
        Event::ServicesDiscover {
            id: PEER_ID.into(),
            services: Vec::new(),
            error: Some("Access denied while discovering services".into()),
        }
    );
}

#[tokio::test]
async fn test_write_with_and_without_response() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .write(PEER_ID, HEART_RATE, BODY_LOCATION, vec![0x03], false)
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::Write {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: BODY_LOCATION,
            error: None,
        }
    );
    assert_eq!(
        h.platform.characteristic_value(PEER, HEART_RATE, BODY_LOCATION),
        Some(vec![0x03])
    );

    h.session
        .write(PEER_ID, HEART_RATE, BODY_LOCATION, vec![0x04], true)
        .unwrap();
    assert_eq!(
        h.next().await.error(),
        Some("Protocol error while writing characteristic 2a38")
    );
}

#[tokio::test]
async fn test_descriptors() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .discover_descriptors(PEER_ID, HEART_RATE, MEASUREMENT)
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::DescriptorsDiscover {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: MEASUREMENT,
            descriptors: vec![CLIENT_CONFIG, USER_DESCRIPTION],
            error: None,
        }
    );

    h.session
        .read_descriptor(PEER_ID, HEART_RATE, MEASUREMENT, USER_DESCRIPTION)
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::ValueRead {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: MEASUREMENT,
            descriptor: USER_DESCRIPTION,
            data: b"bpm".to_vec(),
            error: None,
        }
    );

    h.session
        .write_descriptor(
            PEER_ID,
            HEART_RATE,
            MEASUREMENT,
            USER_DESCRIPTION,
            b"beats".to_vec(),
        )
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::ValueWrite {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: MEASUREMENT,
            descriptor: USER_DESCRIPTION,
            error: None,
        }
    );
    assert_eq!(h.platform.calls(SimOp::DescriptorsForUuid), 0);
}

#[tokio::test]
async fn test_descriptor_lookup_without_discovery() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .read_descriptor(PEER_ID, HEART_RATE, MEASUREMENT, CLIENT_CONFIG)
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::ValueRead {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: MEASUREMENT,
            descriptor: CLIENT_CONFIG,
            data: vec![0x00, 0x00],
            error: None,
        }
    );
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 1);
    assert_eq!(h.platform.calls(SimOp::CharacteristicsForUuid), 1);
    assert_eq!(h.platform.calls(SimOp::DescriptorsForUuid), 1);
}

#[tokio::test]
async fn test_included_services_are_cached_top_level() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .discover_included_services(PEER_ID, HEART_RATE, Vec::new())
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::IncludedServicesDiscover {
            id: PEER_ID.into(),
            service: HEART_RATE,
            services: vec![DEVICE_INFO],
            error: None,
        }
    );

    h.session
        .discover_characteristics(PEER_ID, DEVICE_INFO, Vec::new())
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::CharacteristicsDiscover {
            id: PEER_ID.into(),
            service: DEVICE_INFO,
            characteristics: Vec::new(),
            error: None,
        }
    );
    // Only the heart rate service needed a lookup.
    assert_eq!(h.platform.calls(SimOp::ServicesForUuid), 1);
}

#[tokio::test(start_paused = true)]
async fn test_completion_after_disconnect_is_discarded() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;
    h.platform.set_gatt_latency(Duration::from_millis(200));

    h.session.read(PEER_ID, BATTERY, BATTERY_LEVEL).unwrap();
    h.session.disconnect(PEER_ID).unwrap();

    assert_eq!(h.next().await, Event::Disconnect { id: PEER_ID.into() });
    assert_eq!(
        h.next().await.error(),
        Some("device disconnected while reading characteristic 2a19")
    );
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_set_notify_is_idempotent() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    let notify = |state: bool| Event::Notify {
        id: PEER_ID.into(),
        service: HEART_RATE,
        characteristic: MEASUREMENT,
        state,
        error: None,
    };

    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, true)
        .unwrap();
    assert_eq!(h.next().await, notify(true));
    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, true)
        .unwrap();
    assert_eq!(h.next().await, notify(true));
    assert_eq!(h.platform.calls(SimOp::WriteClientConfiguration), 1);
    assert_eq!(
        h.platform.client_configuration(PEER, HEART_RATE, MEASUREMENT),
        Some(ClientConfiguration::Notify)
    );

    h.platform
        .notify_value(PEER, HEART_RATE, MEASUREMENT, vec![0x00, 72]);
    assert_eq!(
        h.next().await,
        Event::Read {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: MEASUREMENT,
            data: vec![0x00, 72],
            is_notification: true,
            error: None,
        }
    );

    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, false)
        .unwrap();
    assert_eq!(h.next().await, notify(false));
    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, false)
        .unwrap();
    assert_eq!(h.next().await, notify(false));
    assert_eq!(h.platform.calls(SimOp::WriteClientConfiguration), 2);
    assert_eq!(h.platform.value_listener_count(), 0);
    assert_eq!(
        h.platform.client_configuration(PEER, HEART_RATE, MEASUREMENT),
        Some(ClientConfiguration::None)
    );
}

#[tokio::test]
async fn test_set_notify_failure_allows_retry() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.platform.fail_next(
        SimOp::WriteClientConfiguration,
        SimFailure::Error(PlatformError::ProtocolError(0x03)),
    );
    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, true)
        .unwrap();
    assert_eq!(
        h.next().await,
        Event::Notify {
            id: PEER_ID.into(),
            service: HEART_RATE,
            characteristic: MEASUREMENT,
            state: true,
            error: Some("Protocol error while subscribing to characteristic 2a37".into()),
        }
    );
    assert_eq!(h.platform.value_listener_count(), 0);

    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, true)
        .unwrap();
    assert!(matches!(
        h.next().await,
        Event::Notify {
            state: true,
            error: None,
            ..
        }
    ));
    assert_eq!(h.platform.calls(SimOp::WriteClientConfiguration), 2);
    assert_eq!(h.platform.value_listener_count(), 1);
}

#[tokio::test]
async fn test_failed_unsubscribe_leaves_state_unsubscribed() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;
    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, true)
        .unwrap();
    h.next().await;

    h.platform.fail_next(
        SimOp::WriteClientConfiguration,
        SimFailure::Error(PlatformError::Unreachable),
    );
    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, false)
        .unwrap();
    assert_eq!(
        h.next().await.error(),
        Some("Device is unreachable while unsubscribing from characteristic 2a37")
    );
    assert_eq!(h.platform.value_listener_count(), 0);

    // Values pushed now are not delivered.
    h.platform
        .notify_value(PEER, HEART_RATE, MEASUREMENT, vec![0x00, 90]);
    assert!(matches!(h.sync(PEER_ID).await, Event::RssiUpdate { .. }));
}

#[tokio::test]
async fn test_indicate_preferred_when_supported() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .set_notify(PEER_ID, BATTERY, BATTERY_LEVEL, true)
        .unwrap();
    assert!(matches!(h.next().await, Event::Notify { error: None, .. }));
    assert_eq!(
        h.platform.client_configuration(PEER, BATTERY, BATTERY_LEVEL),
        Some(ClientConfiguration::Indicate)
    );
}

#[tokio::test]
async fn test_subscriptions_keyed_by_service() {
    let mut h = start().await;
    h.connect_direct(PEER_ID).await;

    h.session
        .set_notify(PEER_ID, HEART_RATE, MEASUREMENT, true)
        .unwrap();
    h.next().await;
    h.session
        .set_notify(PEER_ID, BATTERY, BATTERY_LEVEL, true)
        .unwrap();
    h.next().await;

    h.platform.notify_value(PEER, BATTERY, BATTERY_LEVEL, vec![63]);
    let Event::Read {
        service,
        characteristic,
        is_notification,
        ..
    } = h.next().await
    else {
        panic!("expected read");
    };
    assert_eq!((service, characteristic), (BATTERY, BATTERY_LEVEL));
    assert!(is_notification);
}
