// src/bin/session_demo.rs
//! Walks a session through scan, connect, discovery, a battery read and
//! heart-rate notifications against the simulated platform.
//!
//! Set `RUST_LOG=debug` to watch the executor.

use std::time::Duration;

use anyhow::{bail, Context};
use gatt_session::ble::simulated::{
    SimCharacteristic, SimDescriptor, SimPeripheral, SimPlatform, SimService,
};
use gatt_session::types::CharacteristicProperties;
use gatt_session::{event_channel, BleUuid, Event, SessionConfig, SessionManager};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const BAND: u64 = 0xC4_7F_51_0A_33_21;
const HEART_RATE: BleUuid = BleUuid::from_u16(0x180D);
const HEART_RATE_MEASUREMENT: BleUuid = BleUuid::from_u16(0x2A37);
const BATTERY: BleUuid = BleUuid::from_u16(0x180F);
const BATTERY_LEVEL: BleUuid = BleUuid::from_u16(0x2A19);
const CLIENT_CONFIG: BleUuid = BleUuid::from_u16(0x2902);

fn heart_rate_band() -> SimPeripheral {
    SimPeripheral::new(BAND)
        .name("Pulse Band")
        .rssi(-52)
        .tx_power(4)
        .advertise_service(HEART_RATE)
        .service_data(BATTERY, vec![91])
        .service(
            SimService::new(HEART_RATE).characteristic(
                SimCharacteristic::new(HEART_RATE_MEASUREMENT, CharacteristicProperties::NOTIFY)
                    .descriptor(SimDescriptor::new(CLIENT_CONFIG, vec![0x00, 0x00])),
            ),
        )
        .service(
            SimService::new(BATTERY).characteristic(
                SimCharacteristic::new(
                    BATTERY_LEVEL,
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                )
                .value(vec![91]),
            ),
        )
}

/// Wait for the next event matching `pred`, printing everything seen.
async fn wait_for<F>(events: &mut UnboundedReceiver<Event>, what: &str, pred: F) -> anyhow::Result<Event>
where
    F: Fn(&Event) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .with_context(|| format!("timed out waiting for {}", what))?
            .context("session closed")?;
        println!("{:<24} {}", event.name(), serde_json::Value::Array(event.payload()));
        if let Some(error) = event.error() {
            bail!("{} failed: {}", what, error);
        }
        if pred(&event) {
            return Ok(event);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let platform = SimPlatform::new();
    platform.add_peripheral(heart_rate_band());

    let (sink, mut events) = event_channel();
    let session = SessionManager::spawn(platform.clone(), sink, SessionConfig::default())?;

    wait_for(&mut events, "radio", |e| matches!(e, Event::StateChange { .. })).await?;

    session.start_scan(vec![HEART_RATE], false)?;
    wait_for(&mut events, "scan start", |e| matches!(e, Event::ScanStart)).await?;
    platform.advertise(BAND);
    let discovered = wait_for(&mut events, "discovery", |e| matches!(e, Event::Discover { .. })).await?;
    let Event::Discover { id, .. } = discovered else {
        bail!("unexpected event");
    };
    session.stop_scan()?;
    wait_for(&mut events, "scan stop", |e| matches!(e, Event::ScanStop)).await?;

    session.connect(&id)?;
    wait_for(&mut events, "connect", |e| matches!(e, Event::Connect { .. })).await?;
    wait_for(&mut events, "mtu", |e| matches!(e, Event::Mtu { .. })).await?;

    session.discover_services(&id, Vec::new())?;
    wait_for(&mut events, "services", |e| matches!(e, Event::ServicesDiscover { .. })).await?;
    session.discover_characteristics(&id, HEART_RATE, Vec::new())?;
    wait_for(&mut events, "characteristics", |e| {
        matches!(e, Event::CharacteristicsDiscover { .. })
    })
    .await?;

    session.read(&id, BATTERY, BATTERY_LEVEL)?;
    wait_for(&mut events, "battery read", |e| matches!(e, Event::Read { .. })).await?;

    session.set_notify(&id, HEART_RATE, HEART_RATE_MEASUREMENT, true)?;
    wait_for(&mut events, "subscribe", |e| matches!(e, Event::Notify { .. })).await?;
    for bpm in [72u8, 75, 79] {
        platform.notify_value(BAND, HEART_RATE, HEART_RATE_MEASUREMENT, vec![0x00, bpm]);
        wait_for(&mut events, "heart rate", |e| {
            matches!(e, Event::Read { is_notification: true, .. })
        })
        .await?;
    }

    session.disconnect(&id)?;
    wait_for(&mut events, "disconnect", |e| matches!(e, Event::Disconnect { .. })).await?;

    session.shutdown();
    println!("closed {} native device(s)", platform.closed_devices().len());
    Ok(())
}
