//! Central session manager
//!
//! All session state (radio, scan, peripheral table, GATT caches and
//! subscriptions) is owned by one executor task. Application commands,
//! platform events and native-call completions reach it through a single
//! queue and are handled strictly in arrival order. Native calls never run
//! on the executor: each is spawned as its own task whose result comes back
//! through the queue tagged with the identity of the work it belongs to, so
//! a result that arrives after a disconnect is recognised and dropped.

pub mod connection;
pub mod gatt;
pub mod gatt_cache;
pub mod notify;
pub mod radio;
pub mod request;
pub mod scan;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::ble::transport::{AdapterInfo, DeviceHandle, Platform, PlatformEvent, RadioEvent};
use crate::ble::{NativeResult, PlatformError};
use crate::config::{ConfigError, SessionConfig};
use crate::event::EventSink;
use crate::types::BleUuid;

use self::connection::{ConnectionRegistry, LinkToken};
use self::gatt::{GattOutcome, Lookup};
use self::radio::RadioMonitor;
use self::request::{GattOp, GattRequest};
use self::scan::ScanSession;

/// Errors returned by [`SessionManager`] commands. Operation failures are
/// reported through events instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session executor has stopped")]
    Closed,
}

#[derive(Debug)]
enum Command {
    StartScan {
        filter: Vec<BleUuid>,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(String),
    Disconnect(String),
    CancelConnect(String),
    UpdateRssi(String),
    Gatt(GattRequest),
}

/// Result of a spawned native call, tagged with what it belongs to.
pub(crate) enum Completion {
    Radio {
        sequence: u64,
        result: Result<Option<AdapterInfo>, PlatformError>,
    },
    Connect {
        id: String,
        attempt: u64,
        result: NativeResult<DeviceHandle>,
    },
    SessionOpened {
        link: LinkToken,
        result: NativeResult<u16>,
    },
    Lookup {
        link: LinkToken,
        request: GattRequest,
        lookup: Lookup,
    },
    Gatt {
        link: LinkToken,
        request: GattRequest,
        outcome: GattOutcome,
    },
}

enum Message {
    Command(Command),
    Platform(PlatformEvent),
    Completion(Completion),
    Shutdown,
}

/// Sending half of the executor queue. The executor stops when the last
/// [`SessionManager`] clone is dropped.
struct Inbox(mpsc::UnboundedSender<Message>);

impl Drop for Inbox {
    fn drop(&mut self) {
        let _ = self.0.send(Message::Shutdown);
    }
}

/// Handle to a running session.
///
/// Commands return immediately; their outcome arrives on the event sink.
/// Addresses may be given in any form accepted by
/// [`address_to_id`](crate::types::address_to_id).
#[derive(Clone)]
pub struct SessionManager {
    inbox: Arc<Inbox>,
}

impl SessionManager {
    /// Start the executor on the current tokio runtime. Fails before
    /// anything is spawned if `config` is invalid.
    pub fn spawn(
        platform: Arc<dyn Platform>,
        sink: Arc<dyn EventSink>,
        config: SessionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Subscribe before the executor starts the radio watch so the
        // initial enumeration is not missed.
        tokio::spawn(forward_platform_events(platform.subscribe(), tx.clone()));

        let session = Session {
            native: NativeRunner {
                platform,
                inbox: tx.clone(),
            },
            sink,
            radio: RadioMonitor::new(),
            scan: ScanSession::new(),
            registry: ConnectionRegistry::new(config.max_peripherals),
            config,
        };
        tokio::spawn(session.run(rx));

        Ok(Self {
            inbox: Arc::new(Inbox(tx)),
        })
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.inbox
            .0
            .send(Message::Command(command))
            .map_err(|_| SessionError::Closed)
    }

    fn gatt(&self, address: &str, op: GattOp) -> Result<(), SessionError> {
        self.send(Command::Gatt(GattRequest::new(address, op)))
    }

    pub fn start_scan(&self, filter: Vec<BleUuid>, allow_duplicates: bool) -> Result<(), SessionError> {
        self.send(Command::StartScan {
            filter,
            allow_duplicates,
        })
    }

    pub fn stop_scan(&self) -> Result<(), SessionError> {
        self.send(Command::StopScan)
    }

    pub fn connect(&self, address: &str) -> Result<(), SessionError> {
        self.send(Command::Connect(address.to_string()))
    }

    pub fn disconnect(&self, address: &str) -> Result<(), SessionError> {
        self.send(Command::Disconnect(address.to_string()))
    }

    /// Abort a connection attempt. Tears down like `disconnect` but emits
    /// no event.
    pub fn cancel_connect(&self, address: &str) -> Result<(), SessionError> {
        self.send(Command::CancelConnect(address.to_string()))
    }

    /// Report the last advertised RSSI of a peripheral.
    pub fn update_rssi(&self, address: &str) -> Result<(), SessionError> {
        self.send(Command::UpdateRssi(address.to_string()))
    }

    pub fn discover_services(&self, address: &str, filter: Vec<BleUuid>) -> Result<(), SessionError> {
        self.gatt(address, GattOp::DiscoverServices { filter })
    }

    pub fn discover_included_services(
        &self,
        address: &str,
        service: BleUuid,
        filter: Vec<BleUuid>,
    ) -> Result<(), SessionError> {
        self.gatt(address, GattOp::DiscoverIncludedServices { service, filter })
    }

    pub fn discover_characteristics(
        &self,
        address: &str,
        service: BleUuid,
        filter: Vec<BleUuid>,
    ) -> Result<(), SessionError> {
        self.gatt(address, GattOp::DiscoverCharacteristics { service, filter })
    }

    pub fn read(
        &self,
        address: &str,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<(), SessionError> {
        self.gatt(
            address,
            GattOp::Read {
                service,
                characteristic,
            },
        )
    }

    pub fn write(
        &self,
        address: &str,
        service: BleUuid,
        characteristic: BleUuid,
        data: Vec<u8>,
        without_response: bool,
    ) -> Result<(), SessionError> {
        self.gatt(
            address,
            GattOp::Write {
                service,
                characteristic,
                data,
                without_response,
            },
        )
    }

    pub fn set_notify(
        &self,
        address: &str,
        service: BleUuid,
        characteristic: BleUuid,
        on: bool,
    ) -> Result<(), SessionError> {
        self.gatt(
            address,
            GattOp::Notify {
                service,
                characteristic,
                on,
            },
        )
    }

    pub fn discover_descriptors(
        &self,
        address: &str,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<(), SessionError> {
        self.gatt(
            address,
            GattOp::DiscoverDescriptors {
                service,
                characteristic,
            },
        )
    }

    pub fn read_descriptor(
        &self,
        address: &str,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> Result<(), SessionError> {
        self.gatt(
            address,
            GattOp::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            },
        )
    }

    pub fn write_descriptor(
        &self,
        address: &str,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
        data: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.gatt(
            address,
            GattOp::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                data,
            },
        )
    }

    /// Stop the executor. Open connections are released.
    pub fn shutdown(&self) {
        let _ = self.inbox.0.send(Message::Shutdown);
    }
}

async fn forward_platform_events(
    mut events: broadcast::Receiver<PlatformEvent>,
    inbox: mpsc::UnboundedSender<Message>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if inbox.send(Message::Platform(event)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Session fell behind platform events, {} dropped", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Spawns native calls and routes their results back to the executor.
struct NativeRunner {
    platform: Arc<dyn Platform>,
    inbox: mpsc::UnboundedSender<Message>,
}

impl NativeRunner {
    fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    fn spawn<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn Platform>) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        let pending = call(Arc::clone(&self.platform));
        tokio::spawn(async move {
            let completion = pending.await;
            // The executor may have shut down meanwhile.
            let _ = inbox.send(Message::Completion(completion));
        });
    }
}

/// State owned by the executor task.
struct Session {
    native: NativeRunner,
    sink: Arc<dyn EventSink>,
    config: SessionConfig,
    radio: RadioMonitor,
    scan: ScanSession,
    registry: ConnectionRegistry,
}

impl Session {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message>) {
        self.native.platform().start_radio_watch();

        while let Some(message) = inbox.recv().await {
            match message {
                Message::Command(command) => self.handle_command(command),
                Message::Platform(event) => self.handle_platform_event(event),
                Message::Completion(completion) => self.handle_completion(completion),
                Message::Shutdown => break,
            }
        }

        if self.scan.is_active() {
            self.native.platform().stop_watcher();
        }
        log::info!(
            "Session stopped, releasing {} connection(s)",
            self.registry.connected_count()
        );
    }

    fn handle_command(&mut self, command: Command) {
        log::debug!("command {:?}", command);
        match command {
            Command::StartScan {
                filter,
                allow_duplicates,
            } => self.start_scan(filter, allow_duplicates),
            Command::StopScan => self.stop_scan(),
            Command::Connect(address) => self.connect(&address),
            Command::Disconnect(address) => self.disconnect(&address),
            Command::CancelConnect(address) => self.cancel_connect(&address),
            Command::UpdateRssi(address) => self.update_rssi(&address),
            Command::Gatt(request) => self.gatt_command(request),
        }
    }

    fn handle_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::Radio(event) => self.on_radio_event(event),
            PlatformEvent::Advertisement(report) => self.on_advertisement(report),
            PlatformEvent::WatcherStopped => self.on_watcher_stopped(),
            PlatformEvent::ConnectionStatusChanged {
                device,
                token,
                connected,
            } => self.on_connection_status(device, token, connected),
            PlatformEvent::MtuChanged { device, mtu } => self.on_mtu_changed(device, mtu),
            PlatformEvent::ValueChanged {
                device,
                characteristic,
                token,
                data,
            } => self.on_value_changed(device, characteristic, token, data),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Radio { sequence, result } => {
                for event in self.radio.apply(sequence, result) {
                    self.sink.emit(event);
                }
            }
            Completion::Connect {
                id,
                attempt,
                result,
            } => self.on_connect_complete(id, attempt, result),
            Completion::SessionOpened { link, result } => self.on_session_opened(link, result),
            Completion::Lookup {
                link,
                request,
                lookup,
            } => self.on_lookup_complete(link, request, lookup),
            Completion::Gatt {
                link,
                request,
                outcome,
            } => self.on_gatt_complete(link, request, outcome),
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        let Some(sequence) = self.radio.on_event(event) else {
            log::debug!("radio {:?} during initial enumeration", event);
            return;
        };
        self.native.spawn(move |platform| async move {
            Completion::Radio {
                sequence,
                result: platform.default_adapter().await,
            }
        });
    }
}
