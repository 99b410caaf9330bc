//! GATT operations on the executor
//!
//! A request first resolves its target through the connection's cache.
//! Each missing level costs one native single-UUID lookup, whose result is
//! cached before the request is advanced again. Once resolved, one native
//! call is made and its completion is turned into the request's event.
//! Every completion is checked against the connection it was started on.

use std::future::Future;
use std::sync::Arc;

use super::connection::LinkToken;
use super::gatt_cache::{Resolution, Resolved};
use super::notify::Subscription;
use super::request::{filter_uuids, GattOp, GattRequest};
use super::{Completion, Session};
use crate::ble::transport::{
    CharacteristicHandle, CharacteristicInfo, ClientConfiguration, DescriptorInfo, DeviceHandle,
    ListenerToken, Platform, ServiceInfo, WriteKind,
};
use crate::ble::{NativeResult, PlatformError};
use crate::event::{CharacteristicSummary, Event};
use crate::types::{canonical_id, BleUuid, CharacteristicProperties};

const NULL_RESULT: &str = "result is null";
const DEVICE_DISCONNECTED: &str = "device disconnected";

/// Result of a single-UUID lookup for a missing cache level.
pub(crate) enum Lookup {
    Service {
        uuid: BleUuid,
        result: NativeResult<Vec<ServiceInfo>>,
    },
    Characteristic {
        service: BleUuid,
        uuid: BleUuid,
        result: NativeResult<Vec<CharacteristicInfo>>,
    },
    Descriptor {
        service: BleUuid,
        characteristic: BleUuid,
        uuid: BleUuid,
        result: NativeResult<Vec<DescriptorInfo>>,
    },
}

/// Result of the native call a request resolves to.
pub(crate) enum GattOutcome {
    Services(NativeResult<Vec<ServiceInfo>>),
    Characteristics(NativeResult<Vec<CharacteristicInfo>>),
    Descriptors(NativeResult<Vec<DescriptorInfo>>),
    Value(NativeResult<Vec<u8>>),
    Written(Result<(), PlatformError>),
    Configured {
        characteristic: CharacteristicHandle,
        result: Result<(), PlatformError>,
    },
}

/// Flatten a native result, treating a null result as a failure.
fn require<T>(result: NativeResult<T>) -> Result<T, String> {
    match result {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(NULL_RESULT.to_string()),
        Err(err) => Err(err.to_string()),
    }
}

impl Session {
    pub(super) fn gatt_command(&mut self, mut request: GattRequest) {
        let Some(id) = canonical_id(&request.id) else {
            log::warn!("GATT request for malformed address {:?}", request.id);
            self.sink.emit(request.failure("device not found"));
            return;
        };
        request.id = id;

        let Some(entry) = self.registry.get_mut(&request.id) else {
            log::warn!("GATT request for unknown device {}", request.id);
            self.sink.emit(request.failure("device not found"));
            return;
        };
        let Some(conn) = entry.connection.as_mut() else {
            log::warn!("GATT request for {} while not connected", request.id);
            self.sink.emit(request.failure("device not connected"));
            return;
        };

        if let GattOp::Notify {
            service,
            characteristic,
            on,
        } = request.op
        {
            let key = (service, characteristic);
            if conn.notifications.is_subscribed(&key) == on {
                self.sink.emit(request.event(None));
                return;
            }
            if !on {
                // Unregister before the native write so no value delivery
                // can match the old listener.
                conn.notifications.remove(&key);
            }
        }

        let link = LinkToken {
            id: request.id.clone(),
            epoch: conn.epoch(),
        };
        self.advance(link, request);
    }

    /// Resolve the request's target from the cache, looking up the first
    /// missing level or dispatching the native call.
    fn advance(&mut self, link: LinkToken, request: GattRequest) {
        let Some(conn) = self.registry.connection(&link) else {
            self.sink.emit(request.failure(DEVICE_DISCONNECTED));
            return;
        };
        let device = conn.device();

        match conn.cache.resolve(request.target()) {
            Resolution::Ready(resolved) => self.dispatch(link, device, request, resolved),
            Resolution::MissingService(uuid) => {
                self.native.spawn(move |platform| async move {
                    let result = platform.services_for_uuid(device, uuid).await;
                    Completion::Lookup {
                        link,
                        request,
                        lookup: Lookup::Service { uuid, result },
                    }
                });
            }
            Resolution::MissingCharacteristic {
                service,
                parent,
                uuid,
            } => {
                self.native.spawn(move |platform| async move {
                    let result = platform.characteristics_for_uuid(parent, uuid).await;
                    Completion::Lookup {
                        link,
                        request,
                        lookup: Lookup::Characteristic {
                            service,
                            uuid,
                            result,
                        },
                    }
                });
            }
            Resolution::MissingDescriptor {
                service,
                characteristic,
                parent,
                uuid,
            } => {
                self.native.spawn(move |platform| async move {
                    let result = platform.descriptors_for_uuid(parent, uuid).await;
                    Completion::Lookup {
                        link,
                        request,
                        lookup: Lookup::Descriptor {
                            service,
                            characteristic,
                            uuid,
                            result,
                        },
                    }
                });
            }
        }
    }

    pub(super) fn on_lookup_complete(&mut self, link: LinkToken, request: GattRequest, lookup: Lookup) {
        let Some(conn) = self.registry.connection(&link) else {
            self.sink.emit(request.failure(DEVICE_DISCONNECTED));
            return;
        };

        let cached = match lookup {
            Lookup::Service { uuid, result } => require(result).and_then(|found| {
                let info = found
                    .into_iter()
                    .find(|s| s.uuid == uuid)
                    .ok_or_else(|| format!("service {} not found", uuid))?;
                conn.cache.upsert_service(&info);
                Ok(())
            }),
            Lookup::Characteristic {
                service,
                uuid,
                result,
            } => require(result).and_then(|found| {
                let info = found
                    .into_iter()
                    .find(|c| c.uuid == uuid)
                    .ok_or_else(|| format!("characteristic {} not found", uuid))?;
                if conn.cache.upsert_characteristic(&service, &info) {
                    Ok(())
                } else {
                    Err(format!("service {} not found", service))
                }
            }),
            Lookup::Descriptor {
                service,
                characteristic,
                uuid,
                result,
            } => require(result).and_then(|found| {
                let info = found
                    .into_iter()
                    .find(|d| d.uuid == uuid)
                    .ok_or_else(|| format!("descriptor {} not found", uuid))?;
                if conn.cache.upsert_descriptor(&service, &characteristic, &info) {
                    Ok(())
                } else {
                    Err(format!("characteristic {} not found", characteristic))
                }
            }),
        };

        match cached {
            Ok(()) => self.advance(link, request),
            Err(reason) => {
                log::warn!("Lookup for {} failed: {}", request.id, reason);
                self.sink.emit(request.failure(reason));
            }
        }
    }

    fn dispatch(
        &mut self,
        link: LinkToken,
        device: DeviceHandle,
        request: GattRequest,
        resolved: Resolved,
    ) {
        match (&request.op, resolved) {
            (GattOp::DiscoverServices { .. }, Resolved::Device) => {
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Services(platform.services(device).await)
                });
            }
            (GattOp::DiscoverIncludedServices { .. }, Resolved::Service(service)) => {
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Services(platform.included_services(service).await)
                });
            }
            (GattOp::DiscoverCharacteristics { .. }, Resolved::Service(service)) => {
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Characteristics(platform.characteristics(service).await)
                });
            }
            (GattOp::Read { .. }, Resolved::Characteristic(handle, _)) => {
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Value(platform.read_characteristic(handle).await)
                });
            }
            (
                GattOp::Write {
                    data,
                    without_response,
                    ..
                },
                Resolved::Characteristic(handle, _),
            ) => {
                let data = data.clone();
                let kind = if *without_response {
                    WriteKind::WithoutResponse
                } else {
                    WriteKind::WithResponse
                };
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Written(platform.write_characteristic(handle, data, kind).await)
                });
            }
            (GattOp::Notify { on, .. }, Resolved::Characteristic(handle, properties)) => {
                let value = if !*on {
                    ClientConfiguration::None
                } else if properties.contains(CharacteristicProperties::INDICATE) {
                    ClientConfiguration::Indicate
                } else {
                    ClientConfiguration::Notify
                };
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Configured {
                        characteristic: handle,
                        result: platform.write_client_configuration(handle, value).await,
                    }
                });
            }
            (GattOp::DiscoverDescriptors { .. }, Resolved::Characteristic(handle, _)) => {
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Descriptors(platform.descriptors(handle).await)
                });
            }
            (GattOp::ReadDescriptor { .. }, Resolved::Descriptor(handle)) => {
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Value(platform.read_descriptor(handle).await)
                });
            }
            (GattOp::WriteDescriptor { data, .. }, Resolved::Descriptor(handle)) => {
                let data = data.clone();
                self.spawn_gatt(link, request, move |platform| async move {
                    GattOutcome::Written(platform.write_descriptor(handle, data).await)
                });
            }
            (_, resolved) => {
                log::error!("{:?} resolved to mismatched {:?}", request.op, resolved);
                self.sink.emit(request.failure("attribute type mismatch"));
            }
        }
    }

    fn spawn_gatt<F, Fut>(&self, link: LinkToken, request: GattRequest, call: F)
    where
        F: FnOnce(Arc<dyn Platform>) -> Fut,
        Fut: Future<Output = GattOutcome> + Send + 'static,
    {
        self.native.spawn(move |platform| {
            let pending = call(platform);
            async move {
                Completion::Gatt {
                    link,
                    request,
                    outcome: pending.await,
                }
            }
        });
    }

    pub(super) fn on_gatt_complete(&mut self, link: LinkToken, request: GattRequest, outcome: GattOutcome) {
        let platform = Arc::clone(self.native.platform());
        let Some(conn) = self.registry.connection(&link) else {
            log::debug!("{} finished after {} disconnected", request.activity(), link.id);
            self.sink.emit(request.failure(DEVICE_DISCONNECTED));
            return;
        };
        let id = link.id.clone();

        let event = match (&request.op, outcome) {
            (GattOp::DiscoverServices { filter }, GattOutcome::Services(result)) => {
                require(result).map(|found| {
                    for info in &found {
                        conn.cache.upsert_service(info);
                    }
                    Event::ServicesDiscover {
                        id,
                        services: filter_uuids(found, filter, |s| s.uuid)
                            .into_iter()
                            .map(|s| s.uuid)
                            .collect(),
                        error: None,
                    }
                })
            }
            (GattOp::DiscoverIncludedServices { service, filter }, GattOutcome::Services(result)) => {
                // Included services are cached at the top level so later
                // requests can name them directly.
                require(result).map(|found| {
                    for info in &found {
                        conn.cache.upsert_service(info);
                    }
                    Event::IncludedServicesDiscover {
                        id,
                        service: *service,
                        services: filter_uuids(found, filter, |s| s.uuid)
                            .into_iter()
                            .map(|s| s.uuid)
                            .collect(),
                        error: None,
                    }
                })
            }
            (
                GattOp::DiscoverCharacteristics { service, filter },
                GattOutcome::Characteristics(result),
            ) => require(result).map(|found| {
                for info in &found {
                    conn.cache.upsert_characteristic(service, info);
                }
                Event::CharacteristicsDiscover {
                    id,
                    service: *service,
                    characteristics: filter_uuids(found, filter, |c| c.uuid)
                        .into_iter()
                        .map(|c| CharacteristicSummary {
                            uuid: c.uuid,
                            properties: c.properties,
                        })
                        .collect(),
                    error: None,
                }
            }),
            (
                GattOp::DiscoverDescriptors {
                    service,
                    characteristic,
                },
                GattOutcome::Descriptors(result),
            ) => require(result).map(|found| {
                for info in &found {
                    conn.cache.upsert_descriptor(service, characteristic, info);
                }
                Event::DescriptorsDiscover {
                    id,
                    service: *service,
                    characteristic: *characteristic,
                    descriptors: found.into_iter().map(|d| d.uuid).collect(),
                    error: None,
                }
            }),
            (
                GattOp::Read {
                    service,
                    characteristic,
                },
                GattOutcome::Value(result),
            ) => require(result).map(|data| Event::Read {
                id,
                service: *service,
                characteristic: *characteristic,
                data,
                is_notification: false,
                error: None,
            }),
            (
                GattOp::ReadDescriptor {
                    service,
                    characteristic,
                    descriptor,
                },
                GattOutcome::Value(result),
            ) => require(result).map(|data| Event::ValueRead {
                id,
                service: *service,
                characteristic: *characteristic,
                descriptor: *descriptor,
                data,
                error: None,
            }),
            (GattOp::Write { .. } | GattOp::WriteDescriptor { .. }, GattOutcome::Written(result)) => {
                result.map(|()| request.event(None)).map_err(|err| err.to_string())
            }
            (
                GattOp::Notify {
                    service,
                    characteristic,
                    on,
                },
                GattOutcome::Configured {
                    characteristic: handle,
                    result,
                },
            ) => result
                .map(|()| {
                    let key = (*service, *characteristic);
                    // A concurrent enable may already have registered.
                    if *on && !conn.notifications.is_subscribed(&key) {
                        let token = platform.watch_value(conn.device(), handle);
                        conn.notifications
                            .insert(key, Subscription::new(Arc::clone(&platform), handle, token));
                    }
                    request.event(None)
                })
                .map_err(|err| err.to_string()),
            (op, _) => {
                log::error!("completion does not match {:?}", op);
                Err("unexpected completion".to_string())
            }
        };

        match event {
            Ok(event) => self.sink.emit(event),
            Err(reason) => {
                log::warn!("{} failed for {}: {}", request.activity(), link.id, reason);
                self.sink.emit(request.failure(reason));
            }
        }
    }

    pub(super) fn on_value_changed(
        &mut self,
        device: DeviceHandle,
        characteristic: CharacteristicHandle,
        token: ListenerToken,
        data: Vec<u8>,
    ) {
        let Some((id, conn)) = self.registry.connection_by_device(device) else {
            return;
        };
        let Some(key) = conn.cache.locate_characteristic(characteristic) else {
            log::debug!("value change for unknown characteristic on {}", id);
            return;
        };
        if !conn.notifications.delivers(&key, characteristic, token) {
            log::debug!("value change without subscription on {}", id);
            return;
        }
        let (service, char_uuid) = key;
        self.sink.emit(Event::Read {
            id: id.clone(),
            service,
            characteristic: char_uuid,
            data,
            is_notification: true,
            error: None,
        });
    }
}
