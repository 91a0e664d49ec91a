//! [`Transport`] implementation on top of btleplug.

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::proto::gatt::Uuid16;
use crate::proto::{ProtoError, Result};
use crate::transport::{
    Advertisement, PeripheralId, RadioState, Transport, TransportError, TransportEvent,
    TransportResult,
};

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const SHORT_UUID_MASK: u128 = 0xffff_ffff << 96;

pub fn to_uuid(short: Uuid16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short.0 as u128) << 96))
}

/// Short form of a UUID derived from the Bluetooth base UUID.
pub fn to_uuid16(uuid: Uuid) -> Option<Uuid16> {
    let value = uuid.as_u128();
    if value & !SHORT_UUID_MASK != BLUETOOTH_BASE_UUID || value >> 112 != 0 {
        return None;
    }
    Some(Uuid16((value >> 96) as u16))
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

type Peripherals = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

pub struct BtleTransport {
    adapter: Adapter,
    runtime: Handle,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<Mutex<RadioState>>,
    peripherals: Peripherals,
    forwarding: Arc<Mutex<HashSet<PeripheralId>>>,
}

impl BtleTransport {
    /// Use the first Bluetooth adapter of the host.
    pub async fn first_adapter() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)>
    {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ProtoError::Transport(TransportError::Unavailable))?;
        Self::new(adapter).await
    }

    pub async fn new(
        adapter: Adapter,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let central_events = adapter.events().await?;

        let transport = Arc::new(Self {
            adapter: adapter.clone(),
            runtime: Handle::current(),
            events: events.clone(),
            state: Arc::new(Mutex::new(RadioState::Unknown)),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            forwarding: Arc::new(Mutex::new(HashSet::new())),
        });

        let state = transport.state.clone();
        let peripherals = transport.peripherals.clone();
        tokio::spawn(async move {
            let mut central_events = central_events;
            while let Some(event) = central_events.next().await {
                let forwarded = match event {
                    CentralEvent::DeviceDiscovered(id) => {
                        let peripheral = match adapter.peripheral(&id).await {
                            Ok(peripheral) => peripheral,
                            Err(err) => {
                                debug!("Discovered peripheral vanished: {}", err);
                                continue;
                            }
                        };
                        let props = peripheral.properties().await.ok().flatten();
                        let advertisement = Advertisement {
                            local_name: props.as_ref().and_then(|p| p.local_name.clone()),
                            rssi: props.as_ref().and_then(|p| p.rssi),
                            services: props
                                .map(|p| p.services.into_iter().filter_map(to_uuid16).collect())
                                .unwrap_or_default(),
                        };
                        let id = PeripheralId::new(id.to_string());
                        peripherals
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(id.clone(), peripheral);
                        TransportEvent::PeripheralDiscovered {
                            peripheral: id,
                            advertisement,
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        TransportEvent::Disconnected(PeripheralId::new(id.to_string()))
                    }
                    CentralEvent::StateUpdate(new_state) => {
                        let new_state = radio_state(new_state);
                        *state.lock().unwrap_or_else(|e| e.into_inner()) = new_state;
                        TransportEvent::StateChanged(new_state)
                    }
                    _ => continue,
                };
                if events.send(forwarded).is_err() {
                    debug!("Event receiver dropped, stop forwarding adapter events");
                    break;
                }
            }
        });

        let initial = match transport.adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            // Not every backend reports a state; assume usable and let scan() fail.
            Err(err) => {
                debug!("Adapter state unavailable: {}", err);
                RadioState::PoweredOn
            }
        };
        *transport.state.lock().unwrap_or_else(|e| e.into_inner()) = initial;
        // Receiver is in our hands, this cannot fail.
        let _ = transport.events.send(TransportEvent::StateChanged(initial));

        Ok((transport, events_rx))
    }

    fn peripheral(&self, id: &PeripheralId) -> std::result::Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(id.clone()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        id: &PeripheralId,
        uuid: Uuid16,
    ) -> std::result::Result<Characteristic, TransportError> {
        let wanted = to_uuid(uuid);
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == wanted)
            .ok_or_else(|| TransportError::UnknownCharacteristic(id.clone(), uuid))
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    /// Forward notifications of a peripheral as value updates, once per peripheral.
    fn forward_notifications(&self, id: &PeripheralId, peripheral: &Peripheral) {
        if !self
            .forwarding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone())
        {
            return;
        }
        let id = id.clone();
        let peripheral = peripheral.clone();
        let events = self.events.clone();
        let forwarding = self.forwarding.clone();
        self.spawn(async move {
            match peripheral.notifications().await {
                Ok(mut notifications) => {
                    while let Some(notification) = notifications.next().await {
                        let Some(characteristic) = to_uuid16(notification.uuid) else {
                            continue;
                        };
                        let event = TransportEvent::ValueUpdated {
                            peripheral: id.clone(),
                            characteristic,
                            value: Bytes::from(notification.value),
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(err) => warn!(peripheral = %id, "No notification stream: {}", err),
            }
            forwarding
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        });
    }
}

fn request_failed(err: btleplug::Error) -> TransportError {
    TransportError::Request(err.to_string())
}

impl Transport for BtleTransport {
    fn radio_state(&self) -> RadioState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scan(&self, services: &[Uuid16]) -> TransportResult {
        if !self.radio_state().is_usable() {
            return Err(TransportError::Unavailable);
        }
        let filter = ScanFilter {
            services: services.iter().copied().map(to_uuid).collect(),
        };
        let adapter = self.adapter.clone();
        self.spawn(async move {
            if let Err(err) = adapter.start_scan(filter).await {
                warn!("Start scan failed: {}", err);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> TransportResult {
        let adapter = self.adapter.clone();
        self.spawn(async move {
            if let Err(err) = adapter.stop_scan().await {
                debug!("Stop scan failed: {}", err);
            }
        });
        Ok(())
    }

    fn connect(&self, id: &PeripheralId) -> TransportResult {
        let peripheral = self.peripheral(id)?;
        let id = id.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::Connected(id),
                Err(err) => {
                    debug!(peripheral = %id, "Connect failed: {}", err);
                    TransportEvent::ConnectFailed(id)
                }
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn cancel_connection(&self, id: &PeripheralId) -> TransportResult {
        let peripheral = self.peripheral(id)?;
        let id = id.clone();
        self.spawn(async move {
            if let Err(err) = peripheral.disconnect().await {
                debug!(peripheral = %id, "Disconnect failed: {}", err);
            }
        });
        Ok(())
    }

    fn discover_services(&self, id: &PeripheralId) -> TransportResult {
        let peripheral = self.peripheral(id)?;
        let id = id.clone();
        let events = self.events.clone();
        self.spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral
                        .services()
                        .into_iter()
                        .filter_map(|s| to_uuid16(s.uuid))
                        .collect();
                    let _ = events.send(TransportEvent::ServicesDiscovered {
                        peripheral: id,
                        services,
                    });
                }
                Err(err) => {
                    warn!(peripheral = %id, "Service discovery failed: {}", err);
                    // Hang up, the disconnect event releases the candidate.
                    let _ = peripheral.disconnect().await;
                }
            }
        });
        Ok(())
    }

    fn discover_characteristics(&self, id: &PeripheralId, service: Uuid16) -> TransportResult {
        // btleplug resolves characteristics together with the services.
        let peripheral = self.peripheral(id)?;
        let wanted = to_uuid(service);
        let characteristics = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == wanted)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .filter_map(|c| to_uuid16(c.uuid))
                    .collect()
            })
            .unwrap_or_default();
        self.events
            .send(TransportEvent::CharacteristicsDiscovered {
                peripheral: id.clone(),
                service,
                characteristics,
            })
            .map_err(|_| TransportError::Unavailable)
    }

    fn set_notify(&self, id: &PeripheralId, characteristic: Uuid16, enabled: bool) -> TransportResult {
        let peripheral = self.peripheral(id)?;
        let target = Self::characteristic(&peripheral, id, characteristic)?;
        if enabled {
            self.forward_notifications(id, &peripheral);
        }
        let id = id.clone();
        self.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            if let Err(err) = result {
                warn!(peripheral = %id, %characteristic, "{}", request_failed(err));
            }
        });
        Ok(())
    }

    fn read_value(&self, id: &PeripheralId, characteristic: Uuid16) -> TransportResult {
        let peripheral = self.peripheral(id)?;
        let target = Self::characteristic(&peripheral, id, characteristic)?;
        let id = id.clone();
        let events = self.events.clone();
        self.spawn(async move {
            match peripheral.read(&target).await {
                Ok(value) => {
                    let _ = events.send(TransportEvent::ValueUpdated {
                        peripheral: id,
                        characteristic,
                        value: Bytes::from(value),
                    });
                }
                Err(err) => warn!(peripheral = %id, %characteristic, "Read failed: {}", err),
            }
        });
        Ok(())
    }
}
