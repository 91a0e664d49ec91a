//! A connected multimeter.
//!
//! [`DeviceSession`] is owned by the event loop and only changes in response to
//! transport events. Everything outside the loop sees the session through a
//! cloneable [`SessionHandle`].

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::measurement::Reading;
use crate::proto::decode;
use crate::proto::gatt::{
    Uuid16, COMMAND_CHARACTERISTIC, CONTROL_CHARACTERISTIC, MEASUREMENT_CHARACTERISTIC,
    OWON_SERVICE,
};
use crate::transport::{PeripheralId, Transport, TransportEvent};
use crate::Config;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    /// Terminal, a session never reconnects.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    pub last_reading: Option<Reading>,
}

/// Published for every successfully decoded frame.
#[derive(Debug, Clone)]
pub struct ReadingEvent {
    pub session: SessionId,
    pub reading: Reading,
}

/// The three endpoints of the multimeter service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristics {
    pub command: Uuid16,
    pub control: Uuid16,
    pub measurement: Uuid16,
}

impl Characteristics {
    /// Picks the expected endpoints out of a discovered characteristic table.
    pub fn resolve(service: Uuid16, characteristics: &[Uuid16]) -> Option<Self> {
        if service != OWON_SERVICE {
            return None;
        }
        let find = |uuid: Uuid16| characteristics.iter().copied().find(|c| *c == uuid);
        Some(Self {
            command: find(COMMAND_CHARACTERISTIC)?,
            control: find(CONTROL_CHARACTERISTIC)?,
            measurement: find(MEASUREMENT_CHARACTERISTIC)?,
        })
    }
}

pub struct DeviceSession {
    id: SessionId,
    peripheral: PeripheralId,
    characteristics: Characteristics,
    state: watch::Sender<SessionState>,
    readings: broadcast::Sender<ReadingEvent>,
}

impl DeviceSession {
    /// Take over a peripheral whose characteristics have been discovered.
    ///
    /// Returns `None` if the peripheral is not a multimeter or the transport
    /// refuses to subscribe to the measurement endpoint.
    pub fn attach<T: Transport + ?Sized>(
        transport: &T,
        peripheral: &PeripheralId,
        service: Uuid16,
        characteristics: &[Uuid16],
        config: &Config,
    ) -> Option<Self> {
        let characteristics = Characteristics::resolve(service, characteristics)?;

        if let Err(err) = transport
            .set_notify(peripheral, characteristics.measurement, true)
            .and_then(|_| transport.read_value(peripheral, characteristics.measurement))
        {
            warn!(%peripheral, "Unable to subscribe to measurements: {}", err);
            return None;
        }

        let (state, _) = watch::channel(SessionState {
            status: SessionStatus::Active,
            last_reading: None,
        });
        let (readings, _) = broadcast::channel(config.reading_capacity.max(1));

        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        info!(%peripheral, session = %id, "Multimeter session established");

        Some(Self {
            id,
            peripheral: peripheral.clone(),
            characteristics,
            state,
            readings,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    pub fn characteristics(&self) -> Characteristics {
        self.characteristics
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            peripheral: self.peripheral.clone(),
            state: self.state.subscribe(),
            readings: self.readings.clone(),
        }
    }

    /// Apply an event addressed to this session's peripheral.
    pub fn handle_event(&mut self, event: &TransportEvent) -> SessionStatus {
        if event.peripheral() != Some(&self.peripheral) {
            return self.status();
        }
        match event {
            TransportEvent::ValueUpdated {
                characteristic,
                value,
                ..
            } => {
                if *characteristic == self.characteristics.measurement {
                    self.on_measurement(value);
                } else {
                    trace!(peripheral = %self.peripheral, %characteristic, "Ignoring value update");
                }
            }
            TransportEvent::Disconnected(_) => {
                if self.status() == SessionStatus::Active {
                    info!(peripheral = %self.peripheral, session = %self.id, "Multimeter disconnected");
                    self.state.send_modify(|s| s.status = SessionStatus::Disconnected);
                }
            }
            TransportEvent::Connected(_) => {
                debug!(peripheral = %self.peripheral, status = ?self.status(), "Connect event for session");
            }
            _ => {}
        }
        self.status()
    }

    fn on_measurement(&self, value: &[u8]) {
        if self.status() == SessionStatus::Disconnected {
            return;
        }
        match decode(value, Utc::now()) {
            Ok(reading) => {
                trace!(peripheral = %self.peripheral, %reading, "Measurement");
                self.state
                    .send_modify(|s| s.last_reading = Some(reading.clone()));
                // No subscribers is fine, readings are live only.
                let _ = self.readings.send(ReadingEvent {
                    session: self.id,
                    reading,
                });
            }
            Err(err) => {
                warn!(peripheral = %self.peripheral, "Dropping measurement frame {:02x?}: {}", value, err);
            }
        }
    }

    /// Give the peripheral back to the transport.
    pub fn release<T: Transport + ?Sized>(self, transport: &T) {
        if self.status() == SessionStatus::Active {
            if let Err(err) = transport
                .set_notify(&self.peripheral, self.characteristics.measurement, false)
                .and_then(|_| transport.cancel_connection(&self.peripheral))
            {
                debug!(peripheral = %self.peripheral, "Release failed: {}", err);
            }
        }
        self.state
            .send_modify(|s| s.status = SessionStatus::Disconnected);
    }
}

/// Read access to a session for observers.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peripheral: PeripheralId,
    state: watch::Receiver<SessionState>,
    readings: broadcast::Sender<ReadingEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().status == SessionStatus::Active
    }

    pub fn last_reading(&self) -> Option<Reading> {
        self.state.borrow().last_reading.clone()
    }

    /// Stream of readings decoded after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ReadingEvent> {
        self.readings.subscribe()
    }

    /// Wait for the next reading. `None` once the session is gone.
    pub async fn next_reading(&self) -> Option<Reading> {
        let mut readings = self.readings.subscribe();
        let mut state = self.state.clone();
        loop {
            if state.borrow_and_update().status == SessionStatus::Disconnected {
                return None;
            }
            tokio::select! {
                event = readings.recv() => match event {
                    Ok(event) => return Some(event.reading),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Resolves once the peripheral disconnected or the session was dropped.
    pub async fn disconnected(&self) {
        let mut state = self.state.clone();
        while state.borrow_and_update().status == SessionStatus::Active {
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}
