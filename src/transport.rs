//! Boundary to the Bluetooth stack.
//!
//! Requests are fire-and-forget: a `Transport` method only reports whether the
//! request could be issued. Outcomes arrive later as [`TransportEvent`]s on the
//! channel the backend was created with, one at a time and in order.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use crate::proto::gatt::Uuid16;

#[cfg(test)]
pub(crate) mod fake;

/// Opaque, backend assigned peripheral identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Unsupported,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_usable(&self) -> bool {
        *self == RadioState::PoweredOn
    }
}

/// Advertisement metadata of a discovered peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(RadioState),
    PeripheralDiscovered {
        peripheral: PeripheralId,
        advertisement: Advertisement,
    },
    Connected(PeripheralId),
    ConnectFailed(PeripheralId),
    Disconnected(PeripheralId),
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<Uuid16>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid16,
        characteristics: Vec<Uuid16>,
    },
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: Uuid16,
        value: Bytes,
    },
}

impl TransportEvent {
    /// Peripheral this event belongs to, `None` for adapter wide events.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            TransportEvent::StateChanged(_) => None,
            TransportEvent::PeripheralDiscovered { peripheral, .. }
            | TransportEvent::ServicesDiscovered { peripheral, .. }
            | TransportEvent::CharacteristicsDiscovered { peripheral, .. }
            | TransportEvent::ValueUpdated { peripheral, .. } => Some(peripheral),
            TransportEvent::Connected(peripheral)
            | TransportEvent::ConnectFailed(peripheral)
            | TransportEvent::Disconnected(peripheral) => Some(peripheral),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth radio is not available")]
    Unavailable,
    #[error("Unknown peripheral: {}", _0)]
    UnknownPeripheral(PeripheralId),
    #[error("Unknown characteristic {} on {}", _1, _0)]
    UnknownCharacteristic(PeripheralId, Uuid16),
    #[error("Transport request failed: {}", _0)]
    Request(String),
}

pub type TransportResult = std::result::Result<(), TransportError>;

/// Requests the discovery and session logic issues to the Bluetooth stack.
pub trait Transport: Send + Sync {
    fn radio_state(&self) -> RadioState;

    /// Start reporting advertisements. An empty filter reports every peripheral.
    fn scan(&self, services: &[Uuid16]) -> TransportResult;

    fn stop_scan(&self) -> TransportResult;

    fn connect(&self, peripheral: &PeripheralId) -> TransportResult;

    fn cancel_connection(&self, peripheral: &PeripheralId) -> TransportResult;

    fn discover_services(&self, peripheral: &PeripheralId) -> TransportResult;

    fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid16)
        -> TransportResult;

    fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid16,
        enabled: bool,
    ) -> TransportResult;

    fn read_value(&self, peripheral: &PeripheralId, characteristic: Uuid16) -> TransportResult;
}
