use std::collections::HashSet;
use std::sync::Mutex;

use super::{PeripheralId, RadioState, Transport, TransportError, TransportResult};
use crate::proto::gatt::Uuid16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Scan(Vec<Uuid16>),
    StopScan,
    Connect(PeripheralId),
    CancelConnection(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(PeripheralId, Uuid16),
    SetNotify(PeripheralId, Uuid16, bool),
    ReadValue(PeripheralId, Uuid16),
}

/// Records every request instead of talking to a radio.
pub(crate) struct FakeTransport {
    state: Mutex<RadioState>,
    requests: Mutex<Vec<Request>>,
    refuse: Mutex<HashSet<PeripheralId>>,
}

impl FakeTransport {
    pub(crate) fn new(state: RadioState) -> Self {
        Self {
            state: Mutex::new(state),
            requests: Mutex::new(Vec::new()),
            refuse: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn set_radio_state(&self, state: RadioState) {
        *self.state.lock().expect("state lock") = state;
    }

    /// Every request for this peripheral is rejected from now on.
    pub(crate) fn refuse(&self, peripheral: &PeripheralId) {
        self.refuse
            .lock()
            .expect("refuse lock")
            .insert(peripheral.clone());
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub(crate) fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut *self.requests.lock().expect("requests lock"))
    }

    fn record(&self, peripheral: Option<&PeripheralId>, request: Request) -> TransportResult {
        if let Some(peripheral) = peripheral {
            if self.refuse.lock().expect("refuse lock").contains(peripheral) {
                return Err(TransportError::UnknownPeripheral(peripheral.clone()));
            }
        }
        self.requests.lock().expect("requests lock").push(request);
        Ok(())
    }
}

impl Transport for FakeTransport {
    fn radio_state(&self) -> RadioState {
        *self.state.lock().expect("state lock")
    }

    fn scan(&self, services: &[Uuid16]) -> TransportResult {
        if !self.radio_state().is_usable() {
            return Err(TransportError::Unavailable);
        }
        self.record(None, Request::Scan(services.to_vec()))
    }

    fn stop_scan(&self) -> TransportResult {
        self.record(None, Request::StopScan)
    }

    fn connect(&self, peripheral: &PeripheralId) -> TransportResult {
        self.record(Some(peripheral), Request::Connect(peripheral.clone()))
    }

    fn cancel_connection(&self, peripheral: &PeripheralId) -> TransportResult {
        self.record(
            Some(peripheral),
            Request::CancelConnection(peripheral.clone()),
        )
    }

    fn discover_services(&self, peripheral: &PeripheralId) -> TransportResult {
        self.record(
            Some(peripheral),
            Request::DiscoverServices(peripheral.clone()),
        )
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid16,
    ) -> TransportResult {
        self.record(
            Some(peripheral),
            Request::DiscoverCharacteristics(peripheral.clone(), service),
        )
    }

    fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid16,
        enabled: bool,
    ) -> TransportResult {
        self.record(
            Some(peripheral),
            Request::SetNotify(peripheral.clone(), characteristic, enabled),
        )
    }

    fn read_value(&self, peripheral: &PeripheralId, characteristic: Uuid16) -> TransportResult {
        self.record(
            Some(peripheral),
            Request::ReadValue(peripheral.clone(), characteristic),
        )
    }
}
