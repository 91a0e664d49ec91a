//! Discovery of multimeters.
//!
//! The scanner connects to every peripheral it sees, because the meter does
//! not advertise its service. After connecting it looks for the multimeter
//! service and, if present, hands the peripheral over to a [`DeviceSession`].
//!
//! ```text
//!  discovered ──► Connecting ──► DiscoveringServices ──► DiscoveringCharacteristics ──► session
//!                     │                  │                          │
//!                     └─ failed          └─ no service: abandon     └─ incomplete: abandon
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device::{DeviceSession, SessionHandle};
use crate::proto::gatt::{Uuid16, OWON_SERVICE};
use crate::transport::{PeripheralId, RadioState, Transport, TransportEvent};
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
}

pub struct Scanner<T: Transport + ?Sized> {
    transport: Arc<T>,
    config: Config,
    active: bool,
    scanning: bool,
    candidates: HashMap<PeripheralId, CandidateState>,
    rejected: HashSet<PeripheralId>,
    discovered: broadcast::Sender<SessionHandle>,
}

impl<T: Transport + ?Sized> Scanner<T> {
    pub fn new(transport: Arc<T>, config: Config) -> Self {
        let (discovered, _) = broadcast::channel(config.device_capacity.max(1));
        Self {
            transport,
            config,
            active: false,
            scanning: false,
            candidates: HashMap::new(),
            rejected: HashSet::new(),
            discovered,
        }
    }

    /// Multimeters promoted to a session from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionHandle> {
        self.discovered.subscribe()
    }

    pub(crate) fn discovered_sender(&self) -> broadcast::Sender<SessionHandle> {
        self.discovered.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether a scan request is outstanding at the transport.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn candidate(&self, peripheral: &PeripheralId) -> Option<CandidateState> {
        self.candidates.get(peripheral).copied()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &PeripheralId> {
        self.candidates.keys()
    }

    /// Enable or disable scanning. Connections in flight are not cancelled.
    pub fn set_active(&mut self, active: bool) {
        if self.active == active {
            return;
        }
        self.active = active;
        if active {
            self.update();
        } else if self.scanning {
            self.scanning = false;
            if let Err(err) = self.transport.stop_scan() {
                debug!("Stop scan failed: {}", err);
            }
        }
    }

    fn update(&mut self) {
        if !self.active || self.scanning {
            return;
        }
        let state = self.transport.radio_state();
        if !state.is_usable() {
            debug!(?state, "Radio not ready, scan deferred");
            return;
        }
        let filter: [Uuid16; 0] = [];
        match self.transport.scan(&filter) {
            Ok(()) => {
                self.scanning = true;
                info!("Start scanning for peripherals");
            }
            Err(err) => warn!("Scan request failed: {}", err),
        }
    }

    /// Apply a transport event. Returns the session if the event completed
    /// discovery of a multimeter; the caller owns it from then on.
    pub fn handle_event(&mut self, event: &TransportEvent) -> Option<DeviceSession> {
        match event {
            TransportEvent::StateChanged(state) => {
                self.on_state_changed(*state);
                None
            }
            TransportEvent::PeripheralDiscovered {
                peripheral,
                advertisement,
            } => {
                if self.candidates.contains_key(peripheral) || self.rejected.contains(peripheral)
                {
                    return None;
                }
                debug!(%peripheral, name = ?advertisement.local_name, rssi = ?advertisement.rssi, "Did discover peripheral");
                self.candidates
                    .insert(peripheral.clone(), CandidateState::Connecting);
                if let Err(err) = self.transport.connect(peripheral) {
                    warn!(%peripheral, "Connect request failed: {}", err);
                    self.candidates.remove(peripheral);
                }
                None
            }
            TransportEvent::Connected(peripheral) => {
                if self.candidate(peripheral) != Some(CandidateState::Connecting) {
                    return None;
                }
                debug!(%peripheral, "Did connect peripheral");
                match self.transport.discover_services(peripheral) {
                    Ok(()) => {
                        self.candidates
                            .insert(peripheral.clone(), CandidateState::DiscoveringServices);
                    }
                    Err(err) => {
                        warn!(%peripheral, "Service discovery request failed: {}", err);
                        self.abandon(peripheral);
                    }
                }
                None
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
            } => {
                if self.candidate(peripheral) != Some(CandidateState::DiscoveringServices) {
                    return None;
                }
                if !services.contains(&OWON_SERVICE) {
                    debug!(%peripheral, "No multimeter service");
                    self.abandon(peripheral);
                    return None;
                }
                match self
                    .transport
                    .discover_characteristics(peripheral, OWON_SERVICE)
                {
                    Ok(()) => {
                        self.candidates.insert(
                            peripheral.clone(),
                            CandidateState::DiscoveringCharacteristics,
                        );
                    }
                    Err(err) => {
                        warn!(%peripheral, "Characteristic discovery request failed: {}", err);
                        self.abandon(peripheral);
                    }
                }
                None
            }
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
            } => {
                if self.candidate(peripheral)
                    != Some(CandidateState::DiscoveringCharacteristics)
                {
                    return None;
                }
                match DeviceSession::attach(
                    self.transport.as_ref(),
                    peripheral,
                    *service,
                    characteristics,
                    &self.config,
                ) {
                    Some(session) => {
                        self.candidates.remove(peripheral);
                        info!(%peripheral, "Did discover multimeter");
                        // Nobody listening yet is fine, the caller still gets the session.
                        let _ = self.discovered.send(session.handle());
                        Some(session)
                    }
                    None => {
                        debug!(%peripheral, "Multimeter characteristics incomplete");
                        self.abandon(peripheral);
                        None
                    }
                }
            }
            TransportEvent::ConnectFailed(peripheral) | TransportEvent::Disconnected(peripheral) => {
                if self.candidates.remove(peripheral).is_some() {
                    debug!(%peripheral, "Candidate lost: {:?}", event);
                }
                None
            }
            TransportEvent::ValueUpdated { .. } => None,
        }
    }

    fn on_state_changed(&mut self, state: RadioState) {
        debug!(?state, "Radio state changed");
        if !state.is_usable() {
            // A powered down radio drops the running scan.
            self.scanning = false;
            return;
        }
        self.update();
    }

    /// Not a multimeter: forget the candidate and hang up.
    fn abandon(&mut self, peripheral: &PeripheralId) {
        if self.candidates.remove(peripheral).is_none() {
            return;
        }
        self.rejected.insert(peripheral.clone());
        if let Err(err) = self.transport.cancel_connection(peripheral) {
            debug!(%peripheral, "Cancel connection failed: {}", err);
        }
    }

    /// Drop all pending candidates, no further events reach them.
    pub fn teardown(&mut self) {
        for (peripheral, _) in self.candidates.drain() {
            debug!(%peripheral, "Releasing pending candidate");
        }
    }
}

impl<T: Transport + ?Sized> Drop for Scanner<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::gatt::{
        COMMAND_CHARACTERISTIC, CONTROL_CHARACTERISTIC, MEASUREMENT_CHARACTERISTIC,
    };
    use crate::transport::fake::{FakeTransport, Request};
    use crate::transport::Advertisement;

    fn discovered(id: &str) -> TransportEvent {
        TransportEvent::PeripheralDiscovered {
            peripheral: PeripheralId::new(id),
            advertisement: Advertisement {
                local_name: Some("BDM".to_string()),
                rssi: Some(-60),
                services: Vec::new(),
            },
        }
    }

    fn services(id: &str, services: &[Uuid16]) -> TransportEvent {
        TransportEvent::ServicesDiscovered {
            peripheral: PeripheralId::new(id),
            services: services.to_vec(),
        }
    }

    fn characteristics(id: &str, characteristics: &[Uuid16]) -> TransportEvent {
        TransportEvent::CharacteristicsDiscovered {
            peripheral: PeripheralId::new(id),
            service: OWON_SERVICE,
            characteristics: characteristics.to_vec(),
        }
    }

    fn scanner(state: RadioState) -> (Arc<FakeTransport>, Scanner<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new(state));
        let scanner = Scanner::new(transport.clone(), Config::default());
        (transport, scanner)
    }

    fn connect_to(scanner: &mut Scanner<FakeTransport>, id: &str) {
        assert!(scanner.handle_event(&discovered(id)).is_none());
        assert!(scanner
            .handle_event(&TransportEvent::Connected(PeripheralId::new(id)))
            .is_none());
    }

    #[test]
    fn scan_deferred_until_powered_on() {
        let (transport, mut scanner) = scanner(RadioState::Unknown);
        scanner.set_active(true);
        assert!(scanner.is_active());
        assert!(!scanner.is_scanning());
        assert!(transport.requests().is_empty());

        scanner.handle_event(&TransportEvent::StateChanged(RadioState::PoweredOff));
        assert!(transport.requests().is_empty());

        transport.set_radio_state(RadioState::PoweredOn);
        scanner.handle_event(&TransportEvent::StateChanged(RadioState::PoweredOn));
        scanner.handle_event(&TransportEvent::StateChanged(RadioState::PoweredOn));
        scanner.set_active(true);

        assert_eq!(transport.requests(), vec![Request::Scan(Vec::new())]);
        assert!(scanner.is_scanning());
    }

    #[test]
    fn inactive_scanner_ignores_power_on() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        scanner.handle_event(&TransportEvent::StateChanged(RadioState::PoweredOn));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn deactivate_stops_scan() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        scanner.set_active(true);
        scanner.set_active(false);
        scanner.set_active(false);
        assert_eq!(
            transport.requests(),
            vec![Request::Scan(Vec::new()), Request::StopScan]
        );
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn rescan_after_radio_cycle() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        scanner.set_active(true);
        transport.set_radio_state(RadioState::PoweredOff);
        scanner.handle_event(&TransportEvent::StateChanged(RadioState::PoweredOff));
        assert!(!scanner.is_scanning());
        transport.set_radio_state(RadioState::PoweredOn);
        scanner.handle_event(&TransportEvent::StateChanged(RadioState::PoweredOn));
        assert_eq!(
            transport.requests(),
            vec![Request::Scan(Vec::new()), Request::Scan(Vec::new())]
        );
    }

    #[test]
    fn discovered_peripheral_is_connected_once() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        scanner.handle_event(&discovered("a"));
        scanner.handle_event(&discovered("a"));
        assert_eq!(
            transport.requests(),
            vec![Request::Connect(PeripheralId::new("a"))]
        );
        assert_eq!(
            scanner.candidate(&PeripheralId::new("a")),
            Some(CandidateState::Connecting)
        );
    }

    #[test]
    fn promotes_multimeter() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        let mut rx = scanner.subscribe();
        let p = PeripheralId::new("meter");

        connect_to(&mut scanner, "meter");
        assert!(scanner.handle_event(&services("meter", &[Uuid16(0x1800), OWON_SERVICE])).is_none());
        let session = scanner
            .handle_event(&characteristics(
                "meter",
                &[
                    COMMAND_CHARACTERISTIC,
                    Uuid16(0xfff2),
                    CONTROL_CHARACTERISTIC,
                    MEASUREMENT_CHARACTERISTIC,
                ],
            ))
            .expect("session");

        assert_eq!(session.peripheral(), &p);
        assert_eq!(scanner.candidate(&p), None);
        let handle = rx.try_recv().expect("discovered event");
        assert_eq!(handle.id(), session.id());
        assert!(handle.is_connected());

        assert_eq!(
            transport.requests(),
            vec![
                Request::Connect(p.clone()),
                Request::DiscoverServices(p.clone()),
                Request::DiscoverCharacteristics(p.clone(), OWON_SERVICE),
                Request::SetNotify(p.clone(), MEASUREMENT_CHARACTERISTIC, true),
                Request::ReadValue(p, MEASUREMENT_CHARACTERISTIC),
            ]
        );
    }

    #[test]
    fn abandons_peripheral_without_service() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        let mut rx = scanner.subscribe();
        let p = PeripheralId::new("headset");

        connect_to(&mut scanner, "headset");
        scanner.handle_event(&services("headset", &[Uuid16(0x180f)]));
        assert_eq!(scanner.candidate(&p), None);

        // Late events for the abandoned peripheral change nothing.
        scanner.handle_event(&TransportEvent::Disconnected(p.clone()));
        scanner.handle_event(&characteristics(
            "headset",
            &[
                COMMAND_CHARACTERISTIC,
                CONTROL_CHARACTERISTIC,
                MEASUREMENT_CHARACTERISTIC,
            ],
        ));
        scanner.handle_event(&discovered("headset"));

        assert!(rx.try_recv().is_err());
        let cancels = transport
            .requests()
            .into_iter()
            .filter(|r| *r == Request::CancelConnection(p.clone()))
            .count();
        assert_eq!(cancels, 1);
        let connects = transport
            .requests()
            .into_iter()
            .filter(|r| *r == Request::Connect(p.clone()))
            .count();
        assert_eq!(connects, 1);
    }

    #[test]
    fn missing_measurement_characteristic_is_not_promoted() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        let mut rx = scanner.subscribe();
        let p = PeripheralId::new("almost");

        connect_to(&mut scanner, "almost");
        scanner.handle_event(&services("almost", &[OWON_SERVICE]));
        let session = scanner.handle_event(&characteristics(
            "almost",
            &[COMMAND_CHARACTERISTIC, CONTROL_CHARACTERISTIC],
        ));

        assert!(session.is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(scanner.candidate(&p), None);
        assert_eq!(
            transport.requests().last(),
            Some(&Request::CancelConnection(p))
        );
    }

    #[test]
    fn failed_connection_is_forgotten() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        let p = PeripheralId::new("flaky");

        scanner.handle_event(&discovered("flaky"));
        scanner.handle_event(&TransportEvent::ConnectFailed(p.clone()));
        assert_eq!(scanner.candidate(&p), None);

        // Seen again later: tried again, no retry in between.
        scanner.handle_event(&discovered("flaky"));
        assert_eq!(
            transport.requests(),
            vec![Request::Connect(p.clone()), Request::Connect(p.clone())]
        );

        scanner.handle_event(&TransportEvent::Connected(p.clone()));
        scanner.handle_event(&TransportEvent::Disconnected(p.clone()));
        assert_eq!(scanner.candidate(&p), None);
        assert_eq!(scanner.candidates().count(), 0);
    }

    #[test]
    fn refused_connect_request_drops_candidate() {
        let (transport, mut scanner) = scanner(RadioState::PoweredOn);
        let p = PeripheralId::new("gone");
        transport.refuse(&p);
        scanner.handle_event(&discovered("gone"));
        assert_eq!(scanner.candidate(&p), None);
    }

    #[test]
    fn teardown_clears_candidates() {
        let (_transport, mut scanner) = scanner(RadioState::PoweredOn);
        scanner.handle_event(&discovered("a"));
        scanner.handle_event(&discovered("b"));
        assert_eq!(scanner.candidates().count(), 2);
        scanner.teardown();
        assert_eq!(scanner.candidates().count(), 0);
        assert!(scanner
            .handle_event(&TransportEvent::Connected(PeripheralId::new("a")))
            .is_none());
    }
}
