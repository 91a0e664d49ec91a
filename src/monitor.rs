//! Event loop tying scanner, sessions and transport together.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::device::{DeviceSession, SessionHandle, SessionStatus};
use crate::proto::{ProtoError, Result};
use crate::scanner::Scanner;
use crate::transport::{PeripheralId, Transport, TransportEvent};
use crate::Config;

/// Sessions currently owned by the monitor, keyed by peripheral.
#[derive(Default)]
pub struct DeviceRegistry {
    sessions: HashMap<PeripheralId, DeviceSession>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session previously registered for the same peripheral.
    pub fn add(&mut self, session: DeviceSession) -> Option<DeviceSession> {
        self.sessions.insert(session.peripheral().clone(), session)
    }

    pub fn remove(&mut self, peripheral: &PeripheralId) -> Option<DeviceSession> {
        self.sessions.remove(peripheral)
    }

    pub fn get(&self, peripheral: &PeripheralId) -> Option<&DeviceSession> {
        self.sessions.get(peripheral)
    }

    pub fn contains(&self, peripheral: &PeripheralId) -> bool {
        self.sessions.contains_key(peripheral)
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.values().map(DeviceSession::handle).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn get_mut(&mut self, peripheral: &PeripheralId) -> Option<&mut DeviceSession> {
        self.sessions.get_mut(peripheral)
    }

    fn drain(&mut self) -> impl Iterator<Item = DeviceSession> + '_ {
        self.sessions.drain().map(|(_, session)| session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    SetScanning(bool),
    Shutdown,
}

pub struct Monitor<T: Transport + ?Sized> {
    transport: Arc<T>,
    scanner: Scanner<T>,
    registry: DeviceRegistry,
}

impl<T: Transport + ?Sized + 'static> Monitor<T> {
    pub fn new(transport: Arc<T>, config: Config) -> Self {
        Self {
            scanner: Scanner::new(transport.clone(), config),
            transport,
            registry: DeviceRegistry::new(),
        }
    }

    pub fn scanner(&self) -> &Scanner<T> {
        &self.scanner
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn set_scanning(&mut self, active: bool) {
        self.scanner.set_active(active);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionHandle> {
        self.scanner.subscribe()
    }

    /// Route one transport event to the session owning the peripheral,
    /// or to the scanner if nobody owns it yet.
    pub fn dispatch(&mut self, event: TransportEvent) {
        if let Some(peripheral) = event.peripheral() {
            if let Some(session) = self.registry.get_mut(peripheral) {
                if session.handle_event(&event) == SessionStatus::Disconnected {
                    let peripheral = peripheral.clone();
                    if let Some(session) = self.registry.remove(&peripheral) {
                        debug!(%peripheral, session = %session.id(), "Session removed");
                    }
                }
                return;
            }
        }
        if let Some(session) = self.scanner.handle_event(&event) {
            if let Some(previous) = self.registry.add(session) {
                previous.release(self.transport.as_ref());
            }
        }
    }

    /// Stop scanning and hand every peripheral back to the transport.
    pub fn shutdown(&mut self) {
        self.scanner.set_active(false);
        self.scanner.teardown();
        for session in self.registry.drain() {
            session.release(self.transport.as_ref());
        }
    }

    /// Process events until the transport or the controlling handle goes away.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        debug!("Transport event channel closed");
                        break;
                    }
                },
                cmd = control.recv() => match cmd {
                    Some(Control::SetScanning(active)) => self.set_scanning(active),
                    Some(Control::Shutdown) | None => break,
                },
            }
        }
        self.shutdown();
        info!("Monitor stopped");
    }

    pub fn spawn(self, events: mpsc::UnboundedReceiver<TransportEvent>) -> MonitorHandle
    where
        T: Send + Sync,
    {
        let (control, control_rx) = mpsc::unbounded_channel();
        let discovered = self.scanner.discovered_sender();
        let task = tokio::spawn(self.run(events, control_rx));
        MonitorHandle {
            control,
            discovered,
            task,
        }
    }
}

/// Controls a monitor running on its own task.
pub struct MonitorHandle {
    control: mpsc::UnboundedSender<Control>,
    discovered: broadcast::Sender<SessionHandle>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn set_scanning(&self, active: bool) -> Result<()> {
        self.control
            .send(Control::SetScanning(active))
            .map_err(|_| ProtoError::Abort)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionHandle> {
        self.discovered.subscribe()
    }

    /// Wait for the next multimeter. `None` once the monitor stopped.
    pub async fn next_device(&self) -> Option<SessionHandle> {
        let mut devices = self.discovered.subscribe();
        loop {
            tokio::select! {
                device = devices.recv() => match device {
                    Ok(device) => return Some(device),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                },
                _ = self.control.closed() => return None,
            }
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        // Already stopped if the send fails, joining still reaps the task.
        let _ = self.control.send(Control::Shutdown);
        self.task.await.map_err(|_| ProtoError::Abort)
    }
}
