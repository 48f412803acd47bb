use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::radio::{ConnectionHandle, GattService, Radio, RadioEvent, RadioPower};
use super::registry::{DiscoveredPeer, PeerKey, PeerRegistry};
use super::setup::establish_link;
use crate::error::TransportError;
use crate::link::{
    ConnectionStateMachine, LinkState, TransportKind, CANCELLED_REASON, TIMEOUT_REASON,
};

pub const POWERED_OFF_REASON: &str = "radio powered off";
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 128;

/// What the direct-link transport reports besides state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectLinkEvent {
    PowerChanged(RadioPower),
    PeerDiscovered(DiscoveredPeer),
    /// Notification or completed read from the current peer
    DataReceived { characteristic: Uuid, value: Vec<u8> },
    ReadFailed { characteristic: Uuid, reason: String },
}

#[derive(Debug, Default)]
struct DirectLinkInner {
    power: RadioPower,
    /// Active scan filter, `None` while not scanning
    scanning: Option<Vec<Uuid>>,
    registry: PeerRegistry,
    current: Option<PeerKey>,
    services: Vec<GattService>,
    attempt: u64,
}

impl DirectLinkInner {
    fn current_handle(&self) -> Option<ConnectionHandle> {
        self.current
            .and_then(|key| self.registry.get(key))
            .map(|peer| peer.handle.clone())
    }

    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .any(|c| c.uuid == characteristic)
    }
}

/// Central-role link to one peripheral at a time
pub struct DirectLinkTransport {
    radio: Arc<dyn Radio>,
    machine: Arc<ConnectionStateMachine>,
    inner: Arc<Mutex<DirectLinkInner>>,
    events: broadcast::Sender<DirectLinkEvent>,
    setup_timeout: Duration,
    shutdown: CancellationToken,
}

impl DirectLinkTransport {
    /// Builds the transport and starts pumping radio events into it
    pub async fn spawn(radio: Arc<dyn Radio>) -> Arc<Self> {
        Self::spawn_with_timeout(radio, DEFAULT_SETUP_TIMEOUT).await
    }

    pub async fn spawn_with_timeout(radio: Arc<dyn Radio>, setup_timeout: Duration) -> Arc<Self> {
        let radio_events = radio.events();
        let power = radio.power().await;
        info!("Radio is {}", power);

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let transport = Arc::new(Self {
            radio,
            machine: Arc::new(ConnectionStateMachine::new(TransportKind::DirectLink)),
            inner: Arc::new(Mutex::new(DirectLinkInner {
                power,
                ..DirectLinkInner::default()
            })),
            events,
            setup_timeout,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(pump_radio_events(
            radio_events,
            transport.inner.clone(),
            transport.machine.clone(),
            transport.events.clone(),
            transport.shutdown.clone(),
        ));

        transport
    }

    pub fn state(&self) -> LinkState {
        self.machine.state()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<LinkState> {
        self.machine.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.machine.watch()
    }

    pub fn events(&self) -> broadcast::Receiver<DirectLinkEvent> {
        self.events.subscribe()
    }

    pub async fn power(&self) -> RadioPower {
        self.inner.lock().await.power
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.lock().await.scanning.is_some()
    }

    pub async fn peers(&self) -> Vec<DiscoveredPeer> {
        self.inner.lock().await.registry.peers()
    }

    pub async fn find_peer_by_address(&self, address: &str) -> Option<DiscoveredPeer> {
        self.inner
            .lock()
            .await
            .registry
            .find_by_address(address)
            .cloned()
    }

    pub async fn current_peer(&self) -> Option<DiscoveredPeer> {
        let inner = self.inner.lock().await;
        inner.current.and_then(|key| inner.registry.get(key)).cloned()
    }

    /// Starts scanning, restarting an active scan with the new filter
    ///
    /// Does nothing unless the radio is powered on.
    pub async fn start_scanning(&self, filter: Option<Vec<Uuid>>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if !inner.power.is_on() {
            warn!("Not scanning, radio is {}", inner.power);
            return Ok(());
        }

        if inner.scanning.take().is_some() {
            if let Err(e) = self.radio.stop_scan().await {
                warn!("Stopping previous scan failed: {}", e);
            }
        }

        let filter = filter.unwrap_or_default();
        self.radio
            .start_scan(&filter)
            .await
            .map_err(|e| TransportError::RadioUnavailable(e.to_string()))?;
        info!("Scanning for peripherals ({} service filters)", filter.len());
        inner.scanning = Some(filter);
        Ok(())
    }

    pub async fn stop_scanning(&self) {
        let mut inner = self.inner.lock().await;
        if inner.scanning.take().is_none() {
            return;
        }
        match self.radio.stop_scan().await {
            Ok(()) => info!("Scan stopped"),
            Err(e) => warn!("Stopping scan failed: {}", e),
        }
    }

    /// Links to a discovered peer, replacing any current one
    ///
    /// Returns once the setup chain finished. A newer connect or disconnect
    /// supersedes this attempt, in which case it reports cancellation and
    /// releases whatever link it established.
    pub async fn connect(&self, key: PeerKey) -> Result<(), TransportError> {
        let (attempt, handle) = {
            let mut inner = self.inner.lock().await;
            let handle = inner
                .registry
                .get(key)
                .map(|peer| peer.handle.clone())
                .ok_or_else(|| TransportError::ConnectionFailed(format!("unknown peer {key}")))?;

            self.release_link(&mut inner).await;
            if !self.machine.state().is_failed() {
                self.machine.settle_disconnected();
            }
            inner.attempt += 1;
            inner.current = Some(key);
            if let Err(e) = self.machine.transition(LinkState::Connecting) {
                warn!("Direct-link connect from unexpected state: {}", e);
            }
            (inner.attempt, handle)
        };

        let outcome = tokio::time::timeout(
            self.setup_timeout,
            establish_link(self.radio.clone(), handle.clone()),
        )
        .await;

        let mut inner = self.inner.lock().await;
        if inner.attempt != attempt {
            debug!("Connect attempt {} to {} was superseded", attempt, handle);
            if matches!(outcome, Ok(Ok(_))) {
                if let Err(e) = self.radio.disconnect(&handle).await {
                    debug!("Releasing superseded link failed: {}", e);
                }
            }
            let reason = match self.machine.state() {
                LinkState::Failed(reason) if reason == POWERED_OFF_REASON => reason,
                _ => CANCELLED_REASON.to_string(),
            };
            return Err(TransportError::ConnectionFailed(reason));
        }

        let reason = match outcome {
            Ok(Ok(services)) => {
                inner.services = services;
                if let Err(e) = self.machine.transition(LinkState::Connected) {
                    error!("{}", e);
                }
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => TIMEOUT_REASON.to_string(),
        };

        warn!("Direct link to {} failed: {}", handle, reason);
        inner.current = None;
        inner.services.clear();
        if let Err(e) = self.radio.disconnect(&handle).await {
            debug!("Releasing failed link: {}", e);
        }
        if let Err(e) = self.machine.transition(LinkState::Failed(reason.clone())) {
            warn!("{}", e);
        }
        Err(TransportError::ConnectionFailed(reason))
    }

    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.attempt += 1;
        self.release_current(&mut inner).await;
    }

    /// Acknowledged write to `characteristic` of the current peer
    pub async fn send(&self, data: &[u8], characteristic: Uuid) -> Result<(), TransportError> {
        let inner = self.inner.lock().await;
        let handle = self.connected_handle(&inner)?;
        if !inner.has_characteristic(characteristic) {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }

        self.radio
            .write(&handle, characteristic, data)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!("Wrote {} bytes to {}", data.len(), characteristic);
        Ok(())
    }

    /// Requests a read; the value arrives as [`DirectLinkEvent::DataReceived`]
    pub async fn read(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let inner = self.inner.lock().await;
        let handle = self.connected_handle(&inner)?;
        if !inner.has_characteristic(characteristic) {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }

        let radio = self.radio.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match radio.read(&handle, characteristic).await {
                Ok(value) => DirectLinkEvent::DataReceived {
                    characteristic,
                    value,
                },
                Err(e) => {
                    warn!("Read of {} failed: {}", characteristic, e);
                    DirectLinkEvent::ReadFailed {
                        characteristic,
                        reason: e.to_string(),
                    }
                }
            };
            if events.send(event).is_err() {
                debug!("No listeners for read result");
            }
        });
        Ok(())
    }

    fn connected_handle(&self, inner: &DirectLinkInner) -> Result<ConnectionHandle, TransportError> {
        if !self.machine.state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        inner.current_handle().ok_or(TransportError::NotConnected)
    }

    async fn release_current(&self, inner: &mut DirectLinkInner) {
        self.release_link(inner).await;
        self.machine.settle_disconnected();
    }

    /// Drops the current peer link without touching the state
    async fn release_link(&self, inner: &mut DirectLinkInner) {
        if let Some(handle) = inner.current_handle() {
            if let Err(e) = self.radio.disconnect(&handle).await {
                debug!("Releasing {} failed: {}", handle, e);
            }
        }
        inner.current = None;
        inner.services.clear();
    }
}

impl Drop for DirectLinkTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump_radio_events(
    mut radio_events: broadcast::Receiver<RadioEvent>,
    inner: Arc<Mutex<DirectLinkInner>>,
    machine: Arc<ConnectionStateMachine>,
    events: broadcast::Sender<DirectLinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = radio_events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} radio events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let mut state = inner.lock().await;
        let published = match event {
            RadioEvent::PowerChanged(power) => {
                state.power = power;
                if !power.is_on() {
                    invalidate_registry(&mut state, &machine);
                }
                Some(DirectLinkEvent::PowerChanged(power))
            }
            RadioEvent::Advertisement {
                handle,
                name,
                address,
                rssi,
            } => {
                if state.current_handle().as_ref() == Some(&handle) {
                    None
                } else {
                    let peer = state.registry.upsert(handle, name, address, rssi);
                    debug!("Discovered {} ({})", peer.name, peer.key);
                    Some(DirectLinkEvent::PeerDiscovered(peer))
                }
            }
            RadioEvent::Notification {
                handle,
                characteristic,
                value,
            } => (state.current_handle().as_ref() == Some(&handle)).then_some(
                DirectLinkEvent::DataReceived {
                    characteristic,
                    value,
                },
            ),
            RadioEvent::PeerDisconnected { handle, error } => {
                if state.current_handle().as_ref() == Some(&handle) && machine.state().is_connected()
                {
                    state.current = None;
                    state.services.clear();
                    state.attempt += 1;
                    let next = match error {
                        Some(reason) => LinkState::Failed(reason),
                        None => LinkState::Disconnected,
                    };
                    if let Err(e) = machine.transition(next) {
                        warn!("{}", e);
                    }
                }
                None
            }
        };
        drop(state);

        if let Some(event) = published {
            if events.send(event).is_err() {
                debug!("No listeners for direct-link events");
            }
        }
    }
    debug!("Radio event pump stopped");
}

/// Forgets every peer and fails the current link, in one critical section
fn invalidate_registry(state: &mut DirectLinkInner, machine: &ConnectionStateMachine) {
    warn!("Radio left powered-on state, dropping {} peers", state.registry.len());
    state.scanning = None;
    state.registry.clear();
    state.services.clear();
    if state.current.take().is_some() {
        state.attempt += 1;
        let current = machine.state();
        if matches!(current, LinkState::Connected | LinkState::Connecting) {
            if let Err(e) = machine.transition(LinkState::Failed(POWERED_OFF_REASON.to_string())) {
                warn!("{}", e);
            }
        }
    }
}
