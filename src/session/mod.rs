//! # Device Session
//!
//! One session per managed device. It picks the transport(s) the device's
//! capability calls for, owns them exclusively and folds everything they
//! report into one event stream.
//!
//! ```text
//! session/
//! ├── mod.rs      - DeviceSession, SessionEvent, DeliveryReport
//! ├── history.rs  - Most-recent-first ring of inbound messages
//! └── pending.rs  - Sent commands awaiting a correlated response
//! ```
//!
//! ## Routing
//!
//! | Capability | connect        | disconnect     | send_command   |
//! |------------|----------------|----------------|----------------|
//! | BrokerOnly | broker         | broker         | broker         |
//! | DirectOnly | direct link    | direct link    | direct link    |
//! | Both       | broker         | both           | both           |
//!
//! For `Both`, each transport's outcome is reported on its own in a
//! [`DeliveryReport`]; one transport failing never stops delivery on the other.
//!
//! ## Event Flow
//!
//! ```text
//! BrokerTransport ──states/messages──┐
//!                                    ├──► router task ──► SessionState (Mutex)
//! DirectLinkTransport ──states/events┘         │
//!                                              └──► SessionEvent broadcast
//! ```
//!
//! All session-visible mutation happens under the session mutex, either in the
//! router task or in the operation that caused it.

pub mod history;
pub mod pending;

pub use history::{MessageHistory, DEFAULT_HISTORY_CAPACITY};
pub use pending::{PendingCommands, DEFAULT_PENDING_CAPACITY};

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::{DirectLinkEvent, DirectLinkTransport, PeerKey};
use crate::codec;
use crate::error::{SessionError, TransportError};
use crate::link::{LinkState, TransportKind, CANCELLED_REASON};
use crate::model::{Command, ConnectionCapability, Device, DeviceStatus, InboundMessage};
use crate::mqtt::{BrokerConfig, BrokerTransport, Qos};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub history_capacity: usize,
    pub pending_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        transport: TransportKind,
        state: LinkState,
    },
    MessageReceived(InboundMessage),
    /// A tracked command got its response
    CommandResponse(Command),
    TransportError {
        transport: TransportKind,
        error: TransportError,
    },
}

/// Per-transport outcome of one `send_command`
///
/// `None` means the transport was not used for this device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub broker: Option<Result<(), TransportError>>,
    pub direct_link: Option<Result<(), TransportError>>,
}

impl DeliveryReport {
    /// At least one transport accepted the command
    pub fn delivered(&self) -> bool {
        [&self.broker, &self.direct_link]
            .into_iter()
            .flatten()
            .any(Result::is_ok)
    }

    pub fn errors(&self) -> Vec<(TransportKind, &TransportError)> {
        let mut errors = Vec::new();
        if let Some(Err(e)) = &self.broker {
            errors.push((TransportKind::Broker, e));
        }
        if let Some(Err(e)) = &self.direct_link {
            errors.push((TransportKind::DirectLink, e));
        }
        errors
    }
}

struct SessionState {
    device: Device,
    history: MessageHistory,
    pending: PendingCommands,
    peer: Option<PeerKey>,
    last_error: Option<String>,
    /// Broker went through Failed since the last Connected
    broker_recovering: bool,
}

/// State and channels shared between the session handle and its router
struct Shared {
    device_id: String,
    command_topic: Option<String>,
    response_topic: Option<String>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    broker: Option<Arc<BrokerTransport>>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("No observers for session {}", self.device_id);
        }
    }

    /// Records `error` as the session's latest error and publishes it
    async fn report(&self, transport: TransportKind, error: TransportError) {
        if error == TransportError::ConnectionFailed(CANCELLED_REASON.to_string()) {
            debug!("{} attempt for {} was cancelled", transport, self.device_id);
            return;
        }
        warn!("{} {} error: {}", self.device_id, transport, error);
        self.state.lock().await.last_error = Some(format!("{transport}: {error}"));
        self.emit(SessionEvent::TransportError { transport, error });
    }

    async fn subscribe_responses(&self) {
        let (Some(broker), Some(topic)) = (&self.broker, &self.response_topic) else {
            return;
        };
        if let Err(e) = broker.subscribe(topic, Qos::AtLeastOnce).await {
            self.report(TransportKind::Broker, e).await;
        }
    }

    async fn on_state(&self, transport: TransportKind, state: LinkState) {
        let resubscribe = {
            let mut session = self.state.lock().await;
            match &state {
                LinkState::Connected => {
                    session.device.last_connected_at = Some(Utc::now());
                }
                LinkState::Failed(reason) if reason != CANCELLED_REASON => {
                    session.last_error = Some(format!("{transport}: {reason}"));
                }
                _ => {}
            }

            if transport == TransportKind::Broker {
                match &state {
                    LinkState::Failed(_) => {
                        session.broker_recovering = true;
                        false
                    }
                    LinkState::Connected => std::mem::take(&mut session.broker_recovering),
                    LinkState::Disconnected => {
                        session.broker_recovering = false;
                        false
                    }
                    _ => false,
                }
            } else {
                false
            }
        };

        self.emit(SessionEvent::StateChanged { transport, state });
        if resubscribe {
            info!("Broker link of {} recovered, resubscribing", self.device_id);
            self.subscribe_responses().await;
        }
    }

    async fn on_message(&self, message: InboundMessage) {
        let answered = {
            let mut session = self.state.lock().await;
            let answered = codec::response_id(&message.payload)
                .and_then(|id| session.pending.resolve(&id, &message.payload));
            session.history.push(message.clone());
            answered
        };

        self.emit(SessionEvent::MessageReceived(message));
        if let Some(command) = answered {
            debug!("Command {} answered", command.id());
            self.emit(SessionEvent::CommandResponse(command));
        }
    }

    async fn on_direct_link_event(&self, event: DirectLinkEvent) {
        match event {
            DirectLinkEvent::DataReceived { value, .. } => match String::from_utf8(value) {
                Ok(text) => self.on_message(InboundMessage::from_direct_link(text)).await,
                Err(_) => debug!("Dropping non UTF-8 direct-link payload"),
            },
            DirectLinkEvent::ReadFailed { reason, .. } => {
                self.report(TransportKind::DirectLink, TransportError::ReadFailed(reason))
                    .await
            }
            DirectLinkEvent::PowerChanged(power) => debug!("Radio is {}", power),
            DirectLinkEvent::PeerDiscovered(_) => {}
        }
    }
}

enum Incoming {
    BrokerState(Result<LinkState, RecvError>),
    BrokerMessage(Result<InboundMessage, RecvError>),
    DirectLinkState(Result<LinkState, RecvError>),
    DirectLinkEvent(Result<DirectLinkEvent, RecvError>),
}

async fn next<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Unwraps a received value; a closed channel is dropped from the select set
fn accept<T>(
    received: Result<T, RecvError>,
    rx: &mut Option<broadcast::Receiver<T>>,
    label: &str,
) -> Option<T> {
    match received {
        Ok(value) => Some(value),
        Err(RecvError::Lagged(skipped)) => {
            warn!("Session router missed {} {}", skipped, label);
            None
        }
        Err(RecvError::Closed) => {
            debug!("{} channel closed", label);
            *rx = None;
            None
        }
    }
}

struct Streams {
    broker_states: Option<broadcast::Receiver<LinkState>>,
    broker_messages: Option<broadcast::Receiver<InboundMessage>>,
    direct_states: Option<broadcast::Receiver<LinkState>>,
    direct_events: Option<broadcast::Receiver<DirectLinkEvent>>,
}

async fn route(shared: Arc<Shared>, mut streams: Streams, shutdown: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = next(&mut streams.broker_states) => Incoming::BrokerState(r),
            r = next(&mut streams.broker_messages) => Incoming::BrokerMessage(r),
            r = next(&mut streams.direct_states) => Incoming::DirectLinkState(r),
            r = next(&mut streams.direct_events) => Incoming::DirectLinkEvent(r),
        };

        match incoming {
            Incoming::BrokerState(r) => {
                if let Some(state) = accept(r, &mut streams.broker_states, "broker states") {
                    shared.on_state(TransportKind::Broker, state).await;
                }
            }
            Incoming::BrokerMessage(r) => {
                if let Some(message) = accept(r, &mut streams.broker_messages, "broker messages") {
                    shared.on_message(message).await;
                }
            }
            Incoming::DirectLinkState(r) => {
                if let Some(state) = accept(r, &mut streams.direct_states, "direct-link states") {
                    shared.on_state(TransportKind::DirectLink, state).await;
                }
            }
            Incoming::DirectLinkEvent(r) => {
                if let Some(event) = accept(r, &mut streams.direct_events, "direct-link events") {
                    shared.on_direct_link_event(event).await;
                }
            }
        }
    }
    debug!("Session router for {} stopped", shared.device_id);
}

/// Connection manager for one device
pub struct DeviceSession {
    shared: Arc<Shared>,
    capability: ConnectionCapability,
    broker_config: BrokerConfig,
    direct_link: Option<Arc<DirectLinkTransport>>,
    shutdown: CancellationToken,
}

impl DeviceSession {
    /// Validates the device and starts the session's router task
    ///
    /// Transports the capability does not use are ignored.
    pub fn spawn(
        device: Device,
        broker_config: BrokerConfig,
        broker: Option<Arc<BrokerTransport>>,
        direct_link: Option<Arc<DirectLinkTransport>>,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, SessionError> {
        device
            .validate()
            .map_err(|reason| SessionError::InvalidDevice {
                id: device.id.clone(),
                reason,
            })?;

        let capability = device.capability;
        let broker = broker.filter(|_| capability.uses_broker());
        let direct_link = direct_link.filter(|_| capability.uses_direct_link());

        if capability.uses_broker() && broker.is_none() {
            return Err(SessionError::MissingTransport {
                id: device.id.clone(),
                transport: TransportKind::Broker,
            });
        }
        if capability.uses_direct_link() && direct_link.is_none() {
            return Err(SessionError::MissingTransport {
                id: device.id.clone(),
                transport: TransportKind::DirectLink,
            });
        }

        let streams = Streams {
            broker_states: broker.as_ref().map(|b| b.state_changes()),
            broker_messages: broker.as_ref().map(|b| b.messages()),
            direct_states: direct_link.as_ref().map(|d| d.state_changes()),
            direct_events: direct_link.as_ref().map(|d| d.events()),
        };

        let topics = device.topics();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            device_id: device.id.clone(),
            command_topic: topics.as_ref().map(|t| t.command.clone()),
            response_topic: topics.map(|t| t.response),
            state: Mutex::new(SessionState {
                device,
                history: MessageHistory::with_capacity(settings.history_capacity),
                pending: PendingCommands::with_capacity(settings.pending_capacity),
                peer: None,
                last_error: None,
                broker_recovering: false,
            }),
            events,
            broker,
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(route(shared.clone(), streams, shutdown.clone()));
        info!("Session for {} ({}) started", shared.device_id, capability);

        Ok(Arc::new(Self {
            shared,
            capability,
            broker_config,
            direct_link,
            shutdown,
        }))
    }

    pub fn id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn capability(&self) -> ConnectionCapability {
        self.capability
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn broker(&self) -> Option<&Arc<BrokerTransport>> {
        self.shared.broker.as_ref()
    }

    pub fn direct_link(&self) -> Option<&Arc<DirectLinkTransport>> {
        self.direct_link.as_ref()
    }

    /// Connects over the broker, or over the direct link for DirectOnly devices
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.capability.uses_broker() {
            let broker = self.broker_transport()?;
            info!("Connecting {} via {}", self.id(), self.broker_config.url());
            // subscribed below once connected; the router must not do it again
            self.shared.state.lock().await.broker_recovering = false;
            if let Err(e) = broker.connect(&self.broker_config).await {
                self.shared.report(TransportKind::Broker, e.clone()).await;
                return Err(e.into());
            }
            self.shared.subscribe_responses().await;
            return Ok(());
        }

        let direct_link = self.direct_link_transport()?;
        let peer = self
            .shared
            .state
            .lock()
            .await
            .peer
            .ok_or_else(|| SessionError::PeerNotResolved(self.id().to_string()))?;
        info!("Connecting {} via direct link", self.id());
        if let Err(e) = direct_link.connect(peer).await {
            self.shared.report(TransportKind::DirectLink, e.clone()).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Disconnects every transport this session uses
    pub async fn disconnect(&self) {
        if let Some(broker) = &self.shared.broker {
            broker.disconnect().await;
        }
        if let Some(direct_link) = &self.direct_link {
            direct_link.disconnect().await;
        }
        info!("Disconnected {}", self.id());
    }

    /// Encodes and sends `command`, marking it sent if any transport took it
    ///
    /// Single-transport devices return that transport's error. `Both` devices
    /// always return the per-transport report.
    pub async fn send_command(&self, command: &mut Command) -> Result<DeliveryReport, SessionError> {
        let payload = codec::encode(command)?;
        let broker = match self.capability.uses_broker() {
            true => Some((self.broker_transport()?, self.command_topic()?)),
            false => None,
        };
        let direct_link = match self.capability.uses_direct_link() {
            true => Some(self.direct_link_transport()?),
            false => None,
        };

        let characteristic = {
            let mut session = self.shared.state.lock().await;
            let mut tracked = command.clone();
            tracked.mark_sent();
            session.pending.track(tracked);
            session.device.gatt_profile().characteristic
        };

        let mut report = DeliveryReport::default();
        if let Some((broker, topic)) = broker {
            report.broker = Some(broker.publish(topic, &payload, Qos::AtLeastOnce).await);
        }
        if let Some(direct_link) = direct_link {
            report.direct_link = Some(direct_link.send(payload.as_bytes(), characteristic).await);
        }

        for (transport, error) in report.errors() {
            self.shared.report(transport, error.clone()).await;
        }

        if report.delivered() {
            command.mark_sent();
            info!("Sent {} to {}", command.kind(), self.id());
        } else {
            self.shared.state.lock().await.pending.forget(command.id());
        }

        if self.capability != ConnectionCapability::Both {
            if let Some((_, error)) = report.errors().first() {
                return Err(SessionError::Transport((*error).clone()));
            }
        }
        Ok(report)
    }

    /// Asks the device characteristic for its value; it arrives as a message
    pub async fn request_read(&self) -> Result<(), SessionError> {
        let direct_link = self.direct_link_transport()?;
        let characteristic = self.shared.state.lock().await.device.gatt_profile().characteristic;
        if let Err(e) = direct_link.read(characteristic).await {
            self.shared.report(TransportKind::DirectLink, e.clone()).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn attach_peer(&self, peer: PeerKey) {
        self.shared.state.lock().await.peer = Some(peer);
    }

    /// Attaches the discovered peer whose address matches the device's MAC
    ///
    /// Only looks at peers already discovered; it never starts a scan.
    pub async fn resolve_peer_from_discovery(&self) -> Result<PeerKey, SessionError> {
        let direct_link = self.direct_link_transport()?;
        let address = self.shared.state.lock().await.device.mac_address.clone();
        let not_resolved = || SessionError::PeerNotResolved(self.id().to_string());

        let address = address.ok_or_else(not_resolved)?;
        let peer = direct_link
            .find_peer_by_address(&address)
            .await
            .ok_or_else(not_resolved)?;

        debug!("Resolved {} to peer {} ({})", self.id(), peer.key, peer.name);
        self.attach_peer(peer.key).await;
        Ok(peer.key)
    }

    /// Status derived from the live transport states
    pub fn status(&self) -> DeviceStatus {
        let states: Vec<LinkState> = self
            .shared
            .broker
            .iter()
            .map(|b| b.state())
            .chain(self.direct_link.iter().map(|d| d.state()))
            .collect();

        if states.iter().any(LinkState::is_connected) {
            return DeviceStatus::Connected;
        }
        if states.contains(&LinkState::Connecting) {
            return DeviceStatus::Connecting;
        }
        states
            .into_iter()
            .find_map(|state| match state {
                LinkState::Failed(reason) => Some(DeviceStatus::Error(reason)),
                _ => None,
            })
            .unwrap_or(DeviceStatus::Disconnected)
    }

    pub async fn device(&self) -> Device {
        self.shared.state.lock().await.device.clone()
    }

    pub async fn rename(&self, name: &str) -> Result<(), SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::InvalidDevice {
                id: self.id().to_string(),
                reason: "name is empty".to_string(),
            });
        }
        self.shared.state.lock().await.device.name = name.to_string();
        Ok(())
    }

    pub async fn last_error(&self) -> Option<String> {
        self.shared.state.lock().await.last_error.clone()
    }

    pub async fn acknowledge_error(&self) {
        self.shared.state.lock().await.last_error = None;
    }

    /// Inbound messages, most recent first
    pub async fn recent_messages(&self) -> Vec<InboundMessage> {
        self.shared.state.lock().await.history.to_vec()
    }

    pub async fn unread_count(&self) -> usize {
        self.shared.state.lock().await.history.unread_count()
    }

    pub async fn mark_all_read(&self) {
        self.shared.state.lock().await.history.mark_all_read();
    }

    /// Stops the router; transports are left as they are
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn broker_transport(&self) -> Result<&Arc<BrokerTransport>, SessionError> {
        self.shared
            .broker
            .as_ref()
            .ok_or_else(|| SessionError::MissingTransport {
                id: self.id().to_string(),
                transport: TransportKind::Broker,
            })
    }

    fn direct_link_transport(&self) -> Result<&Arc<DirectLinkTransport>, SessionError> {
        self.direct_link
            .as_ref()
            .ok_or_else(|| SessionError::MissingTransport {
                id: self.id().to_string(),
                transport: TransportKind::DirectLink,
            })
    }

    fn command_topic(&self) -> Result<&str, SessionError> {
        self.shared
            .command_topic
            .as_deref()
            .ok_or_else(|| SessionError::InvalidDevice {
                id: self.id().to_string(),
                reason: "no broker topic prefix".to_string(),
            })
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::DriverEvent;
    use crate::model::{CommandKind, DIRECT_LINK_TOPIC};
    use crate::testing::{FakeRadio, MockConnector};
    use serde_json::Value;
    use std::time::Duration;

    fn broker_for(connector: &Arc<MockConnector>) -> Arc<BrokerTransport> {
        Arc::new(BrokerTransport::new(connector.clone()))
    }

    fn broker_device() -> Device {
        Device::new("Greenhouse", ConnectionCapability::BrokerOnly)
            .with_id("d1")
            .with_topic_prefix("esp32/d1")
    }

    fn both_device() -> Device {
        Device::new("Workbench", ConnectionCapability::Both)
            .with_id("d1")
            .with_topic_prefix("esp32/d1")
            .with_mac_address("AA:BB:CC:DD:EE:01")
    }

    fn direct_device() -> Device {
        Device::new("Desk lamp", ConnectionCapability::DirectOnly)
            .with_id("d2")
            .with_mac_address("AA:BB:CC:DD:EE:01")
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<SessionEvent>,
        wanted: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not observed")
    }

    async fn opened(connector: &MockConnector, attempts: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.calls.opens.load(std::sync::atomic::Ordering::SeqCst) < attempts {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("broker connection was not opened");
    }

    #[tokio::test]
    async fn test_spawn_validates_device_and_transports() {
        let connector = MockConnector::accepting();

        let no_prefix = Device::new("x", ConnectionCapability::BrokerOnly);
        let err = DeviceSession::spawn(
            no_prefix,
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::InvalidDevice { .. }));

        let err = DeviceSession::spawn(
            both_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            SessionError::MissingTransport {
                transport: TransportKind::DirectLink,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_both_device_sends_over_both_transports() {
        let connector = MockConnector::accepting();
        let radio = FakeRadio::esp32();
        let direct_link = DirectLinkTransport::spawn(radio.clone()).await;
        let session = DeviceSession::spawn(
            both_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            Some(direct_link),
            SessionSettings::default(),
        )
        .unwrap();

        session.connect().await.unwrap();
        assert_eq!(
            connector.calls.subscribed(),
            vec![("esp32/d1/response".to_string(), Qos::AtLeastOnce)]
        );

        let mut command = Command::new(CommandKind::LedOn, "d1");
        let report = session.send_command(&mut command).await.unwrap();

        let published = connector.calls.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "esp32/d1/command");
        assert_eq!(published[0].2, Qos::AtLeastOnce);
        let body: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(body["id"], command.id());
        assert_eq!(body["type"], "led_on");
        assert_eq!(body["parameters"], serde_json::json!({}));
        assert!(body["timestamp"].is_i64());

        assert_eq!(report.broker, Some(Ok(())));
        assert_eq!(report.direct_link, Some(Err(TransportError::NotConnected)));
        assert_eq!(report.errors().len(), 1);
        assert!(command.is_sent());
        assert_eq!(radio.write_calls(), 0);
        assert_eq!(
            session.last_error().await,
            Some("direct-link: not connected".to_string())
        );
    }

    #[tokio::test]
    async fn test_single_transport_failure_is_returned() {
        let connector = MockConnector::accepting();
        let session = DeviceSession::spawn(
            broker_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .unwrap();

        let mut command = Command::new(CommandKind::LedOff, "d1");
        let err = session.send_command(&mut command).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Transport(TransportError::NotConnected)
        ));
        assert!(!command.is_sent());
        assert_eq!(connector.calls.request_count(), 0);
    }

    #[tokio::test]
    async fn test_history_keeps_latest_fifty_messages() {
        let connector = MockConnector::accepting();
        let session = DeviceSession::spawn(
            broker_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .unwrap();
        session.connect().await.unwrap();
        let mut events = session.subscribe();

        for n in 1..=60 {
            connector
                .inject(DriverEvent::Message {
                    topic: "esp32/d1/response".into(),
                    payload: format!("m{n}").into_bytes(),
                    qos: 1,
                })
                .await;
            next_matching(&mut events, |e| matches!(e, SessionEvent::MessageReceived(_))).await;
        }

        let payloads: Vec<_> = session
            .recent_messages()
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect();
        let expected: Vec<_> = (11..=60).rev().map(|n| format!("m{n}")).collect();
        assert_eq!(payloads, expected);
        assert_eq!(session.unread_count().await, 50);

        session.mark_all_read().await;
        assert_eq!(session.unread_count().await, 0);
    }

    #[tokio::test]
    async fn test_response_is_correlated_with_command() {
        let connector = MockConnector::accepting();
        let session = DeviceSession::spawn(
            broker_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .unwrap();
        session.connect().await.unwrap();
        let mut events = session.subscribe();

        let mut command = Command::new(CommandKind::ReadTemperature, "d1");
        session.send_command(&mut command).await.unwrap();

        let reply = format!(r#"{{"id":"{}","value":21.5}}"#, command.id());
        connector
            .inject(DriverEvent::Message {
                topic: "esp32/d1/response".into(),
                payload: reply.clone().into_bytes(),
                qos: 1,
            })
            .await;

        let event = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::CommandResponse(_))
        })
        .await;
        let SessionEvent::CommandResponse(answered) = event else {
            unreachable!()
        };
        assert_eq!(answered.id(), command.id());
        assert!(answered.is_sent());
        assert_eq!(answered.response(), Some(reply.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_surfaces_as_error_status() {
        let connector = MockConnector::silent();
        let session = DeviceSession::spawn(
            broker_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .unwrap();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::ConnectionFailed(_))
        ));
        assert_eq!(
            session.status(),
            DeviceStatus::Error("connection timed out".into())
        );
        assert!(session
            .last_error()
            .await
            .unwrap()
            .contains("connection timed out"));

        session.acknowledge_error().await;
        assert!(session.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_recovered_broker_link_resubscribes() {
        let connector = MockConnector::accepting();
        let session = DeviceSession::spawn(
            broker_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .unwrap();
        session.connect().await.unwrap();
        let mut events = session.subscribe();

        connector
            .inject(DriverEvent::ConnectionLost("reset by peer".into()))
            .await;
        connector.inject(DriverEvent::Reconnecting).await;
        connector.inject(DriverEvent::Connected).await;
        next_matching(&mut events, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: LinkState::Connected,
                    ..
                }
            )
        })
        .await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.calls.subscribed().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("response topic was not resubscribed");
        assert_eq!(session.status(), DeviceStatus::Connected);
    }

    #[tokio::test]
    async fn test_direct_only_session() {
        let radio = FakeRadio::esp32();
        let direct_link = DirectLinkTransport::spawn(radio.clone()).await;
        let session = DeviceSession::spawn(
            direct_device(),
            BrokerConfig::default(),
            None,
            Some(direct_link.clone()),
            SessionSettings::default(),
        )
        .unwrap();

        assert!(matches!(
            session.connect().await,
            Err(SessionError::PeerNotResolved(_))
        ));
        assert!(matches!(
            session.resolve_peer_from_discovery().await,
            Err(SessionError::PeerNotResolved(_))
        ));

        let mut link_events = direct_link.events();
        radio.advertise("h7", None, Some("aa:bb:cc:dd:ee:01"), Some(-48));
        link_events.recv().await.unwrap();

        session.resolve_peer_from_discovery().await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.status(), DeviceStatus::Connected);

        let mut events = session.subscribe();
        radio.notify("h7", FakeRadio::NOTIFY_UUID, b"button=1");
        let event = next_matching(&mut events, |e| matches!(e, SessionEvent::MessageReceived(_))).await;
        let SessionEvent::MessageReceived(message) = event else {
            unreachable!()
        };
        assert_eq!(message.topic, DIRECT_LINK_TOPIC);
        assert_eq!(message.payload, "button=1");

        radio.set_read_value(b"21.5");
        session.request_read().await.unwrap();
        let event = next_matching(&mut events, |e| matches!(e, SessionEvent::MessageReceived(_))).await;
        let SessionEvent::MessageReceived(message) = event else {
            unreachable!()
        };
        assert_eq!(message.payload, "21.5");

        let mut command = Command::new(CommandKind::LedBlink, "d2")
            .with_parameter("times", 3)
            .unwrap();
        let report = session.send_command(&mut command).await.unwrap();
        assert_eq!(report.direct_link, Some(Ok(())));
        assert!(report.broker.is_none());
        assert_eq!(radio.writes()[0].1, FakeRadio::NOTIFY_UUID);

        session.disconnect().await;
        assert_eq!(session.status(), DeviceStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_read_is_reported() {
        let radio = FakeRadio::esp32();
        let direct_link = DirectLinkTransport::spawn(radio.clone()).await;
        let session = DeviceSession::spawn(
            direct_device(),
            BrokerConfig::default(),
            None,
            Some(direct_link.clone()),
            SessionSettings::default(),
        )
        .unwrap();

        let mut link_events = direct_link.events();
        radio.advertise("h3", Some("ESP32"), Some("AA:BB:CC:DD:EE:01"), Some(-60));
        link_events.recv().await.unwrap();
        session.resolve_peer_from_discovery().await.unwrap();
        session.connect().await.unwrap();

        let mut events = session.subscribe();
        radio.fail_read("gatt error 0x02");
        session.request_read().await.unwrap();

        let event = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::TransportError { .. })
        })
        .await;
        assert_eq!(
            event,
            SessionEvent::TransportError {
                transport: TransportKind::DirectLink,
                error: TransportError::ReadFailed("gatt error 0x02".into()),
            }
        );
        assert_eq!(
            session.last_error().await,
            Some("direct-link: read failed: gatt error 0x02".to_string())
        );
        assert_eq!(radio.read_calls(), 1);
        assert!(session.recent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_after_refusal_subscribes_once() {
        let connector = MockConnector::silent();
        let session = DeviceSession::spawn(
            broker_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            None,
            SessionSettings::default(),
        )
        .unwrap();
        let mut events = session.subscribe();

        let attempt = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        opened(&connector, 1).await;
        connector
            .inject(DriverEvent::Refused("not authorized".into()))
            .await;
        attempt.await.unwrap().unwrap_err();
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::StateChanged { state: LinkState::Failed(_), .. })
        })
        .await;

        let retry = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        opened(&connector, 2).await;
        connector.inject(DriverEvent::Connected).await;
        retry.await.unwrap().unwrap();
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::StateChanged { state: LinkState::Connected, .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            connector.calls.subscribed(),
            vec![("esp32/d1/response".to_string(), Qos::AtLeastOnce)]
        );
    }

    #[tokio::test]
    async fn test_disconnect_both_and_rename() {
        let connector = MockConnector::accepting();
        let direct_link = DirectLinkTransport::spawn(FakeRadio::esp32()).await;
        let session = DeviceSession::spawn(
            both_device(),
            BrokerConfig::default(),
            Some(broker_for(&connector)),
            Some(direct_link),
            SessionSettings::default(),
        )
        .unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.status(), DeviceStatus::Connected);

        session.disconnect().await;
        assert_eq!(session.status(), DeviceStatus::Disconnected);
        assert_eq!(
            session.broker().unwrap().state(),
            LinkState::Disconnected
        );

        session.rename("  Bench rig ").await.unwrap();
        assert_eq!(session.device().await.name, "Bench rig");
        assert!(session.rename("   ").await.is_err());
    }
}
