use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::BrokerConfig;
use super::driver::{BrokerClient, BrokerConnector, DriverEvent, Qos};
use crate::error::TransportError;
use crate::link::{
    race_connect, ConnectResolution, ConnectionStateMachine, LinkState, TransportKind,
    TIMEOUT_REASON,
};
use crate::model::InboundMessage;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MESSAGE_BUFFER: usize = 128;

/// Everything that belongs to the current connect attempt
#[derive(Default)]
struct BrokerLink {
    attempt: u64,
    client: Option<Box<dyn BrokerClient>>,
    shutdown: Option<CancellationToken>,
    config: Option<BrokerConfig>,
}

/// Publish/subscribe client for one broker connection
///
/// Owned by exactly one session. All I/O goes through the [`BrokerConnector`]
/// seam, connection status through a [`ConnectionStateMachine`].
pub struct BrokerTransport {
    connector: Arc<dyn BrokerConnector>,
    machine: Arc<ConnectionStateMachine>,
    link: Arc<Mutex<BrokerLink>>,
    messages: broadcast::Sender<InboundMessage>,
    connect_timeout: Duration,
}

impl BrokerTransport {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            connector,
            machine: Arc::new(ConnectionStateMachine::new(TransportKind::Broker)),
            link: Arc::new(Mutex::new(BrokerLink::default())),
            messages,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn state(&self) -> LinkState {
        self.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.machine.state().is_connected()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<LinkState> {
        self.machine.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.machine.watch()
    }

    /// Inbound messages with UTF-8 payloads
    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    /// Parameters of the current attempt, if any
    pub async fn config(&self) -> Option<BrokerConfig> {
        self.link.lock().await.config.clone()
    }

    /// Connects with `config`, tearing down any existing connection first
    ///
    /// Returns once the attempt reached Connected or Failed, or the connect
    /// timeout elapsed. A timeout leaves the driver running, so a late ConnAck
    /// still drives the state to Connected.
    pub async fn connect(&self, config: &BrokerConfig) -> Result<(), TransportError> {
        config.validate()?;

        let (attempt, transitions) = {
            let mut link = self.link.lock().await;
            self.release(&mut link);
            if !self.machine.state().is_failed() {
                self.machine.settle_disconnected();
            }
            link.attempt += 1;
            let attempt = link.attempt;

            let transitions = self.machine.subscribe();
            if let Err(e) = self.machine.transition(LinkState::Connecting) {
                warn!("Broker connect from unexpected state: {}", e);
            }

            let shutdown = CancellationToken::new();
            let (client, events) = match self.connector.open(config, shutdown.clone()) {
                Ok(opened) => opened,
                Err(e) => {
                    let reason = failure_reason(&e);
                    if let Err(invalid) = self.machine.transition(LinkState::Failed(reason)) {
                        warn!("{}", invalid);
                    }
                    return Err(e);
                }
            };

            link.client = Some(client);
            link.shutdown = Some(shutdown.clone());
            link.config = Some(config.clone());

            tokio::spawn(route_driver_events(
                attempt,
                events,
                shutdown,
                self.link.clone(),
                self.machine.clone(),
                self.messages.clone(),
            ));

            (attempt, transitions)
        };

        match race_connect(transitions, self.connect_timeout).await {
            ConnectResolution::Connected => {
                info!("Connected to broker {}", config.url());
                Ok(())
            }
            ConnectResolution::Failed(reason) => {
                warn!("Broker connection to {} failed: {}", config.url(), reason);
                Err(TransportError::ConnectionFailed(reason))
            }
            ConnectResolution::TimedOut => {
                let link = self.link.lock().await;
                if link.attempt == attempt && self.machine.state() == LinkState::Connecting {
                    if let Err(e) = self
                        .machine
                        .transition(LinkState::Failed(TIMEOUT_REASON.to_string()))
                    {
                        warn!("{}", e);
                    }
                }
                warn!(
                    "Broker connection to {} timed out after {}s",
                    config.url(),
                    self.connect_timeout.as_secs()
                );
                Err(TransportError::ConnectionFailed(TIMEOUT_REASON.to_string()))
            }
        }
    }

    /// Closes the connection or cancels a pending attempt
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        link.attempt += 1;
        self.teardown(&mut link);
    }

    pub async fn publish(&self, topic: &str, payload: &str, qos: Qos) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        let client = self.connected_client(&link)?;
        client
            .publish(topic, payload.as_bytes(), qos)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        debug!("Published {} bytes to {}", payload.len(), topic);
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        let client = self.connected_client(&link)?;
        client
            .subscribe(topic, qos)
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        info!("Subscribed to {}", topic);
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        let client = self.connected_client(&link)?;
        client
            .unsubscribe(topic)
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        info!("Unsubscribed from {}", topic);
        Ok(())
    }

    fn connected_client<'a>(
        &self,
        link: &'a BrokerLink,
    ) -> Result<&'a dyn BrokerClient, TransportError> {
        match &link.client {
            Some(client) if self.machine.state().is_connected() => Ok(client.as_ref()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn teardown(&self, link: &mut BrokerLink) {
        self.release(link);
        self.machine.settle_disconnected();
    }

    /// Stops the driver and drops the client without touching the state
    fn release(&self, link: &mut BrokerLink) {
        if let Some(shutdown) = link.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(client) = link.client.take() {
            if let Err(e) = client.disconnect() {
                debug!("Broker client disconnect: {}", e);
            }
        }
        link.config = None;
    }
}

fn failure_reason(error: &TransportError) -> String {
    match error {
        TransportError::ConnectionFailed(reason) => reason.clone(),
        other => other.to_string(),
    }
}

/// Applies driver events of one attempt to the state machine
async fn route_driver_events(
    attempt: u64,
    mut events: mpsc::Receiver<DriverEvent>,
    shutdown: CancellationToken,
    link: Arc<Mutex<BrokerLink>>,
    machine: Arc<ConnectionStateMachine>,
    messages: broadcast::Sender<InboundMessage>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut current = link.lock().await;
        if current.attempt != attempt {
            debug!("Ignoring {:?} from stale attempt {}", event, attempt);
            break;
        }

        let applied = match event {
            DriverEvent::Message { topic, payload, qos } => {
                match String::from_utf8(payload) {
                    Ok(text) => {
                        if messages.send(InboundMessage::from_topic(topic, text, qos)).is_err() {
                            debug!("No listeners for broker messages");
                        }
                    }
                    Err(_) => debug!("Dropping non UTF-8 payload on {}", topic),
                }
                Ok(())
            }
            DriverEvent::Connected => machine.reach_connected(),
            DriverEvent::Refused(reason) | DriverEvent::ConnectionLost(reason) => {
                machine.transition(LinkState::Failed(reason))
            }
            DriverEvent::Reconnecting if machine.state().is_failed() => {
                machine.transition(LinkState::Connecting)
            }
            DriverEvent::Reconnecting => Ok(()),
            DriverEvent::Closed => {
                current.client = None;
                machine.transition(LinkState::Disconnected)
            }
        };

        if let Err(e) = applied {
            warn!("Ignoring driver event: {}", e);
        }
    }

    debug!("Driver router for attempt {} stopped", attempt);
}
