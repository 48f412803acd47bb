//! Broker I/O seam and its rumqttc implementation
//!
//! The transport never touches rumqttc directly. It asks a [`BrokerConnector`]
//! for a client plus a stream of [`DriverEvent`]s, which keeps the connection
//! logic testable with synthetic events.
//!
//! # Reconnect policy
//!
//! ```text
//! poll ──► ConnAck ok ──► Connected ──► ... ──► io error ──► ConnectionLost
//!                                                   │
//!                          Reconnecting ◄── sleep(reconnect interval)
//! ```
//!
//! A network timeout before the first ConnAck keeps the driver polling, so a
//! slow broker still reaches Connected after the caller gave up waiting. Any
//! other error before the first ConnAck ends the driver; the caller decides
//! whether to retry. After the first ConnAck every error is followed by a
//! fixed-interval retry until the shutdown token fires.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::BrokerConfig;
use crate::error::TransportError;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How long one network connect may wait for its ConnAck; outlasts the
/// transport's connect timeout so late acknowledgements still arrive
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// MQTT delivery quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    /// Out-of-range levels fall back to at-least-once
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::AtMostOnce,
            2 => Self::ExactlyOnce,
            _ => Self::AtLeastOnce,
        }
    }
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// What the driver observed on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Broker accepted the session
    Connected,
    /// Initial connection could not be established
    Refused(String),
    /// An established link dropped; a retry follows
    ConnectionLost(String),
    /// The driver is about to retry after a lost link
    Reconnecting,
    /// The broker closed the session cleanly; no retry follows
    Closed,
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
    },
}

/// The client rejected a request before it reached the network
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

/// Request side of one broker connection
pub trait BrokerClient: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), DriverError>;
    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), DriverError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), DriverError>;
    fn disconnect(&self) -> Result<(), DriverError>;
}

pub type DriverHandle = (Box<dyn BrokerClient>, mpsc::Receiver<DriverEvent>);

/// Opens broker connections; one call per connect attempt
pub trait BrokerConnector: Send + Sync {
    /// Starts connecting in the background and returns immediately
    ///
    /// The driver must stop producing events once `shutdown` is cancelled.
    fn open(
        &self,
        config: &BrokerConfig,
        shutdown: CancellationToken,
    ) -> Result<DriverHandle, TransportError>;
}

/// [`BrokerConnector`] backed by rumqttc
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    reconnect_interval: Duration,
    network_timeout: Duration,
}

impl Default for RumqttConnector {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_INTERVAL)
    }
}

impl RumqttConnector {
    pub fn new(reconnect_interval: Duration) -> Self {
        Self {
            reconnect_interval,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    /// Bound on TCP/TLS connect plus ConnAck, rounded up to whole seconds
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    fn network_timeout_secs(&self) -> u64 {
        let secs = self.network_timeout.as_secs();
        if self.network_timeout.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

impl BrokerConnector for RumqttConnector {
    fn open(
        &self,
        config: &BrokerConfig,
        shutdown: CancellationToken,
    ) -> Result<DriverHandle, TransportError> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some((user, password)) = config.credentials() {
            options.set_credentials(user, password);
        }
        if config.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        eventloop
            .network_options
            .set_connection_timeout(self.network_timeout_secs());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        info!("Opening broker connection to {}", config.url());
        tokio::spawn(drive_event_loop(
            eventloop,
            events_tx,
            shutdown,
            self.reconnect_interval,
        ));

        Ok((Box::new(RumqttClient { client }), events_rx))
    }
}

struct RumqttClient {
    client: AsyncClient,
}

impl BrokerClient for RumqttClient {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), DriverError> {
        self.client
            .try_publish(topic, qos.into(), false, payload.to_vec())
            .map_err(|e| DriverError(e.to_string()))
    }

    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), DriverError> {
        self.client
            .try_subscribe(topic, qos.into())
            .map_err(|e| DriverError(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), DriverError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| DriverError(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        self.client
            .try_disconnect()
            .map_err(|e| DriverError(e.to_string()))
    }
}

/// Polls the rumqttc event loop until shutdown, translating what it sees
async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<DriverEvent>,
    shutdown: CancellationToken,
    reconnect_interval: Duration,
) {
    let mut connected_once = false;

    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected_once = true;
                    DriverEvent::Connected
                } else {
                    DriverEvent::Refused(format!("connection refused: {:?}", ack.code))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => DriverEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
                qos: qos_level(publish.qos),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => DriverEvent::Closed,
            Ok(other) => {
                debug!("Broker event: {:?}", other);
                continue;
            }
            Err(e) if connected_once => DriverEvent::ConnectionLost(e.to_string()),
            Err(ConnectionError::NetworkTimeout) => {
                warn!("No ConnAck from broker yet, connecting again");
                continue;
            }
            Err(e) => DriverEvent::Refused(e.to_string()),
        };

        let stop = matches!(event, DriverEvent::Refused(_) | DriverEvent::Closed);
        let lost = matches!(event, DriverEvent::ConnectionLost(_));

        if events.send(event).await.is_err() {
            debug!("Driver event receiver dropped, stopping event loop");
            break;
        }
        if stop {
            break;
        }
        if lost {
            warn!(
                "Broker link lost, retrying in {}s",
                reconnect_interval.as_secs()
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(reconnect_interval) => {}
            }
            if events.send(DriverEvent::Reconnecting).await.is_err() {
                break;
            }
        }
    }

    if shutdown.is_cancelled() {
        debug!("Broker event loop shut down");
    } else if !connected_once {
        error!("Broker event loop ended before the first ConnAck");
    }
}
