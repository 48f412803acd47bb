//! # Broker Transport
//!
//! MQTT publish/subscribe for devices reachable through a broker.
//!
//! ```text
//! mqtt/
//! ├── config.rs     - Broker connection parameters and validation
//! ├── driver.rs     - Connector/client seam and the rumqttc event loop driver
//! └── transport.rs  - BrokerTransport: connect with timeout, publish, subscribe
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! rumqttc EventLoop ──► driver task ──DriverEvent──► router task ──► state machine
//!                                                         │
//!                                                         └──► InboundMessage stream
//! BrokerTransport::publish ──► BrokerClient (non-blocking request queue)
//! ```
//!
//! Each connect attempt gets its own driver and router. Tearing an attempt
//! down cancels both, and events that still arrive from an older attempt are
//! ignored.

pub mod config;
pub mod driver;
pub mod transport;

pub use config::BrokerConfig;
pub use driver::{
    BrokerClient, BrokerConnector, DriverError, DriverEvent, Qos, RumqttConnector,
    DEFAULT_NETWORK_TIMEOUT, DEFAULT_RECONNECT_INTERVAL,
};
pub use transport::{BrokerTransport, DEFAULT_CONNECT_TIMEOUT};
