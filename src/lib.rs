//! # esplink
//!
//! Manages ESP32-class devices over two transports, an MQTT broker and a
//! direct BLE link, behind one session per device.
//!
//! ```text
//! lib
//! ├── model        - Device, Command, InboundMessage
//! ├── codec        - JSON command envelope
//! ├── link         - Connection state machine and connect race
//! ├── mqtt         - Broker transport (rumqttc)
//! ├── ble          - Direct-link transport (btleplug)
//! ├── session      - Per-device session over both transports
//! ├── persistence  - Device and broker settings store
//! └── config       - Application settings
//! ```

pub mod ble;
pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod model;
pub mod mqtt;
pub mod persistence;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use error::{SessionError, TransportError};
pub use link::{LinkState, TransportKind};
pub use model::{Command, CommandKind, ConnectionCapability, Device, DeviceStatus};
pub use session::{DeliveryReport, DeviceSession, SessionEvent, SessionSettings};
