//! # Device Data Model
//!
//! Plain data types shared by the transports and the session layer:
//!
//! ```text
//! model/
//! ├── mod.rs      - Device, connection capability, capability tags, status
//! ├── command.rs  - Command and the closed set of command kinds
//! └── message.rs  - Inbound messages produced by the transports
//! ```
//!
//! Devices are persisted by an external store (see [`crate::persistence`]). The
//! session layer only reads them, stamps `last_connected_at` and renames them;
//! it never deletes one. Connection status is never stored on the device, it is
//! always derived from the live session.

pub mod command;
pub mod message;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

pub use command::{Command, CommandKind};
pub use message::{InboundMessage, DIRECT_LINK_TOPIC};

/// Service UUID exposed by the reference ESP32 firmware
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Read/write/notify characteristic of the reference ESP32 firmware
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// How a device can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionCapability {
    /// Reachable through the message broker only
    BrokerOnly,
    /// Reachable over the direct wireless link only
    DirectOnly,
    /// Reachable over both transports
    Both,
}

impl ConnectionCapability {
    pub fn uses_broker(self) -> bool {
        matches!(self, Self::BrokerOnly | Self::Both)
    }

    pub fn uses_direct_link(self) -> bool {
        matches!(self, Self::DirectOnly | Self::Both)
    }
}

impl fmt::Display for ConnectionCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokerOnly => write!(f, "broker only"),
            Self::DirectOnly => write!(f, "direct link only"),
            Self::Both => write!(f, "broker + direct link"),
        }
    }
}

/// Feature groups a device firmware implements; drives which commands are offered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTag {
    LedControl,
    SensorReading,
    MotorControl,
    DisplayControl,
    GpioControl,
}

/// Connection status as shown to the user, always derived from live transport state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
    Error(String),
}

/// GATT identifiers used to talk to a device over the direct link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE_UUID,
            characteristic: DEFAULT_CHARACTERISTIC_UUID,
        }
    }
}

/// Broker topics derived from a device's topic prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    /// `{prefix}/command`, where commands are published
    pub command: String,
    /// `{prefix}/response`, subscribed on connect
    pub response: String,
}

impl DeviceTopics {
    pub fn from_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            command: format!("{prefix}/command"),
            response: format!("{prefix}/response"),
        }
    }
}

/// A managed microcontroller peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub capability: ConnectionCapability,
    /// Hardware address used to find the device among direct-link advertisements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_prefix: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<CapabilityTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Overrides [`DEFAULT_SERVICE_UUID`] for non-reference firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_uuid: Option<Uuid>,
    /// Overrides [`DEFAULT_CHARACTERISTIC_UUID`] for non-reference firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characteristic_uuid: Option<Uuid>,
}

impl Device {
    pub fn new(name: impl Into<String>, capability: ConnectionCapability) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            capability,
            mac_address: None,
            topic_prefix: None,
            tags: BTreeSet::new(),
            last_connected_at: None,
            description: None,
            service_uuid: None,
            characteristic_uuid: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_mac_address(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = CapabilityTag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Checks the capability invariants
    ///
    /// A direct-link capable device needs a hardware address, a broker capable
    /// device needs a topic prefix. Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.capability.uses_direct_link() && is_blank(&self.mac_address) {
            return Err(format!(
                "capability '{}' requires a MAC address",
                self.capability
            ));
        }
        if self.capability.uses_broker() && is_blank(&self.topic_prefix) {
            return Err(format!(
                "capability '{}' requires a broker topic prefix",
                self.capability
            ));
        }
        Ok(())
    }

    pub fn topics(&self) -> Option<DeviceTopics> {
        self.topic_prefix
            .as_deref()
            .filter(|prefix| !prefix.trim().is_empty())
            .map(DeviceTopics::from_prefix)
    }

    pub fn gatt_profile(&self) -> GattProfile {
        let defaults = GattProfile::default();
        GattProfile {
            service: self.service_uuid.unwrap_or(defaults.service),
            characteristic: self.characteristic_uuid.unwrap_or(defaults.characteristic),
        }
    }

    /// Command kinds this device's tags make available, in declaration order
    pub fn offered_commands(&self) -> Vec<CommandKind> {
        CommandKind::ALL
            .iter()
            .copied()
            .filter(|kind| match kind.required_tag() {
                Some(tag) => self.tags.contains(&tag),
                None => true,
            })
            .collect()
    }

    /// Case-insensitive comparison against an advertised hardware address
    pub fn matches_address(&self, address: &str) -> bool {
        self.mac_address
            .as_deref()
            .is_some_and(|mac| mac.eq_ignore_ascii_case(address))
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
