use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Opaque per-radio identifier of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(String);

impl ConnectionHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioPower {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioPower {
    pub fn is_on(self) -> bool {
        self == Self::PoweredOn
    }
}

impl fmt::Display for RadioPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "powered off",
            Self::PoweredOn => "powered on",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Unsolicited radio activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    PowerChanged(RadioPower),
    Advertisement {
        handle: ConnectionHandle,
        name: Option<String>,
        address: Option<String>,
        rssi: Option<i16>,
    },
    Notification {
        handle: ConnectionHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// `error` is `None` for a clean remote close
    PeerDisconnected {
        handle: ConnectionHandle,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("unknown peripheral {0}")]
    UnknownPeer(ConnectionHandle),

    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    #[error("{0}")]
    Backend(String),
}

/// Central-role radio operations used by the direct-link transport
#[async_trait]
pub trait Radio: Send + Sync {
    async fn power(&self) -> RadioPower;

    /// Empty `services` scans for every advertiser
    async fn start_scan(&self, services: &[Uuid]) -> Result<(), RadioError>;
    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn connect(&self, handle: &ConnectionHandle) -> Result<(), RadioError>;
    async fn discover_services(&self, handle: &ConnectionHandle)
        -> Result<Vec<GattService>, RadioError>;
    async fn subscribe(&self, handle: &ConnectionHandle, characteristic: Uuid)
        -> Result<(), RadioError>;

    /// Acknowledged write
    async fn write(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), RadioError>;
    async fn read(&self, handle: &ConnectionHandle, characteristic: Uuid)
        -> Result<Vec<u8>, RadioError>;
    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), RadioError>;

    fn events(&self) -> broadcast::Receiver<RadioEvent>;
}
