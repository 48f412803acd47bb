//! Error definitions shared by both transports and the device session

use thiserror::Error;
use uuid::Uuid;

use crate::codec::CodecError;
use crate::link::TransportKind;

/// Failures reported by the broker and direct-link transports
///
/// Every variant is returned from the operation that detected it. Failures that
/// affect the connection status are additionally published as a `Failed`
/// transition on the transport's state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Malformed connect parameters, never retried automatically
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The operation needs a live connection and there is none
    #[error("not connected")]
    NotConnected,

    /// Transport-level failure, surfaced as a `Failed` state
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("characteristic {0} not found on the connected peer")]
    CharacteristicNotFound(Uuid),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The radio rejected a scan request
    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),
}

/// Failures of the per-device session layer
#[derive(Debug, Error)]
pub enum SessionError {
    /// Device record violates its capability invariants
    #[error("invalid device {id}: {reason}")]
    InvalidDevice { id: String, reason: String },

    /// The session was built without a transport its capability requires
    #[error("session for {id} has no {transport} transport")]
    MissingTransport { id: String, transport: TransportKind },

    /// Direct-link connect was requested before a discovered peer was attached
    #[error("no direct-link peer resolved for {0}; scan and attach a peer first")]
    PeerNotResolved(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
