//! Command envelope codec
//!
//! Maps a [`Command`] to the flat JSON object every device firmware understands
//! and back:
//!
//! ```text
//! {"id": "<string>", "type": "<kind>", "parameters": {..}, "timestamp": <epoch seconds>}
//! ```
//!
//! Decoding is used when re-hydrating device responses. Payloads that are not
//! an envelope are not an error for the session, they are kept as opaque text.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{Command, CommandKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Local serialization failure; nothing is transmitted
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: CommandKind,
    parameters: &'a Map<String, Value>,
    timestamp: i64,
}

/// A decoded command envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub timestamp: i64,
}

impl Envelope {
    /// Rebuilds a command addressed to `device_id`
    pub fn into_command(self, device_id: impl Into<String>) -> Result<Command, CodecError> {
        let created_at = Utc
            .timestamp_opt(self.timestamp, 0)
            .single()
            .ok_or_else(|| CodecError::Decoding(format!("timestamp {} out of range", self.timestamp)))?;

        Ok(Command::from_parts(
            self.id,
            self.kind,
            self.parameters,
            device_id.into(),
            created_at,
        ))
    }
}

pub fn encode(command: &Command) -> Result<String, CodecError> {
    let envelope = EnvelopeRef {
        id: command.id(),
        kind: command.kind(),
        parameters: command.parameters(),
        timestamp: command.created_at().timestamp(),
    };
    serde_json::to_string(&envelope).map_err(|e| CodecError::Encoding(e.to_string()))
}

pub fn decode(payload: &str) -> Result<Envelope, CodecError> {
    serde_json::from_str(payload).map_err(|e| CodecError::Decoding(e.to_string()))
}

/// Command id a device response refers to
///
/// Firmware answers with either a full envelope or a smaller object such as
/// `{"id": "..", "status": "ok"}`; both carry the id of the command.
pub fn response_id(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}
